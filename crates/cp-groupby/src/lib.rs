#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use cp_types::{ColumnKey, Record, RowKey, STARTTIME_FIELD, TypeError, UPTIME_FIELD};
use cp_uptime::{UptimeMode, resolve_uptime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Output shape requested from an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    /// Wide table: one column per discovered column key.
    Pivot { column_fields: Vec<String> },
    /// Row keys with a single implicit `count` column.
    RowCount,
    /// Row keys plus the derived uptime value and a `count` column.
    UptimeTally,
}

impl Layout {
    #[must_use]
    pub fn is_pivot(&self) -> bool {
        matches!(self, Self::Pivot { .. })
    }

    #[must_use]
    pub fn column_fields(&self) -> &[String] {
        match self {
            Self::Pivot { column_fields } => column_fields,
            Self::RowCount | Self::UptimeTally => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("pivot layout requires at least one column field")]
    NoColumnFields,
    #[error("layout requires at least one row field")]
    NoRowFields,
    #[error("field names must not be empty")]
    EmptyFieldName,
    #[error("'{field}' column missing from input")]
    MissingSourceField { field: String },
    #[error("count shape mismatch: {0}")]
    ShapeMismatch(&'static str),
    #[error("record source failed")]
    Source(#[source] Box<dyn StdError + Send + Sync>),
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl AggregateError {
    pub fn source_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Source(Box::new(err))
    }
}

/// Everything an aggregation strategy needs besides the records themselves.
///
/// `now` is the reference instant for the derived uptime field; it is read
/// once by the caller so every record in a run sees the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRequest {
    pub row_fields: Vec<String>,
    pub layout: Layout,
    pub include_invalid: bool,
    pub uptime_mode: UptimeMode,
    pub now: DateTime<Utc>,
}

impl AggregationRequest {
    #[must_use]
    pub fn pivot(row_fields: Vec<String>, column_fields: Vec<String>, now: DateTime<Utc>) -> Self {
        Self::new(row_fields, Layout::Pivot { column_fields }, now)
    }

    #[must_use]
    pub fn row_count(row_fields: Vec<String>, now: DateTime<Utc>) -> Self {
        Self::new(row_fields, Layout::RowCount, now)
    }

    #[must_use]
    pub fn uptime_tally(row_fields: Vec<String>, now: DateTime<Utc>) -> Self {
        Self::new(row_fields, Layout::UptimeTally, now)
    }

    #[must_use]
    pub fn new(row_fields: Vec<String>, layout: Layout, now: DateTime<Utc>) -> Self {
        Self {
            row_fields,
            layout,
            include_invalid: false,
            uptime_mode: UptimeMode::Bucket,
            now,
        }
    }

    #[must_use]
    pub fn with_include_invalid(mut self, include_invalid: bool) -> Self {
        self.include_invalid = include_invalid;
        self
    }

    #[must_use]
    pub fn with_uptime_mode(mut self, uptime_mode: UptimeMode) -> Self {
        self.uptime_mode = uptime_mode;
        self
    }

    pub fn validate(&self) -> Result<(), AggregateError> {
        let mut all_fields = self.row_fields.iter().chain(self.layout.column_fields());
        if all_fields.any(String::is_empty) {
            return Err(AggregateError::EmptyFieldName);
        }
        match &self.layout {
            Layout::Pivot { column_fields } if column_fields.is_empty() => {
                Err(AggregateError::NoColumnFields)
            }
            Layout::Pivot { .. } | Layout::RowCount if self.row_fields.is_empty() => {
                Err(AggregateError::NoRowFields)
            }
            _ => Ok(()),
        }
    }

    /// Check header-level requirements before any record is read. The tally
    /// layout cannot work without a `starttime` column.
    pub fn check_source_fields(&self, headers: &[String]) -> Result<(), AggregateError> {
        if matches!(self.layout, Layout::UptimeTally)
            && !headers.iter().any(|name| name == STARTTIME_FIELD)
        {
            return Err(AggregateError::MissingSourceField {
                field: STARTTIME_FIELD.to_owned(),
            });
        }
        Ok(())
    }
}

/// Where one column-key part comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    Field(String),
    Uptime,
}

impl ColumnSource {
    #[must_use]
    pub fn from_field(name: &str) -> Self {
        if name == UPTIME_FIELD {
            Self::Uptime
        } else {
            Self::Field(name.to_owned())
        }
    }
}

/// Outcome of composing keys for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composition {
    Counted {
        row: RowKey,
        column: Option<ColumnKey>,
    },
    /// A column part (or the tally's derived value) was null, empty, or a
    /// suppressed `invalid`.
    Excluded,
    /// A configured row field is absent; the record is skipped entirely.
    MissingRowField { field: String },
}

#[derive(Debug, Clone)]
pub struct KeyComposer<'a> {
    request: &'a AggregationRequest,
    columns: Vec<ColumnSource>,
}

impl<'a> KeyComposer<'a> {
    #[must_use]
    pub fn new(request: &'a AggregationRequest) -> Self {
        let columns = request
            .layout
            .column_fields()
            .iter()
            .map(|name| ColumnSource::from_field(name))
            .collect();
        Self { request, columns }
    }

    #[must_use]
    pub fn column_sources(&self) -> &[ColumnSource] {
        &self.columns
    }

    /// Derived uptime label, or `None` when it resolves to a suppressed
    /// `invalid`.
    #[must_use]
    pub fn derived_uptime(&self, record: &Record) -> Option<String> {
        resolve_uptime(
            record.get(STARTTIME_FIELD),
            self.request.now,
            self.request.uptime_mode,
        )
        .label_with_policy(self.request.include_invalid)
    }

    /// Value of one column part, `None` when it excludes the record.
    #[must_use]
    pub fn column_part(&self, record: &Record, source: &ColumnSource) -> Option<String> {
        match source {
            ColumnSource::Uptime => self.derived_uptime(record),
            ColumnSource::Field(name) => record
                .get(name)
                .filter(|value| !value.is_empty())
                .map(str::to_owned),
        }
    }

    /// Column key in configured field order. Evaluation stops at the first
    /// part that excludes the record.
    #[must_use]
    pub fn column_key(&self, record: &Record) -> Option<ColumnKey> {
        let mut parts = Vec::with_capacity(self.columns.len());
        for source in &self.columns {
            parts.push(self.column_part(record, source)?);
        }
        ColumnKey::from_parts(&parts).ok()
    }

    /// Row key in configured order, or the name of the first absent field.
    pub fn row_key(&self, record: &Record) -> Result<RowKey, String> {
        self.request
            .row_fields
            .iter()
            .map(|field| {
                record
                    .get(field)
                    .map(str::to_owned)
                    .ok_or_else(|| field.clone())
            })
            .collect::<Result<Vec<_>, _>>()
            .map(RowKey::new)
    }

    #[must_use]
    pub fn compose(&self, record: &Record) -> Composition {
        match &self.request.layout {
            Layout::Pivot { .. } => {
                let Some(column) = self.column_key(record) else {
                    return Composition::Excluded;
                };
                match self.row_key(record) {
                    Ok(row) => Composition::Counted {
                        row,
                        column: Some(column),
                    },
                    Err(field) => Composition::MissingRowField { field },
                }
            }
            Layout::RowCount => match self.row_key(record) {
                Ok(row) => Composition::Counted { row, column: None },
                Err(field) => Composition::MissingRowField { field },
            },
            Layout::UptimeTally => {
                let row = match self.row_key(record) {
                    Ok(row) => row,
                    Err(field) => return Composition::MissingRowField { field },
                };
                match self.derived_uptime(record) {
                    Some(uptime) => Composition::Counted {
                        row: row.with_suffix(uptime),
                        column: None,
                    },
                    None => Composition::Excluded,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub row_number: usize,
    pub missing_field: String,
}

/// Collects records skipped because of a missing row field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureLog {
    skipped: Vec<SkippedRecord>,
}

impl FailureLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_missing_field(&mut self, row_number: usize, field: impl Into<String>) {
        let field = field.into();
        debug!("Missing field '{field}' at row {row_number}. Skipping row.");
        self.skipped.push(SkippedRecord {
            row_number,
            missing_field: field,
        });
    }

    #[must_use]
    pub fn skipped(&self) -> &[SkippedRecord] {
        &self.skipped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.skipped.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.skipped.is_empty()
    }

    #[must_use]
    pub fn into_skipped(self) -> Vec<SkippedRecord> {
        self.skipped
    }
}

/// Finalized counts. Both maps are ordered, so iteration yields row keys by
/// tuple comparison and column keys lexicographically on their display form.
///
/// Zero cells are never stored. Memory grows with the number of distinct
/// (row key, column key) pairs, not with the number of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCounts {
    Pivot {
        columns: BTreeSet<ColumnKey>,
        cells: BTreeMap<RowKey, BTreeMap<ColumnKey, u64>>,
    },
    Flat {
        cells: BTreeMap<RowKey, u64>,
    },
}

impl GroupCounts {
    #[must_use]
    pub fn empty_for(layout: &Layout) -> Self {
        if layout.is_pivot() {
            Self::Pivot {
                columns: BTreeSet::new(),
                cells: BTreeMap::new(),
            }
        } else {
            Self::Flat {
                cells: BTreeMap::new(),
            }
        }
    }

    /// Add the discovered column set up front, before any counts.
    pub fn declare_column(&mut self, column: ColumnKey) -> Result<(), AggregateError> {
        match self {
            Self::Pivot { columns, .. } => {
                columns.insert(column);
                Ok(())
            }
            Self::Flat { .. } => Err(AggregateError::ShapeMismatch(
                "flat counts have no column dimension",
            )),
        }
    }

    pub fn add(
        &mut self,
        row: RowKey,
        column: Option<ColumnKey>,
        count: u64,
    ) -> Result<(), AggregateError> {
        if count == 0 {
            return Ok(());
        }
        match (self, column) {
            (Self::Pivot { columns, cells }, Some(column)) => {
                columns.insert(column.clone());
                *cells.entry(row).or_default().entry(column).or_insert(0) += count;
                Ok(())
            }
            (Self::Flat { cells }, None) => {
                *cells.entry(row).or_insert(0) += count;
                Ok(())
            }
            (Self::Pivot { .. }, None) => Err(AggregateError::ShapeMismatch(
                "pivot counts require a column key",
            )),
            (Self::Flat { .. }, Some(_)) => Err(AggregateError::ShapeMismatch(
                "flat counts take no column key",
            )),
        }
    }

    #[must_use]
    pub fn row_keys(&self) -> Vec<&RowKey> {
        match self {
            Self::Pivot { cells, .. } => cells.keys().collect(),
            Self::Flat { cells } => cells.keys().collect(),
        }
    }

    #[must_use]
    pub fn column_keys(&self) -> Vec<&ColumnKey> {
        match self {
            Self::Pivot { columns, .. } => columns.iter().collect(),
            Self::Flat { .. } => Vec::new(),
        }
    }

    #[must_use]
    pub fn count(&self, row: &RowKey, column: Option<&ColumnKey>) -> u64 {
        match (self, column) {
            (Self::Pivot { cells, .. }, Some(column)) => cells
                .get(row)
                .and_then(|by_column| by_column.get(column))
                .copied()
                .unwrap_or(0),
            (Self::Flat { cells }, None) => cells.get(row).copied().unwrap_or(0),
            _ => 0,
        }
    }

    #[must_use]
    pub fn row_total(&self, row: &RowKey) -> u64 {
        match self {
            Self::Pivot { cells, .. } => cells
                .get(row)
                .map_or(0, |by_column| by_column.values().sum()),
            Self::Flat { cells } => cells.get(row).copied().unwrap_or(0),
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        match self {
            Self::Pivot { cells, .. } => cells.values().flat_map(BTreeMap::values).sum(),
            Self::Flat { cells } => cells.values().sum(),
        }
    }

    #[must_use]
    pub fn row_len(&self) -> usize {
        match self {
            Self::Pivot { cells, .. } => cells.len(),
            Self::Flat { cells } => cells.len(),
        }
    }

    /// True for a pivot whose discovered column set is empty.
    #[must_use]
    pub fn has_no_columns(&self) -> bool {
        matches!(self, Self::Pivot { columns, .. } if columns.is_empty())
    }
}

/// The aggregation contract shared by the in-memory and query-compiling
/// strategies. Given identical records and requests, implementations must
/// return identical [`GroupCounts`] and identical skip logs.
pub trait Aggregator {
    type Error: StdError + From<AggregateError>;

    fn name(&self) -> &'static str;

    fn aggregate<I, E>(
        &self,
        records: I,
        request: &AggregationRequest,
        failures: &mut FailureLog,
    ) -> Result<GroupCounts, Self::Error>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: StdError + Send + Sync + 'static;
}

/// Single pass over the record stream into a nested counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryAggregator;

impl Aggregator for InMemoryAggregator {
    type Error = AggregateError;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn aggregate<I, E>(
        &self,
        records: I,
        request: &AggregationRequest,
        failures: &mut FailureLog,
    ) -> Result<GroupCounts, AggregateError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: StdError + Send + Sync + 'static,
    {
        request.validate()?;
        let composer = KeyComposer::new(request);
        let mut counts = GroupCounts::empty_for(&request.layout);

        for record in records {
            let record = record.map_err(AggregateError::source_error)?;
            match composer.compose(&record) {
                Composition::Counted { row, column } => counts.add(row, column, 1)?,
                Composition::Excluded => {}
                Composition::MissingRowField { field } => {
                    failures.record_missing_field(record.row_number(), field);
                }
            }
        }

        debug!(
            rows = counts.row_len(),
            columns = counts.column_keys().len(),
            skipped = failures.len(),
            "in-memory aggregation finished"
        );
        Ok(counts)
    }
}
