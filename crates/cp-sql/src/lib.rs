#![forbid(unsafe_code)]

//! Aggregation by compiling the request into SQL over a staged table.
//!
//! Records are appended into a single all-`VARCHAR` table, one column per
//! distinct source field plus the derived `uptime` column when the request
//! needs it. The derived value is computed in Rust before staging so that
//! both strategies share one definition of it; the staged value is `NULL`
//! whenever the in-memory path would exclude the record.
//!
//! Every identifier goes through [`quote_identifier`]. Discovered column
//! values are bound as query parameters; the few constant literals in the
//! generated text go through [`escape_literal`]. Input text is never spliced
//! into a query raw.

use std::collections::BTreeSet;
use std::error::Error as StdError;

use cp_groupby::{
    AggregateError, AggregationRequest, Aggregator, ColumnSource, Composition, FailureLog,
    GroupCounts, KeyComposer, Layout,
};
use cp_types::{COMPOSITE_SEPARATOR, COUNT_FIELD, ColumnKey, Record, RowKey, UPTIME_FIELD};
use duckdb::{Connection, appender_params_from_iter, params_from_iter};
use thiserror::Error;
use tracing::debug;

/// Name of the staging table.
pub const STAGING_TABLE: &str = "records";
const COLUMN_KEY_ALIAS: &str = "col_key";

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("duckdb query failed")]
    Duckdb(#[from] duckdb::Error),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Wrap an identifier in double quotes, doubling embedded quotes.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a value for use inside a single-quoted SQL literal.
#[must_use]
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn literal(value: &str) -> String {
    format!("'{}'", escape_literal(value))
}

/// Pick `desired`, or `desired_N` for the smallest free `N`. Identifiers are
/// compared case-insensitively because DuckDB resolves them that way.
fn unique_identifier(desired: &str, taken: &mut BTreeSet<String>) -> String {
    let mut candidate = desired.to_owned();
    let mut suffix = 1_usize;
    while taken.contains(&candidate.to_lowercase()) {
        candidate = format!("{desired}_{suffix}");
        suffix += 1;
    }
    taken.insert(candidate.to_lowercase());
    candidate
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedSource {
    Field(String),
    Uptime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedColumn {
    pub source: StagedSource,
    /// Unquoted column name in the staging table.
    pub name: String,
}

/// Compiled form of an [`AggregationRequest`]: the staging layout plus the
/// expressions the queries are assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    layout: Layout,
    staged: Vec<StagedColumn>,
    row_columns: Vec<String>,
    column_parts: Vec<String>,
    uptime_column: Option<String>,
}

impl QueryPlan {
    pub fn compile(request: &AggregationRequest) -> Result<Self, AggregateError> {
        request.validate()?;

        let composer = KeyComposer::new(request);
        let mut staged: Vec<StagedColumn> = Vec::new();
        let mut taken = BTreeSet::new();
        let mut stage = |source: StagedSource| -> String {
            if let Some(existing) = staged.iter().find(|column| column.source == source) {
                return quote_identifier(&existing.name);
            }
            let desired = match &source {
                StagedSource::Field(name) => name.as_str(),
                StagedSource::Uptime => UPTIME_FIELD,
            };
            let name = unique_identifier(desired, &mut taken);
            let quoted = quote_identifier(&name);
            staged.push(StagedColumn { source, name });
            quoted
        };

        let row_columns: Vec<String> = request
            .row_fields
            .iter()
            .map(|field| stage(StagedSource::Field(field.clone())))
            .collect();

        let column_parts: Vec<String> = composer
            .column_sources()
            .iter()
            .map(|source| match source {
                ColumnSource::Field(name) => {
                    format!("NULLIF({}, '')", stage(StagedSource::Field(name.clone())))
                }
                ColumnSource::Uptime => stage(StagedSource::Uptime),
            })
            .collect();

        let uptime_column = match request.layout {
            Layout::UptimeTally => Some(stage(StagedSource::Uptime)),
            Layout::Pivot { .. } | Layout::RowCount => None,
        };

        Ok(Self {
            layout: request.layout.clone(),
            staged,
            row_columns,
            column_parts,
            uptime_column,
        })
    }

    #[must_use]
    pub fn staged_columns(&self) -> &[StagedColumn] {
        &self.staged
    }

    #[must_use]
    pub fn create_table_sql(&self) -> String {
        let columns = self
            .staged
            .iter()
            .map(|column| format!("{} VARCHAR", quote_identifier(&column.name)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({columns});",
            table = quote_identifier(STAGING_TABLE)
        )
    }

    fn column_expr(&self) -> String {
        let separator = format!(" || {} || ", literal(&COMPOSITE_SEPARATOR.to_string()));
        match self.column_parts.as_slice() {
            [single] => single.clone(),
            parts => format!("({})", parts.join(&separator)),
        }
    }

    fn where_clause(&self) -> String {
        let filters: Vec<String> = self
            .row_columns
            .iter()
            .chain(&self.column_parts)
            .chain(&self.uptime_column)
            .map(|expr| format!("{expr} IS NOT NULL"))
            .collect();
        if filters.is_empty() {
            "TRUE".to_owned()
        } else {
            filters.join(" AND ")
        }
    }

    fn group_columns(&self) -> Vec<String> {
        self.row_columns
            .iter()
            .chain(&self.uptime_column)
            .cloned()
            .collect()
    }

    /// First pass of the pivot: the sorted set of distinct column keys.
    /// `None` for flat layouts.
    #[must_use]
    pub fn discovery_sql(&self) -> Option<String> {
        if !self.layout.is_pivot() {
            return None;
        }
        Some(format!(
            "SELECT DISTINCT {expr} AS {alias} FROM {table} WHERE {filters} ORDER BY {alias}",
            expr = self.column_expr(),
            alias = quote_identifier(COLUMN_KEY_ALIAS),
            table = quote_identifier(STAGING_TABLE),
            filters = self.where_clause(),
        ))
    }

    /// Second pass of the pivot: one conditional sum per discovered key,
    /// grouped and ordered by the row fields. Takes one positional parameter
    /// per key, bound in `columns` order.
    #[must_use]
    pub fn pivot_sql(&self, columns: &[ColumnKey]) -> String {
        let expr = self.column_expr();
        let group = self.group_columns().join(", ");
        let sums = (0..columns.len())
            .map(|idx| {
                format!(
                    "CAST(SUM(CASE WHEN {expr} = ? THEN 1 ELSE 0 END) AS BIGINT) AS {alias}",
                    alias = quote_identifier(&format!("pivot_{idx}")),
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {group}, {sums} FROM {table} WHERE {filters} GROUP BY {group} ORDER BY {group}",
            table = quote_identifier(STAGING_TABLE),
            filters = self.where_clause(),
        )
    }

    /// Grouped count for the row-count and uptime-tally layouts.
    #[must_use]
    pub fn count_sql(&self) -> String {
        let group = self.group_columns().join(", ");
        format!(
            "SELECT {group}, COUNT(*) AS {count} FROM {table} WHERE {filters} GROUP BY {group} ORDER BY {group}",
            count = quote_identifier(COUNT_FIELD),
            table = quote_identifier(STAGING_TABLE),
            filters = self.where_clause(),
        )
    }
}

/// Aggregation strategy that stages records into an in-memory DuckDB
/// database and lets the engine group and count them. The connection is
/// closed when the aggregator is dropped.
pub struct DuckDbAggregator {
    conn: Connection,
}

impl std::fmt::Debug for DuckDbAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbAggregator").finish_non_exhaustive()
    }
}

impl DuckDbAggregator {
    pub fn open_in_memory() -> Result<Self, SqlError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    fn stage<I, E>(
        &self,
        plan: &QueryPlan,
        composer: &KeyComposer<'_>,
        records: I,
        failures: &mut FailureLog,
    ) -> Result<usize, SqlError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let ddl = plan.create_table_sql();
        debug!(sql = %ddl, "creating staging table");
        self.conn.execute_batch(&ddl)?;

        let mut appender = self.conn.appender(STAGING_TABLE)?;
        let mut staged = 0_usize;
        for record in records {
            let record = record.map_err(AggregateError::source_error)?;
            if let Composition::MissingRowField { field } = composer.compose(&record) {
                failures.record_missing_field(record.row_number(), field);
            }
            let values: Vec<Option<String>> = plan
                .staged
                .iter()
                .map(|column| match &column.source {
                    StagedSource::Field(name) => record.get(name).map(str::to_owned),
                    StagedSource::Uptime => composer.derived_uptime(&record),
                })
                .collect();
            appender.append_row(appender_params_from_iter(values))?;
            staged += 1;
        }
        appender.flush()?;
        Ok(staged)
    }

    fn discover_columns(&self, sql: &str) -> Result<Vec<ColumnKey>, SqlError> {
        debug!(%sql, "discovering pivot columns");
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            columns.push(ColumnKey::from_display(key));
        }
        Ok(columns)
    }

    fn read_pivot(
        &self,
        plan: &QueryPlan,
        columns: &[ColumnKey],
        counts: &mut GroupCounts,
    ) -> Result<(), SqlError> {
        let sql = plan.pivot_sql(columns);
        debug!(%sql, "running pivot query");
        let row_width = plan.row_columns.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = columns.iter().map(ColumnKey::as_str);
        let mut rows = stmt.query(params_from_iter(keys))?;
        while let Some(row) = rows.next()? {
            let key = read_row_key(row, row_width)?;
            for (offset, column) in columns.iter().enumerate() {
                let count: i64 = row.get(row_width + offset)?;
                counts.add(key.clone(), Some(column.clone()), to_count(count))?;
            }
        }
        Ok(())
    }

    fn read_counts(&self, plan: &QueryPlan, counts: &mut GroupCounts) -> Result<(), SqlError> {
        let sql = plan.count_sql();
        debug!(%sql, "running count query");
        let key_width = plan.group_columns().len();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key = read_row_key(row, key_width)?;
            let count: i64 = row.get(key_width)?;
            counts.add(key, None, to_count(count))?;
        }
        Ok(())
    }
}

fn read_row_key(row: &duckdb::Row<'_>, width: usize) -> Result<RowKey, duckdb::Error> {
    (0..width)
        .map(|idx| row.get::<_, String>(idx))
        .collect::<Result<Vec<_>, _>>()
        .map(RowKey::new)
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

impl Aggregator for DuckDbAggregator {
    type Error = SqlError;

    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn aggregate<I, E>(
        &self,
        records: I,
        request: &AggregationRequest,
        failures: &mut FailureLog,
    ) -> Result<GroupCounts, SqlError>
    where
        I: IntoIterator<Item = Result<Record, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let plan = QueryPlan::compile(request)?;
        let composer = KeyComposer::new(request);
        let staged = self.stage(&plan, &composer, records, failures)?;
        debug!(staged, columns = plan.staged.len(), "staged records");

        let mut counts = GroupCounts::empty_for(&request.layout);
        match plan.discovery_sql() {
            Some(discovery) => {
                let columns = self.discover_columns(&discovery)?;
                if columns.is_empty() {
                    debug!("no pivot columns discovered");
                    return Ok(counts);
                }
                for column in &columns {
                    counts.declare_column(column.clone())?;
                }
                self.read_pivot(&plan, &columns, &mut counts)?;
            }
            None => self.read_counts(&plan, &mut counts)?,
        }
        Ok(counts)
    }
}
