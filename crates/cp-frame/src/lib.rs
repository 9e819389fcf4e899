#![forbid(unsafe_code)]

use cp_groupby::{AggregationRequest, GroupCounts, Layout};
use cp_types::{COUNT_FIELD, UPTIME_FIELD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("counts shape does not match {layout} layout")]
    ShapeMismatch { layout: &'static str },
    #[error("row {row} has {width} cells but the header has {header}")]
    RaggedRow {
        row: usize,
        width: usize,
        header: usize,
    },
}

/// Rendered output table: a header row followed by data rows, all as text.
///
/// Pivot frames carry the row fields followed by one column per discovered
/// column key, with absent cells rendered as `0`. Flat frames carry the row
/// fields, the derived `uptime` value for tallies, and a trailing `count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryFrame {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl SummaryFrame {
    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, FrameError> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != header.len() {
                return Err(FrameError::RaggedRow {
                    row: idx,
                    width: row.len(),
                    header: header.len(),
                });
            }
        }
        Ok(Self { header, rows })
    }

    pub fn from_counts(
        counts: &GroupCounts,
        request: &AggregationRequest,
    ) -> Result<Self, FrameError> {
        match (&request.layout, counts) {
            (Layout::Pivot { .. }, GroupCounts::Pivot { columns, cells }) => {
                let mut header = request.row_fields.clone();
                header.extend(columns.iter().map(|column| column.to_string()));

                let rows = cells
                    .iter()
                    .map(|(row, by_column)| {
                        let mut out = row.values().to_vec();
                        out.extend(columns.iter().map(|column| {
                            by_column.get(column).copied().unwrap_or(0).to_string()
                        }));
                        out
                    })
                    .collect();
                Self::new(header, rows)
            }
            (Layout::RowCount | Layout::UptimeTally, GroupCounts::Flat { cells }) => {
                let mut header = request.row_fields.clone();
                if matches!(request.layout, Layout::UptimeTally) {
                    header.push(UPTIME_FIELD.to_owned());
                }
                header.push(COUNT_FIELD.to_owned());

                let rows = cells
                    .iter()
                    .map(|(row, count)| {
                        let mut out = row.values().to_vec();
                        out.push(count.to_string());
                        out
                    })
                    .collect();
                Self::new(header, rows)
            }
            (Layout::Pivot { .. }, GroupCounts::Flat { .. }) => {
                Err(FrameError::ShapeMismatch { layout: "pivot" })
            }
            (Layout::RowCount, GroupCounts::Pivot { .. }) => {
                Err(FrameError::ShapeMismatch { layout: "row count" })
            }
            (Layout::UptimeTally, GroupCounts::Pivot { .. }) => {
                Err(FrameError::ShapeMismatch {
                    layout: "uptime tally",
                })
            }
        }
    }

    #[must_use]
    pub fn header(&self) -> &[String] {
        &self.header
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.header.len()
    }

    /// Cell by row position and header name.
    #[must_use]
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let position = self.header.iter().position(|name| name == column)?;
        self.rows.get(row)?.get(position).map(String::as_str)
    }
}
