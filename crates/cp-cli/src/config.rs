use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use cp_groupby::{AggregationRequest, Layout};
use cp_uptime::{UptimeMode, parse_epoch_seconds};
use thiserror::Error;

/// Pivot or tally CSV records by row fields and discovered column values.
///
/// Example usage:
///   csv-pivot -i pods.csv -o out.csv --rows namespace --columns uptime
///   csv-pivot -i pods.csv -o out.csv --rows namespace --uptime-as-row --uptime-as-days
///   csv-pivot -i pods.csv --dry-run
#[derive(Debug, Parser)]
#[command(name = "csv-pivot")]
#[command(version, about = "Flexible pivot tool for pod uptime or other CSV fields", long_about = None)]
pub struct Cli {
    /// Input CSV file path
    #[arg(short, long, value_name = "PATH")]
    pub input: PathBuf,

    /// Output CSV file path (unless --dry-run)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Fields to use as row keys
    #[arg(long, num_args = 1.., value_name = "FIELD")]
    pub rows: Vec<String>,

    /// Fields to pivot as columns (e.g. uptime, region)
    #[arg(long, num_args = 1.., value_name = "FIELD")]
    pub columns: Vec<String>,

    /// Count records per row key only, without a column pivot
    #[arg(long)]
    pub no_columns: bool,

    /// Include invalid, missing, or future start times as "invalid"
    #[arg(long)]
    pub include_invalid: bool,

    /// Emit one row per (row key, uptime) pair with a count column
    #[arg(long)]
    pub uptime_as_row: bool,

    /// Use exact number of days instead of bucketed uptime
    #[arg(long)]
    pub uptime_as_days: bool,

    /// Print available CSV fields and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose output, including skipped rows
    #[arg(short, long)]
    pub verbose: bool,

    /// Aggregation engine
    #[arg(long, value_enum, default_value_t = Engine::Memory)]
    pub engine: Engine,

    /// Reference instant in epoch seconds (defaults to the current time)
    #[arg(long, value_name = "EPOCH_SECONDS", allow_hyphen_values = true)]
    pub now: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// Single pass into an in-memory counter
    #[default]
    Memory,
    /// Staged into an in-process DuckDB table and counted by generated SQL
    Duckdb,
}

impl Engine {
    pub const ALL: [Self; 2] = [Self::Memory, Self::Duckdb];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Duckdb => "duckdb",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required argument: -o/--output (unless using --dry-run)")]
    MissingOutput,
    #[error("missing required argument: --rows (unless using --uptime-as-row)")]
    MissingRows,
    #[error("missing required argument: --columns (unless using --uptime-as-row or --no-columns)")]
    MissingColumns,
    #[error("--{first} cannot be used with --{second}")]
    Conflict {
        first: &'static str,
        second: &'static str,
    },
    #[error("field names must not be empty")]
    EmptyField,
    #[error("invalid --now value '{0}': expected epoch seconds")]
    InvalidNow(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub engine: Engine,
    pub request: AggregationRequest,
}

/// Validated run configuration. Nothing is opened or created until one of
/// these exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunConfig {
    DryRun { input: PathBuf },
    Aggregate(AggregateConfig),
}

impl Cli {
    /// Validate the parsed options. `clock` is consulted only when `--now`
    /// is not given.
    pub fn into_config(
        self,
        clock: impl FnOnce() -> DateTime<Utc>,
    ) -> Result<RunConfig, ConfigError> {
        if self.dry_run {
            return Ok(RunConfig::DryRun { input: self.input });
        }

        let output = self.output.ok_or(ConfigError::MissingOutput)?;

        if self.no_columns && !self.columns.is_empty() {
            return Err(ConfigError::Conflict {
                first: "no-columns",
                second: "columns",
            });
        }
        if self.no_columns && self.uptime_as_row {
            return Err(ConfigError::Conflict {
                first: "no-columns",
                second: "uptime-as-row",
            });
        }
        if self.uptime_as_row && !self.columns.is_empty() {
            return Err(ConfigError::Conflict {
                first: "columns",
                second: "uptime-as-row",
            });
        }
        if self.rows.is_empty() && !self.uptime_as_row {
            return Err(ConfigError::MissingRows);
        }

        let layout = if self.uptime_as_row {
            Layout::UptimeTally
        } else if self.no_columns {
            Layout::RowCount
        } else if self.columns.is_empty() {
            return Err(ConfigError::MissingColumns);
        } else {
            Layout::Pivot {
                column_fields: self.columns,
            }
        };

        if self
            .rows
            .iter()
            .chain(layout.column_fields())
            .any(String::is_empty)
        {
            return Err(ConfigError::EmptyField);
        }

        let now = match self.now {
            Some(raw) => parse_epoch_seconds(&raw).ok_or(ConfigError::InvalidNow(raw))?,
            None => clock(),
        };

        let uptime_mode = if self.uptime_as_days {
            UptimeMode::Days
        } else {
            UptimeMode::Bucket
        };
        let request = AggregationRequest::new(self.rows, layout, now)
            .with_include_invalid(self.include_invalid)
            .with_uptime_mode(uptime_mode);

        Ok(RunConfig::Aggregate(AggregateConfig {
            input: self.input,
            output,
            engine: self.engine,
            request,
        }))
    }
}
