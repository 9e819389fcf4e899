use std::error::Error as StdError;
use std::path::{Path, PathBuf};

use cp_frame::{FrameError, SummaryFrame};
use cp_groupby::{
    AggregateError, AggregationRequest, Aggregator, FailureLog, GroupCounts, InMemoryAggregator,
    SkippedRecord,
};
use cp_io::{IoError, RecordReader, read_headers, write_summary};
use cp_sql::{DuckDbAggregator, SqlError};
use cp_types::Record;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AggregateConfig, Engine};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl PipelineError {
    /// Errors caused by the request not fitting the input, as opposed to
    /// failures reading, querying, or writing.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        let aggregate = match self {
            Self::Aggregate(err) | Self::Sql(SqlError::Aggregate(err)) => err,
            _ => return false,
        };
        !matches!(
            aggregate,
            AggregateError::Source(_) | AggregateError::ShapeMismatch(_) | AggregateError::Type(_)
        )
    }
}

/// Result of aggregating one source, before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Summary {
    Frame(SummaryFrame),
    /// Pivot layout where no record had every column field present; nothing
    /// is written in this case.
    NoDiscoveredColumns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRun {
    pub summary: Summary,
    pub failures: FailureLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub output: Option<PathBuf>,
    pub rows: usize,
    pub columns: usize,
    pub skipped: Vec<SkippedRecord>,
}

fn aggregate_with<A, I, E>(
    aggregator: &A,
    records: I,
    request: &AggregationRequest,
    failures: &mut FailureLog,
) -> Result<GroupCounts, PipelineError>
where
    A: Aggregator,
    PipelineError: From<A::Error>,
    I: IntoIterator<Item = Result<Record, E>>,
    E: StdError + Send + Sync + 'static,
{
    Ok(aggregator.aggregate(records, request, failures)?)
}

/// Aggregate `records` with the chosen engine and materialize the result.
pub fn summarize<I, E>(
    headers: &[String],
    records: I,
    request: &AggregationRequest,
    engine: Engine,
) -> Result<SummaryRun, PipelineError>
where
    I: IntoIterator<Item = Result<Record, E>>,
    E: StdError + Send + Sync + 'static,
{
    request.validate()?;
    request.check_source_fields(headers)?;
    for field in &request.row_fields {
        if !headers.contains(field) {
            warn!("row field '{field}' is not in the input header; every row will be skipped");
        }
    }

    let mut failures = FailureLog::new();
    let counts = match engine {
        Engine::Memory => aggregate_with(&InMemoryAggregator, records, request, &mut failures)?,
        Engine::Duckdb => {
            let aggregator = DuckDbAggregator::open_in_memory()?;
            aggregate_with(&aggregator, records, request, &mut failures)?
        }
    };

    let summary = if counts.has_no_columns() {
        Summary::NoDiscoveredColumns
    } else {
        Summary::Frame(SummaryFrame::from_counts(&counts, request)?)
    };
    Ok(SummaryRun { summary, failures })
}

/// Read `config.input`, aggregate, and write the summary to `config.output`.
/// The output file is only touched once the whole summary exists.
pub fn execute(config: &AggregateConfig) -> Result<RunReport, PipelineError> {
    let reader = RecordReader::open(&config.input)?;
    let headers = reader.headers().to_vec();
    info!(
        input = %config.input.display(),
        engine = config.engine.name(),
        fields = headers.len(),
        "aggregating"
    );

    let run = summarize(&headers, reader, &config.request, config.engine)?;
    let skipped = run.failures.into_skipped();
    if !skipped.is_empty() {
        warn!(
            "{} rows skipped due to missing fields (use --verbose for details)",
            skipped.len()
        );
    }

    let frame = match run.summary {
        Summary::Frame(frame) => frame,
        Summary::NoDiscoveredColumns => {
            warn!(
                "no rows had values for all column fields {:?}; no output written",
                config.request.layout.column_fields()
            );
            return Ok(RunReport {
                output: None,
                rows: 0,
                columns: 0,
                skipped,
            });
        }
    };

    write_summary(&config.output, &frame)?;
    info!(
        output = %config.output.display(),
        rows = frame.len(),
        columns = frame.width(),
        skipped = skipped.len(),
        "output saved"
    );
    Ok(RunReport {
        output: Some(config.output.clone()),
        rows: frame.len(),
        columns: frame.width(),
        skipped,
    })
}

/// Header names of the input, for the dry-run listing.
pub fn list_fields(input: &Path) -> Result<Vec<String>, PipelineError> {
    Ok(read_headers(input)?)
}
