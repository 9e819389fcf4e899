//! Library side of the `csv-pivot` binary.
//!
//! Exposes option parsing, validation and the read-aggregate-write pipeline so
//! the conformance suites can drive them without spawning a process.

#![forbid(unsafe_code)]

pub mod config;
pub mod logging;
pub mod pipeline;

pub use config::{AggregateConfig, Cli, ConfigError, Engine, RunConfig};
pub use pipeline::{PipelineError, RunReport, Summary, SummaryRun, execute, list_fields, summarize};
