#![forbid(unsafe_code)]

//! Differential fixture harness.
//!
//! Every fixture under `fixtures/cases` is a CSV body plus an aggregation
//! request and the expected outcome. Each fixture runs once per engine, and
//! both engines must reproduce the expected CSV byte for byte.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use cp_cli::{Engine, PipelineError, Summary, summarize};
use cp_groupby::{AggregationRequest, Layout};
use cp_io::{RecordReader, write_summary_string};
use cp_uptime::UptimeMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }

    #[must_use]
    pub fn case_fixture_root(&self) -> PathBuf {
        self.fixture_root.join("cases")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFixture {
    pub case_id: String,
    #[serde(default)]
    pub description: String,
    pub csv_input: String,
    #[serde(default)]
    pub row_fields: Vec<String>,
    pub layout: Layout,
    #[serde(default)]
    pub include_invalid: bool,
    #[serde(default)]
    pub uptime_mode: UptimeMode,
    pub now_epoch: i64,
    #[serde(default)]
    pub expected_csv: Option<String>,
    #[serde(default)]
    pub expected_no_output: bool,
    #[serde(default)]
    pub expected_skipped_rows: Vec<usize>,
    #[serde(default)]
    pub expected_error_contains: Option<String>,
}

impl CaseFixture {
    pub fn request(&self) -> Result<AggregationRequest, HarnessError> {
        let now = DateTime::<Utc>::from_timestamp(self.now_epoch, 0).ok_or_else(|| {
            HarnessError::FixtureFormat(format!(
                "{}: now_epoch {} out of range",
                self.case_id, self.now_epoch
            ))
        })?;
        Ok(
            AggregationRequest::new(self.row_fields.clone(), self.layout.clone(), now)
                .with_include_invalid(self.include_invalid)
                .with_uptime_mode(self.uptime_mode),
        )
    }

    fn resolve_expected(&self) -> Result<ResolvedExpected, HarnessError> {
        match (
            &self.expected_csv,
            self.expected_no_output,
            &self.expected_error_contains,
        ) {
            (Some(csv), false, None) => Ok(ResolvedExpected::Csv(csv.clone())),
            (None, true, None) => Ok(ResolvedExpected::NoOutput),
            (None, false, Some(fragment)) => Ok(ResolvedExpected::ErrorContains(fragment.clone())),
            _ => Err(HarnessError::FixtureFormat(format!(
                "{}: exactly one of expected_csv, expected_no_output, expected_error_contains is required",
                self.case_id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ResolvedExpected {
    Csv(String),
    NoOutput,
    ErrorContains(String),
}

/// What one engine produced for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOutput {
    /// Rendered CSV, or `None` when the pivot discovered no columns.
    pub csv: Option<String>,
    pub skipped_rows: Vec<usize>,
}

/// Run `csv_input` through the full read-aggregate-render path with `engine`.
pub fn run_csv(
    csv_input: &str,
    request: &AggregationRequest,
    engine: Engine,
) -> Result<CaseOutput, HarnessError> {
    let reader = RecordReader::from_reader(csv_input.as_bytes()).map_err(PipelineError::from)?;
    let headers = reader.headers().to_vec();
    let run = summarize(&headers, reader, request, engine)?;
    let csv = match run.summary {
        Summary::Frame(frame) => Some(write_summary_string(&frame).map_err(PipelineError::from)?),
        Summary::NoDiscoveredColumns => None,
    };
    let skipped_rows = run
        .failures
        .skipped()
        .iter()
        .map(|skip| skip.row_number)
        .collect();
    Ok(CaseOutput { csv, skipped_rows })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub engine: String,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    #[serde(default)]
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

pub fn run_case_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, None)?;
    build_report("cases".to_owned(), &fixtures)
}

pub fn run_case_by_id(config: &HarnessConfig, case_id: &str) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, Some(case_id))?;
    if fixtures.is_empty() {
        return Err(HarnessError::FixtureFormat(format!(
            "no fixture found for case_id={case_id}"
        )));
    }
    build_report(format!("case:{case_id}"), &fixtures)
}

fn build_report(suite: String, fixtures: &[CaseFixture]) -> Result<SuiteReport, HarnessError> {
    let mut results = Vec::with_capacity(fixtures.len() * Engine::ALL.len());
    for fixture in fixtures {
        for engine in Engine::ALL {
            results.push(run_fixture(fixture, engine)?);
        }
    }

    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    let passed = results.len().saturating_sub(failed);

    Ok(SuiteReport {
        suite,
        fixture_count: fixtures.len(),
        passed,
        failed,
        results,
    })
}

pub fn run_fixture(fixture: &CaseFixture, engine: Engine) -> Result<CaseResult, HarnessError> {
    let expected = fixture.resolve_expected()?;
    let request = fixture.request()?;

    let started = Instant::now();
    let mismatch = compare_outcome(fixture, &expected, &request, engine).err();
    let elapsed_us = u64::try_from(started.elapsed().as_micros())
        .unwrap_or(u64::MAX)
        .max(1);

    Ok(CaseResult {
        case_id: fixture.case_id.clone(),
        engine: engine.name().to_owned(),
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        elapsed_us,
    })
}

fn compare_outcome(
    fixture: &CaseFixture,
    expected: &ResolvedExpected,
    request: &AggregationRequest,
    engine: Engine,
) -> Result<(), String> {
    let outcome = run_csv(&fixture.csv_input, request, engine);
    let output = match (expected, outcome) {
        (ResolvedExpected::ErrorContains(fragment), Err(err)) => {
            let message = err.to_string();
            return if message.contains(fragment.as_str()) {
                Ok(())
            } else {
                Err(format!("expected error containing {fragment:?}, got {message:?}"))
            };
        }
        (ResolvedExpected::ErrorContains(fragment), Ok(output)) => {
            return Err(format!(
                "expected error containing {fragment:?}, got output {:?}",
                output.csv
            ));
        }
        (_, Err(err)) => return Err(format!("unexpected error: {err}")),
        (_, Ok(output)) => output,
    };

    match expected {
        ResolvedExpected::Csv(csv) if output.csv.as_deref() != Some(csv.as_str()) => {
            return Err(format!("csv mismatch: expected {csv:?}, got {:?}", output.csv));
        }
        ResolvedExpected::NoOutput if output.csv.is_some() => {
            return Err(format!("expected no output, got {:?}", output.csv));
        }
        _ => {}
    }

    if output.skipped_rows != fixture.expected_skipped_rows {
        return Err(format!(
            "skipped rows mismatch: expected {:?}, got {:?}",
            fixture.expected_skipped_rows, output.skipped_rows
        ));
    }
    Ok(())
}

fn load_fixtures(
    config: &HarnessConfig,
    case_filter: Option<&str>,
) -> Result<Vec<CaseFixture>, HarnessError> {
    let fixture_files = list_fixture_files(&config.case_fixture_root())?;
    let mut fixtures = Vec::with_capacity(fixture_files.len());

    for fixture_path in fixture_files {
        let fixture = load_fixture(&fixture_path)?;
        if case_filter.is_none_or(|case_id| fixture.case_id == case_id) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

pub fn load_fixture(path: &Path) -> Result<CaseFixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

pub fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
