#![forbid(unsafe_code)]

//! Property suites for the aggregation engines.
//!
//! Generators produce small CSV bodies over a fixed vocabulary so that keys
//! collide often, with a sprinkling of empty values, short rows, quotes, and
//! unparseable or future start times.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use cp_cli::Engine;
use cp_conformance::run_csv;
use cp_groupby::{AggregationRequest, Aggregator, FailureLog, InMemoryAggregator};
use cp_sql::DuckDbAggregator;
use cp_types::{Record, RowKey};
use cp_uptime::{UptimeBucket, UptimeMode, UptimeValue, resolve_uptime};

const NOW_EPOCH: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(NOW_EPOCH, 0).expect("now")
}

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// Field value drawn from a tiny alphabet, occasionally empty or hostile.
fn arb_value() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => "[a-c]".prop_map(String::from),
        1 => Just(String::new()),
        1 => Just("it's".to_owned()),
        1 => Just("x|y".to_owned()),
        1 => Just("\"q\"".to_owned()),
    ]
}

/// Raw `starttime` value: mostly past epochs, some future, some garbage.
fn arb_starttime() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => (0_i64..1_000).prop_map(|days| (NOW_EPOCH - days * DAY).to_string()),
        1 => (1_i64..10_000).prop_map(|secs| (NOW_EPOCH + secs).to_string()),
        1 => Just(String::new()),
        1 => Just("soon".to_owned()),
    ]
}

/// One data row over `ns,region,starttime`, sometimes cut short.
fn arb_row() -> impl Strategy<Value = Vec<String>> {
    (arb_value(), arb_value(), arb_starttime(), 1_usize..=3).prop_map(
        |(ns, region, start, width)| {
            let mut row = vec![ns, region, start];
            row.truncate(width.max(1));
            row
        },
    )
}

fn arb_rows(max: usize) -> impl Strategy<Value = Vec<Vec<String>>> {
    proptest::collection::vec(arb_row(), 0..max)
}

/// Column field lists, always including at least one entry.
fn arb_column_fields() -> impl Strategy<Value = Vec<String>> {
    prop_oneof![
        Just(vec!["uptime".to_owned()]),
        Just(vec!["region".to_owned()]),
        Just(vec!["uptime".to_owned(), "region".to_owned()]),
        Just(vec!["region".to_owned(), "uptime".to_owned()]),
    ]
}

fn arb_mode() -> impl Strategy<Value = UptimeMode> {
    prop_oneof![Just(UptimeMode::Bucket), Just(UptimeMode::Days)]
}

fn csv_body(rows: &[Vec<String>]) -> String {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer
        .write_record(["ns", "region", "starttime"])
        .expect("header");
    for row in rows {
        writer.write_record(row).expect("row");
    }
    String::from_utf8(writer.into_inner().expect("flush")).expect("utf8")
}

fn records(rows: &[Vec<String>]) -> Vec<Result<Record, Infallible>> {
    let header: Arc<[String]> = ["ns", "region", "starttime"]
        .iter()
        .map(|name| (*name).to_owned())
        .collect();
    rows.iter()
        .enumerate()
        .map(|(idx, values)| {
            Ok(Record::new(idx + 1, Arc::clone(&header), values.clone()).expect("record"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Strategy equivalence
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_engines_agree_on_pivot(
        rows in arb_rows(24),
        columns in arb_column_fields(),
        include_invalid in any::<bool>(),
        mode in arb_mode(),
    ) {
        let request = AggregationRequest::pivot(vec!["ns".into()], columns, now())
            .with_include_invalid(include_invalid)
            .with_uptime_mode(mode);

        let mut memory_failures = FailureLog::new();
        let memory = InMemoryAggregator
            .aggregate(records(&rows), &request, &mut memory_failures)
            .expect("memory");
        let mut sql_failures = FailureLog::new();
        let sql = DuckDbAggregator::open_in_memory()
            .expect("open")
            .aggregate(records(&rows), &request, &mut sql_failures)
            .expect("duckdb");

        prop_assert_eq!(memory, sql);
        prop_assert_eq!(memory_failures, sql_failures);
    }

    #[test]
    fn prop_engines_render_identical_csv_for_every_layout(
        rows in arb_rows(16),
        include_invalid in any::<bool>(),
        mode in arb_mode(),
        shape in 0_u8..3,
    ) {
        let body = csv_body(&rows);
        let request = match shape {
            0 => AggregationRequest::pivot(vec!["ns".into()], vec!["uptime".into()], now()),
            1 => AggregationRequest::row_count(vec!["ns".into(), "region".into()], now()),
            _ => AggregationRequest::uptime_tally(vec!["region".into()], now()),
        }
        .with_include_invalid(include_invalid)
        .with_uptime_mode(mode);

        let memory = run_csv(&body, &request, Engine::Memory).expect("memory");
        let sql = run_csv(&body, &request, Engine::Duckdb).expect("duckdb");
        prop_assert_eq!(memory, sql);
    }
}

// ---------------------------------------------------------------------------
// Determinism and counting invariants
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_rendering_is_idempotent(rows in arb_rows(24), columns in arb_column_fields()) {
        let body = csv_body(&rows);
        let request = AggregationRequest::pivot(vec!["ns".into()], columns, now());
        let first = run_csv(&body, &request, Engine::Memory).expect("first");
        let second = run_csv(&body, &request, Engine::Memory).expect("second");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_row_sum_equals_included_records(rows in arb_rows(32)) {
        let request = AggregationRequest::pivot(vec!["ns".into()], vec!["region".into()], now());
        let counts = InMemoryAggregator
            .aggregate(records(&rows), &request, &mut FailureLog::new())
            .expect("aggregate");

        let mut expected: BTreeMap<RowKey, u64> = BTreeMap::new();
        for row in &rows {
            let region_present = row.get(1).is_some_and(|region| !region.is_empty());
            if let (Some(ns), true) = (row.first(), region_present) {
                *expected.entry(RowKey::from(vec![ns.clone()])).or_default() += 1;
            }
        }

        prop_assert_eq!(counts.row_len(), expected.len());
        for (key, total) in &expected {
            prop_assert_eq!(counts.row_total(key), *total);
        }
    }

    #[test]
    fn prop_skipped_rows_never_appear_as_keys(rows in arb_rows(32)) {
        let request =
            AggregationRequest::row_count(vec!["ns".into(), "starttime".into()], now());
        let mut failures = FailureLog::new();
        let counts = InMemoryAggregator
            .aggregate(records(&rows), &request, &mut failures)
            .expect("aggregate");

        let short_rows = rows.iter().filter(|row| row.len() < 3).count();
        prop_assert_eq!(failures.len(), short_rows);
        prop_assert_eq!(counts.total() as usize, rows.len() - short_rows);
    }
}

// ---------------------------------------------------------------------------
// Derived field
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn prop_buckets_are_monotonic_in_age(a in 0_i64..2_000, b in 0_i64..2_000) {
        let (younger, older) = if a <= b { (a, b) } else { (b, a) };
        let bucket = |days: i64| {
            let raw = (NOW_EPOCH - days * DAY).to_string();
            match resolve_uptime(Some(&raw), now(), UptimeMode::Bucket) {
                UptimeValue::Bucket(bucket) => bucket,
                other => panic!("expected bucket, got {other:?}"),
            }
        };
        prop_assert!(bucket(younger) <= bucket(older));
    }

    #[test]
    fn prop_future_start_is_invalid_in_both_modes(ahead in 1_i64..100_000_000, days in any::<bool>()) {
        let mode = if days { UptimeMode::Days } else { UptimeMode::Bucket };
        let raw = (NOW_EPOCH + ahead).to_string();
        prop_assert_eq!(resolve_uptime(Some(&raw), now(), mode), UptimeValue::Invalid);
    }

    #[test]
    fn prop_days_and_buckets_agree(days in 0_i64..5_000, slack in 0_i64..DAY) {
        let raw = (NOW_EPOCH - days * DAY - slack).to_string();
        let as_days = resolve_uptime(Some(&raw), now(), UptimeMode::Days);
        prop_assert_eq!(as_days, UptimeValue::Days(days));
        let bucket = resolve_uptime(Some(&raw), now(), UptimeMode::Bucket);
        prop_assert_eq!(bucket, UptimeValue::Bucket(UptimeBucket::for_days(days).expect("bucket")));
    }
}

// ---------------------------------------------------------------------------
// Injection safety
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_hostile_names_and_values_round_trip(
        field in "[a-z]{1,3}[\"'; -]{1,3}[a-z]{0,3}",
        values in proptest::collection::vec("[a-z'\";|() -]{0,6}", 1..12),
    ) {
        let header: Arc<[String]> = vec![field.clone(), "region".to_owned()].into();
        let input: Vec<Result<Record, Infallible>> = values
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                let values = vec![format!("k{}", idx % 2), value.clone()];
                Ok(Record::new(idx + 1, Arc::clone(&header), values).expect("record"))
            })
            .collect();
        let request = AggregationRequest::pivot(vec![field], vec!["region".into()], now());

        let memory = InMemoryAggregator
            .aggregate(input.clone(), &request, &mut FailureLog::new())
            .expect("memory");
        let sql = DuckDbAggregator::open_in_memory()
            .expect("open")
            .aggregate(input, &request, &mut FailureLog::new())
            .expect("duckdb");

        let included = values.iter().filter(|value| !value.is_empty()).count() as u64;
        prop_assert_eq!(sql.total(), included);
        prop_assert_eq!(memory, sql);
    }
}
