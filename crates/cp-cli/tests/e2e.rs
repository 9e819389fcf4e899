use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assert_cmd::Command;
use tempfile::{TempDir, tempdir};

const NOW: &str = "1700000000";
const NOW_EPOCH: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

fn started(days_ago: i64) -> i64 {
    NOW_EPOCH - days_ago * DAY
}

fn workspace(body: &str) -> Result<(TempDir, PathBuf)> {
    let dir = tempdir().context("tempdir")?;
    let input = dir.path().join("pods.csv");
    fs::write(&input, body).context("write input")?;
    Ok((dir, input))
}

fn csv_pivot() -> Result<Command> {
    let mut cmd = Command::cargo_bin("csv-pivot").context("locate csv-pivot binary")?;
    cmd.env_remove("RUST_LOG");
    Ok(cmd)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn pods_body() -> String {
    format!(
        "ns,region,starttime\na,eu,{}\na,eu,{}\nb,us,{}\n",
        started(10),
        started(10),
        started(400)
    )
}

#[test]
fn pivot_by_uptime_bucket() -> Result<()> {
    let (dir, input) = workspace(&pods_body())?;
    let output = dir.path().join("out.csv");

    csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "--columns", "uptime", "--now", NOW])
        .assert()
        .success();

    assert_eq!(read(&output)?, "ns,0-3 months,1-2 years\na,2,0\nb,0,1\n");
    Ok(())
}

#[test]
fn duckdb_engine_writes_identical_output() -> Result<()> {
    let (dir, input) = workspace(&pods_body())?;
    let shapes: [&[&str]; 3] = [
        &["--rows", "ns", "--columns", "region", "uptime"],
        &["--rows", "ns", "region", "--no-columns"],
        &["--rows", "region", "--uptime-as-row", "--uptime-as-days"],
    ];

    for shape in shapes {
        let memory = dir.path().join("memory.csv");
        let duckdb = dir.path().join("duckdb.csv");
        for (engine, output) in [("memory", &memory), ("duckdb", &duckdb)] {
            csv_pivot()?
                .arg("-i")
                .arg(&input)
                .arg("-o")
                .arg(output)
                .args(shape)
                .args(["--engine", engine, "--now", NOW])
                .assert()
                .success();
        }
        assert_eq!(read(&memory)?, read(&duckdb)?, "shape {shape:?}");
    }
    Ok(())
}

#[test]
fn dry_run_lists_fields() -> Result<()> {
    let (_dir, input) = workspace(&pods_body())?;

    let out = csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("--dry-run")
        .output()
        .context("run")?;

    assert!(out.status.success());
    assert_eq!(
        String::from_utf8(out.stdout)?,
        "Available fields in input CSV:\n  - ns\n  - region\n  - starttime\n"
    );
    Ok(())
}

#[test]
fn missing_output_exits_with_usage_error() -> Result<()> {
    let (dir, input) = workspace(&pods_body())?;

    let out = csv_pivot()?
        .arg("-i")
        .arg(&input)
        .args(["--rows", "ns", "--columns", "uptime"])
        .output()
        .context("run")?;

    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8(out.stderr)?;
    assert!(
        stderr.contains("error: missing required argument: -o/--output"),
        "stderr: {stderr}"
    );
    assert_eq!(fs::read_dir(dir.path())?.count(), 1);
    Ok(())
}

#[test]
fn conflicting_shapes_exit_with_usage_error() -> Result<()> {
    let (dir, input) = workspace(&pods_body())?;
    let output = dir.path().join("out.csv");
    let cases: [(&[&str], &str); 3] = [
        (
            &["--rows", "ns", "--columns", "uptime", "--no-columns"],
            "--no-columns cannot be used with --columns",
        ),
        (
            &["--rows", "ns", "--no-columns", "--uptime-as-row"],
            "--no-columns cannot be used with --uptime-as-row",
        ),
        (
            &["--rows", "ns", "--columns", "region", "--uptime-as-row"],
            "--columns cannot be used with --uptime-as-row",
        ),
    ];

    for (args, message) in cases {
        let out = csv_pivot()?
            .arg("-i")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .args(args)
            .output()
            .context("run")?;
        assert_eq!(out.status.code(), Some(2), "{args:?}");
        let stderr = String::from_utf8(out.stderr)?;
        assert!(stderr.contains(message), "stderr: {stderr}");
        assert!(!output.exists());
    }
    Ok(())
}

#[test]
fn empty_column_set_writes_no_file() -> Result<()> {
    let (dir, input) = workspace("ns,region\na,\nb,\n")?;
    let output = dir.path().join("out.csv");

    for engine in ["memory", "duckdb"] {
        let out = csv_pivot()?
            .arg("-i")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .args(["--rows", "ns", "--columns", "region", "--engine", engine])
            .output()
            .context("run")?;
        assert!(out.status.success(), "{engine}");
        let stderr = String::from_utf8(out.stderr)?;
        assert!(stderr.contains("no output written"), "stderr: {stderr}");
        assert!(!output.exists());
    }
    Ok(())
}

#[test]
fn tally_without_starttime_column_fails_before_writing() -> Result<()> {
    let (dir, input) = workspace("ns,region\na,eu\n")?;
    let output = dir.path().join("out.csv");

    let out = csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "--uptime-as-row"])
        .output()
        .context("run")?;

    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8(out.stderr)?;
    assert!(
        stderr.contains("'starttime' column missing from input"),
        "stderr: {stderr}"
    );
    assert!(!output.exists());
    Ok(())
}

#[test]
fn rows_missing_a_row_field_are_skipped_and_reported() -> Result<()> {
    let body = format!(
        "ns,pod,starttime\na,p1,{}\nb\na,p2,{}\n",
        started(1),
        started(800)
    );
    let (dir, input) = workspace(&body)?;
    let output = dir.path().join("out.csv");

    let out = csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "pod", "--uptime-as-row", "--now", NOW])
        .output()
        .context("run")?;

    assert!(out.status.success());
    let stderr = String::from_utf8(out.stderr)?;
    assert!(stderr.contains("1 rows skipped"), "stderr: {stderr}");
    assert!(!stderr.contains("Missing field"), "stderr: {stderr}");
    assert_eq!(
        read(&output)?,
        "ns,pod,uptime,count\na,p1,0-3 months,1\na,p2,>2 years,1\n"
    );

    let verbose = csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "pod", "--uptime-as-row", "--now", NOW, "--verbose"])
        .output()
        .context("run")?;
    assert!(verbose.status.success());
    let stderr = String::from_utf8(verbose.stderr)?;
    assert!(
        stderr.contains("Missing field 'pod' at row 2. Skipping row."),
        "stderr: {stderr}"
    );
    Ok(())
}

#[test]
fn invalid_start_times_are_counted_only_on_request() -> Result<()> {
    let body = format!("ns,starttime\na,{}\na,soon\na,{}\n", started(3), NOW_EPOCH + 60);
    let (dir, input) = workspace(&body)?;
    let output = dir.path().join("out.csv");

    csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "--columns", "uptime", "--now", NOW])
        .assert()
        .success();
    assert_eq!(read(&output)?, "ns,0-3 months\na,1\n");

    csv_pivot()?
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "--columns", "uptime", "--include-invalid"])
        .args(["--now", NOW])
        .assert()
        .success();
    assert_eq!(read(&output)?, "ns,0-3 months,invalid\na,1,2\n");
    Ok(())
}

#[test]
fn unreadable_input_exits_with_failure() -> Result<()> {
    let dir = tempdir()?;
    let output = dir.path().join("out.csv");

    let out = csv_pivot()?
        .arg("-i")
        .arg(dir.path().join("absent.csv"))
        .arg("-o")
        .arg(&output)
        .args(["--rows", "ns", "--no-columns"])
        .output()
        .context("run")?;

    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr)?;
    assert!(stderr.contains("failed to summarize"), "stderr: {stderr}");
    assert!(!output.exists());
    Ok(())
}
