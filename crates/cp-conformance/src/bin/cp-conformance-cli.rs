#![forbid(unsafe_code)]

use cp_conformance::{HarnessConfig, run_case_by_id, run_case_suite};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut case_filter: Option<String> = None;
    let mut require_green = false;
    let mut json = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--case-id" => {
                let value = args
                    .next()
                    .ok_or("--case-id requires a value (e.g. tally_bucket)")?;
                case_filter = Some(value);
            }
            "--require-green" => {
                require_green = true;
            }
            "--json" => {
                json = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let config = HarnessConfig::default_paths();
    let report = match case_filter.as_deref() {
        Some(case_id) => run_case_by_id(&config, case_id)?,
        None => run_case_suite(&config)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for result in &report.results {
            println!(
                "case={} engine={} status={:?} elapsed_us={}{}",
                result.case_id,
                result.engine,
                result.status,
                result.elapsed_us,
                result
                    .mismatch
                    .as_deref()
                    .map(|mismatch| format!(" mismatch={mismatch}"))
                    .unwrap_or_default()
            );
        }
        println!(
            "suite={} fixtures={} passed={} failed={} green={}",
            report.suite,
            report.fixture_count,
            report.passed,
            report.failed,
            report.is_green()
        );
    }

    if require_green && !report.is_green() {
        return Err(format!(
            "suite {} is not green: {} of {} runs failed",
            report.suite,
            report.failed,
            report.results.len()
        )
        .into());
    }

    Ok(())
}

fn print_help() {
    println!(
        "cp-conformance-cli\n\
         Usage:\n\
         \tcp-conformance-cli [--case-id <id>] [--json] [--require-green]\n\
         Options:\n\
         \t--case-id <id>    Run only one fixture case\n\
         \t--json            Print the suite report as JSON\n\
         \t--require-green   Fail with non-zero exit when any case mismatches on either engine\n\
         \t-h, --help        Show this help"
    );
}
