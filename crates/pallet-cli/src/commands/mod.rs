pub mod completions;
pub mod fetch;
pub mod install;
pub mod list;
pub mod man_pages;
pub mod uninstall;

use indicatif::{ProgressBar, ProgressStyle};
use pallet_core::{CoreError, Stage, TestReport};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_FETCH_ERROR: u8 = 3;
pub const EXIT_CHECKSUM_MISMATCH: u8 = 4;
pub const EXIT_INSTALL_ERROR: u8 = 5;
pub const EXIT_TEST_FAILURE: u8 = 6;
pub const EXIT_CANCELLED: u8 = 130;

pub fn exit_code_for(stage: Stage) -> u8 {
    match stage {
        Stage::Parse => EXIT_MANIFEST_ERROR,
        Stage::Fetch => EXIT_FETCH_ERROR,
        Stage::Verify => EXIT_CHECKSUM_MISMATCH,
        Stage::Install => EXIT_INSTALL_ERROR,
        Stage::Test => EXIT_TEST_FAILURE,
        Stage::Cancelled => EXIT_CANCELLED,
    }
}

/// Print a pipeline error and return the exit code for its stage.
pub fn report_error(err: &CoreError, json: bool) -> u8 {
    let stage = err.stage();
    eprintln!("error: {err}");
    if json {
        let payload = serde_json::json!({
            "status": "failed",
            "stage": stage.to_string(),
            "error": err.to_string(),
        });
        if let Ok(s) = json_pretty(&payload) {
            println!("{s}");
        }
    }
    exit_code_for(stage)
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner unless `--json` asked for machine-readable output.
pub fn maybe_spinner(json: bool, msg: &str) -> Option<ProgressBar> {
    (!json).then(|| spinner(msg))
}

pub fn spin_ok(pb: Option<&ProgressBar>, msg: &str) {
    if let Some(pb) = pb {
        finish(pb, &format!("✓ {msg}"));
    }
}

pub fn spin_fail(pb: Option<&ProgressBar>, msg: &str) {
    if let Some(pb) = pb {
        finish(pb, &format!("✗ {msg}"));
    }
}

fn finish(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg.to_owned());
}

pub fn colorize_result(result: &str) -> String {
    use console::Style;
    match result {
        "passed" => Style::new().green().apply_to(result).to_string(),
        "failed" => Style::new().red().bold().apply_to(result).to_string(),
        "skipped" => Style::new().dim().apply_to(result).to_string(),
        other => other.to_owned(),
    }
}

/// Human-readable smoke test summary, one line per step.
pub fn print_test_report(report: &TestReport) {
    for command in &report.passed {
        println!("  {} {command}", colorize_result("passed"));
    }
    if let Some(failure) = &report.failure {
        println!(
            "  {} {} ({})",
            colorize_result("failed"),
            failure.command,
            failure.reason
        );
    }
    if report.skipped > 0 {
        println!("  {} {} more", colorize_result("skipped"), report.skipped);
    }
}
