use super::{
    json_pretty, maybe_spinner, print_test_report, report_error, spin_fail, spin_ok,
    EXIT_SUCCESS, EXIT_TEST_FAILURE,
};
use pallet_core::{Engine, InstallOptions};
use std::path::Path;

pub fn run(
    engine: &Engine,
    manifest: &Path,
    options: InstallOptions,
    json: bool,
) -> Result<u8, String> {
    let manifest = match engine.load_manifest(manifest) {
        Ok(m) => m,
        Err(e) => return Ok(report_error(&e, json)),
    };

    let label = format!("{} {}", manifest.name(), manifest.version());
    let pb = maybe_spinner(json, &format!("installing {label}..."));
    let outcome = match engine.install(&manifest, options) {
        Ok(o) => {
            spin_ok(pb.as_ref(), &format!("installed {label}"));
            o
        }
        Err(e) => {
            spin_fail(pb.as_ref(), &format!("install of {label} failed"));
            return Ok(report_error(&e, json));
        }
    };
    let passed = outcome.tests_passed();

    if json {
        let status = if passed { "installed" } else { "tests_failed" };
        let payload = serde_json::json!({
            "name": outcome.receipt.name,
            "version": outcome.receipt.version,
            "checksum": outcome.receipt.archive_checksum,
            "origin": outcome.origin,
            "artifacts": outcome.artifacts(),
            "tests": outcome.tests,
            "status": status,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{} files under {} (archive from {})",
            outcome.artifacts().len(),
            engine.layout().prefix().display(),
            outcome.origin
        );
        for artifact in outcome.artifacts() {
            println!("  {}", artifact.path.display());
        }
        match &outcome.tests {
            Some(report) => {
                println!("smoke tests:");
                print_test_report(report);
            }
            None => println!("smoke tests skipped"),
        }
    }

    if passed {
        Ok(EXIT_SUCCESS)
    } else {
        eprintln!("error: smoke tests failed; the installed files were kept");
        Ok(EXIT_TEST_FAILURE)
    }
}
