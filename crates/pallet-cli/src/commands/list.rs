use super::{json_pretty, report_error, EXIT_SUCCESS};
use pallet_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let receipts = match engine.list() {
        Ok(r) => r,
        Err(e) => return Ok(report_error(&e, json)),
    };
    if json {
        println!("{}", json_pretty(&receipts)?);
    } else if receipts.is_empty() {
        println!("no packages installed");
    } else {
        println!("{:<20} {:<12} {:<6} CHECKSUM", "NAME", "VERSION", "FILES");
        for r in &receipts {
            println!(
                "{:<20} {:<12} {:<6} {}",
                r.name.as_str(),
                r.version.as_str(),
                r.artifacts.len(),
                r.archive_checksum.short()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
