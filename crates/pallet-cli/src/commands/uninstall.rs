use super::{json_pretty, report_error, EXIT_SUCCESS};
use pallet_core::Engine;

pub fn run(engine: &Engine, name: &str, json: bool) -> Result<u8, String> {
    let removed = match engine.uninstall(name) {
        Ok(r) => r,
        Err(e) => return Ok(report_error(&e, json)),
    };
    if json {
        let payload = serde_json::json!({
            "name": name,
            "removed": removed,
            "status": "uninstalled",
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("uninstalled {name} ({} files removed)", removed.len());
        for path in &removed {
            println!("  {}", path.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
