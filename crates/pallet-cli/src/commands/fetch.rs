use super::{json_pretty, maybe_spinner, report_error, spin_fail, spin_ok, EXIT_SUCCESS};
use pallet_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, manifest: &Path, json: bool) -> Result<u8, String> {
    let manifest = match engine.load_manifest(manifest) {
        Ok(m) => m,
        Err(e) => return Ok(report_error(&e, json)),
    };

    let pb = maybe_spinner(json, &format!("fetching {}...", manifest.url()));
    let archive = match engine.fetch_verified(&manifest) {
        Ok(a) => {
            spin_ok(pb.as_ref(), &format!("verified {}", manifest.checksum().short()));
            a
        }
        Err(e) => {
            spin_fail(pb.as_ref(), "fetch failed");
            return Ok(report_error(&e, json));
        }
    };

    if json {
        let payload = serde_json::json!({
            "name": manifest.name(),
            "url": archive.url,
            "checksum": manifest.checksum(),
            "bytes": archive.bytes.len(),
            "origin": archive.origin,
            "attempts": archive.attempts,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{}: {} bytes from {}",
            manifest.name(),
            archive.bytes.len(),
            archive.origin
        );
    }
    Ok(EXIT_SUCCESS)
}
