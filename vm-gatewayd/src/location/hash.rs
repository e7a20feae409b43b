use std::collections::HashMap;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::LocationRecord;

/// Hash only the placement; last_seen changes on every scan but does not
/// represent a change in where machines live.
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    zone: &'a str,
}

/// Computes a SHA-256 hash of the name -> zone mapping.
/// Records are sorted by name for deterministic output.
pub fn compute_fingerprint(records: &HashMap<String, LocationRecord>) -> String {
    let mut views: Vec<HashView<'_>> = records
        .values()
        .map(|r| HashView {
            name: &r.name,
            zone: &r.zone,
        })
        .collect();
    views.sort_by(|a, b| a.name.cmp(b.name));

    let mut hasher = Sha256::new();
    for view in &views {
        // Serializing two borrowed strings cannot fail.
        if let Ok(line) = serde_json::to_vec(view) {
            hasher.update(&line);
            hasher.update(b"\n");
        }
    }
    hex::encode(hasher.finalize())
}
