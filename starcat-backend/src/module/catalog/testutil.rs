///! Fixtures shared by the catalog tests

use super::ingest::{IngestOptions, ingest_str};
use super::store::Store;
use serde_json::json;
use std::sync::Arc;

/// One EDSM dump line
pub fn edsm_line(id: i64, name: &str, x: f64, y: f64, z: f64, date: &str) -> String {
    json!({
        "id": id,
        "name": name,
        "coords": { "x": x, "y": y, "z": z },
        "date": date,
    })
    .to_string()
}

pub fn options_with_batch(batch_size: usize) -> IngestOptions {
    IngestOptions {
        batch_size,
        yield_sleep_ms: 1,
        ..Default::default()
    }
}

/// Store seeded with (id, name, x, y, z) records
pub fn seeded_store(systems: &[(i64, &str, f64, f64, f64)]) -> Arc<Store> {
    let store = Store::open_in_memory().unwrap();
    let text = systems
        .iter()
        .map(|&(id, name, x, y, z)| edsm_line(id, name, x, y, z, "2020-01-01 00:00:00"))
        .collect::<Vec<_>>()
        .join("\n");
    let report = ingest_str(&store, &text, &IngestOptions::default()).unwrap();
    assert!(report.skipped.is_empty(), "seed skipped: {:?}", report.skipped);
    Arc::new(store)
}

/// A handful of real systems around Sol
pub fn local_bubble() -> Arc<Store> {
    seeded_store(&[
        (27, "Sol", 0.0, 0.0, 0.0),
        (44, "Alpha Centauri", 3.03125, -0.09375, 3.15625),
        (86, "Barnard's Star", -3.03125, 1.375, 4.9375),
        (110, "Wolf 359", 3.875, 6.46875, -1.90625),
        (512, "Sirius", 6.25, -1.28125, -5.75),
        (1001, "Tucanae Sector CQ-Y d79", 120.5, -80.25, 40.0),
        (1002, "Tucanae Sector CQ-Y d80", 121.5, -81.25, 41.0),
        (1003, "Tucanae Sector CQ-Y c5", 118.0, -79.0, 38.5),
        (1004, "HIP 6543", -40.0, 10.0, 22.0),
        (1005, "Synuefe XR-H d11-102", 357.34375, -49.34375, -74.75),
    ])
}
