///! EDSM dump download and scheduled refresh
///!
///! Downloads the EDSM systems dump (and optionally the EDDB populated
///! systems dump) and feeds them through the catalog ingest.

pub mod download;
pub mod updater;

pub use download::{build_client, download_to_file};
pub use updater::{EdsmConfig, EdsmUpdater, UpdateSummary, start_edsm_updater};
