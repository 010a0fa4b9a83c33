///! Star catalog module
///!
///! Persists EDSM systems compactly in SQLite and answers name and spatial
///! queries over them.
///!
///! ## Storage layout
///! - Procedural names ("Tucanae Sector CQ-Y d79") are packed into one 64-bit
///!   code next to a sector reference; other names live in a Names table.
///! - Sectors are keyed by (name, grid cell), so one sector name may appear
///!   in several cells.
///!
///! ## Main Components
///! - `IngestSession`: batched dump ingestion (fresh or incremental)
///! - `QueryEngine`: exact, wildcard and spatial queries
///! - `SystemCache`: memo of resolved systems keyed by EDSM id and name

// ============ Name Codec & Grid ============
pub mod name_codec;
pub use name_codec::{Classification, EntryType, Identifier, StandardCode, classify, classify_id};

pub mod grid;
pub use grid::GridRect;

// ============ Storage ============
mod store;
pub use store::{CatalogStats, Store};

// ============ Ingest ============
mod sector;
pub use sector::{Sector, SectorCache};

mod ingest;
pub use ingest::{
    IngestMode, IngestOptions, IngestReport, IngestSession, SkipCause, SkippedRecord,
    ingest_file, ingest_reader, ingest_str,
};

mod eddb;
pub use eddb::{EddbReport, ingest_eddb, ingest_eddb_file};

// ============ Queries ============
mod query;
pub use query::{NearbySystem, PathMetric, PathStep, QueryEngine};

// ============ Cache ============
mod cache;
pub use cache::{CacheConfig, SystemCache, SystemLookup};

#[cfg(test)]
pub(crate) mod testutil;
