///! EDSM dump ingestion
///!
///! Streams system records into the store in batches. Every record is
///! classified, bucketed into a grid cell and queued under its sector; a full
///! batch is probed against the store (incremental mode) and then written in a
///! single transaction.
///!
///! ## Modes
///! - Fresh: tables are empty, every record is an insert and ids are handed
///!   out sequentially without probing.
///! - Incremental: records already present are updated only when their name
///!   changed or a coordinate moved by at least the drift tolerance.

use super::grid;
use super::name_codec::{self, Identifier};
use super::sector::{NameIdAllocator, QueuedSystem, RowAction, SectorCache};
use super::store::{IdTable, Store};
use crate::error::{CatalogError, CatalogResult};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use starcat_common::EdsmSystemJson;
use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant};

/// How the session decides between fresh and incremental loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Fresh when the Systems table is empty, incremental otherwise
    #[default]
    Auto,
    Fresh,
    Incremental,
}

/// Ingest tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Records queued before a batch is written
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Coordinate change (fixed-point units) that triggers an update
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: i32,

    /// Pause between batches while readers are waiting on the store
    #[serde(default = "default_yield_sleep_ms")]
    pub yield_sleep_ms: u64,

    #[serde(default)]
    pub mode: IngestMode,
}

fn default_batch_size() -> usize {
    100_000
}

fn default_drift_tolerance() -> i32 {
    4
}

fn default_yield_sleep_ms() -> u64 {
    50
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            drift_tolerance: default_drift_tolerance(),
            yield_sleep_ms: default_yield_sleep_ms(),
            mode: IngestMode::default(),
        }
    }
}

/// Why a record did not make it into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCause {
    Malformed(String),
    InsertFailed(String),
}

impl std::fmt::Display for SkipCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipCause::Malformed(reason) => write!(f, "malformed record: {}", reason),
            SkipCause::InsertFailed(reason) => write!(f, "insert failed: {}", reason),
        }
    }
}

/// A skipped record and the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// 1-based input line, when read from a stream
    pub line: Option<usize>,
    pub edsm_id: Option<i64>,
    pub name: Option<String>,
    pub cause: SkipCause,
}

/// Outcome of an ingest run
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub records_read: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub sectors_created: usize,
    pub batches: usize,
    pub skipped: Vec<SkippedRecord>,
    /// Latest record timestamp seen, for resuming incremental downloads
    pub max_date: Option<DateTime<Utc>>,
    pub fresh: bool,
    pub cancelled: bool,
    pub duration_seconds: f64,
}

impl IngestReport {
    /// Rows written (inserted plus updated)
    pub fn changes(&self) -> usize {
        self.inserted + self.updated
    }
}

/// One ingest run over one store
///
/// Owns every cache of the run; drop it (or call [`IngestSession::finish`])
/// when the input is exhausted.
pub struct IngestSession<'a> {
    store: &'a Store,
    options: IngestOptions,
    fresh: bool,
    sectors: SectorCache,
    name_ids: NameIdAllocator,
    queued: usize,
    report: IngestReport,
    started: Instant,
}

impl<'a> IngestSession<'a> {
    pub fn new(store: &'a Store, options: IngestOptions) -> CatalogResult<Self> {
        if options.batch_size == 0 {
            return Err(CatalogError::InvalidInput("batch size must be positive".into()));
        }

        let fresh = match options.mode {
            IngestMode::Auto => store.tables_empty()?,
            IngestMode::Fresh => true,
            IngestMode::Incremental => false,
        };

        let sectors = SectorCache::new(store.next_id(IdTable::Sectors)?);
        let name_ids = NameIdAllocator::new(store.next_id(IdTable::Names)?);

        tracing::info!(
            "Starting {} ingest (batch size {}, drift tolerance {})",
            if fresh { "fresh" } else { "incremental" },
            options.batch_size,
            options.drift_tolerance
        );

        Ok(Self {
            store,
            options,
            fresh,
            sectors,
            name_ids,
            queued: 0,
            report: IngestReport {
                fresh,
                ..Default::default()
            },
            started: Instant::now(),
        })
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    fn skip(&mut self, line: Option<usize>, edsm_id: Option<i64>, name: Option<String>, cause: SkipCause) {
        tracing::warn!(
            "Skipping record (line {:?}, edsm id {:?}, name {:?}): {}",
            line,
            edsm_id,
            name,
            cause
        );
        self.report.skipped.push(SkippedRecord {
            line,
            edsm_id,
            name,
            cause,
        });
    }

    /// Feed one line of a dump
    ///
    /// Accepts the EDSM layout (a JSON array with one object per line) as
    /// well as JSON lines. Returns true when the line completed a batch.
    pub fn push_line(&mut self, line_no: usize, line: &str) -> CatalogResult<bool> {
        let text = line.trim().trim_start_matches('[').trim_end_matches(']').trim();
        let text = text.trim_end_matches(',').trim();
        if text.is_empty() {
            return Ok(false);
        }

        match serde_json::from_str::<EdsmSystemJson>(text) {
            Ok(record) => self.push(Some(line_no), record),
            Err(e) => {
                self.report.records_read += 1;
                self.skip(Some(line_no), None, None, SkipCause::Malformed(e.to_string()));
                Ok(false)
            }
        }
    }

    /// Feed one parsed record; returns true when it completed a batch
    pub fn push_record(&mut self, record: EdsmSystemJson) -> CatalogResult<bool> {
        self.push(None, record)
    }

    fn push(&mut self, line: Option<usize>, record: EdsmSystemJson) -> CatalogResult<bool> {
        self.report.records_read += 1;

        if let Some(date) = record.timestamp() {
            if self.report.max_date.is_none_or(|max| date > max) {
                self.report.max_date = Some(date);
            }
        }

        let name = match record.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                self.skip(line, record.id, None, SkipCause::Malformed("missing name".into()));
                return Ok(false);
            }
        };
        let Some(edsm_id) = record.id else {
            self.skip(line, None, Some(name), SkipCause::Malformed("missing id".into()));
            return Ok(false);
        };
        let Some(position) = record.coords.as_ref().and_then(|c| c.position()) else {
            self.skip(
                line,
                Some(edsm_id),
                Some(name),
                SkipCause::Malformed("missing or invalid coordinates".into()),
            );
            return Ok(false);
        };
        if !position.fits_fixed() {
            self.skip(
                line,
                Some(edsm_id),
                Some(name),
                SkipCause::Malformed(format!("coordinates out of range {}", position)),
            );
            return Ok(false);
        }

        let classification = name_codec::classify_canonical(&name);
        let grid_id = grid::id(position.x, position.z);
        let (x, y, z) = position.to_fixed();

        let store = self.store;
        let fresh = self.fresh;
        let index = self.sectors.resolve(&classification.sector, grid_id, |sector, grid| {
            if fresh {
                Ok(None)
            } else {
                store.find_sector(sector, grid)
            }
        })?;

        self.sectors.queue(
            index,
            QueuedSystem {
                edsm_id,
                name,
                classification,
                x,
                y,
                z,
                grid_id,
                action: RowAction::Insert,
            },
        );
        self.queued += 1;

        if self.queued >= self.options.batch_size {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Write everything queued so far
    pub fn flush(&mut self) -> CatalogResult<()> {
        if self.queued == 0 {
            return Ok(());
        }

        if !self.fresh {
            self.probe_existing()?;
        }
        self.write_batch()?;

        self.sectors.clear_queues();
        self.queued = 0;
        self.report.batches += 1;

        tracing::info!(
            "Batch {} written: {} read, {} inserted, {} updated, {} skipped",
            self.report.batches,
            self.report.records_read,
            self.report.inserted,
            self.report.updated,
            self.report.skipped.len()
        );
        Ok(())
    }

    /// Decide insert / update / unchanged for every queued record
    fn probe_existing(&mut self) -> CatalogResult<()> {
        let store = self.store;
        let tolerance = self.options.drift_tolerance;

        for sector in self.sectors.pending_mut() {
            for system in sector.queued.iter_mut() {
                let existing = store.read(|conn| probe_row(conn, system.edsm_id))?;
                system.action = match existing {
                    None => RowAction::Insert,
                    Some(row) => row.action_for(system, tolerance),
                };
            }
        }
        Ok(())
    }

    /// One transaction: new sectors, then every queued record
    fn write_batch(&mut self) -> CatalogResult<()> {
        let store = self.store;
        let sectors = &mut self.sectors;
        let name_ids = &mut self.name_ids;
        let report = &mut self.report;

        store.write(|conn| {
            let mut tx = conn.transaction()?;

            for sector in sectors.unwritten_mut() {
                tx.execute(
                    "INSERT INTO Sectors (id, name, gridid) VALUES (?1, ?2, ?3)",
                    params![sector.id, sector.name, sector.grid_id],
                )?;
                sector.needs_insert = false;
                report.sectors_created += 1;
            }

            for sector in sectors.pending_mut() {
                let sector_id = sector.id;
                for system in sector.queued.iter_mut() {
                    if system.action == RowAction::Unchanged {
                        report.unchanged += 1;
                        continue;
                    }

                    let savepoint = tx.savepoint()?;
                    match write_system(&savepoint, sector_id, system, name_ids) {
                        Ok(()) => {
                            savepoint.commit()?;
                            match system.action {
                                RowAction::Insert => report.inserted += 1,
                                _ => report.updated += 1,
                            }
                        }
                        Err(e) => {
                            drop(savepoint);
                            tracing::warn!(
                                "Failed to write system {} ({}): {}",
                                system.name,
                                system.edsm_id,
                                e
                            );
                            report.skipped.push(SkippedRecord {
                                line: None,
                                edsm_id: Some(system.edsm_id),
                                name: Some(system.name.clone()),
                                cause: SkipCause::InsertFailed(e.to_string()),
                            });
                        }
                    }
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Flush the last batch and return the report
    pub fn finish(mut self) -> CatalogResult<IngestReport> {
        self.flush()?;
        Ok(self.into_report())
    }

    fn into_report(mut self) -> IngestReport {
        self.report.duration_seconds = self.started.elapsed().as_secs_f64();
        tracing::info!(
            "Ingest complete: {} read, {} inserted, {} updated, {} unchanged, {} skipped, {} new sectors in {:.2}s{}",
            self.report.records_read,
            self.report.inserted,
            self.report.updated,
            self.report.unchanged,
            self.report.skipped.len(),
            self.report.sectors_created,
            self.report.duration_seconds,
            if self.report.cancelled { " (cancelled)" } else { "" }
        );
        self.report
    }
}

/// Stored state of a system, as needed for change detection
struct ExistingRow {
    row_id: i64,
    code: i64,
    sector_name: String,
    names_text: Option<String>,
    x: i32,
    y: i32,
    z: i32,
}

impl ExistingRow {
    fn action_for(&self, system: &QueuedSystem, tolerance: i32) -> RowAction {
        let stored = Identifier::unpack(self.code as u64);
        let same_code = match (&system.classification.identifier, stored) {
            (Identifier::Standard(new), Identifier::Standard(old)) => *new == old,
            (Identifier::NonStandard { .. }, Identifier::NonStandard { .. }) => {
                self.names_text.as_deref() == Some(system.classification.star_name.as_str())
            }
            _ => false,
        };
        let same_name = same_code && self.sector_name == system.classification.sector;

        let moved = (self.x - system.x).abs() >= tolerance
            || (self.y - system.y).abs() >= tolerance
            || (self.z - system.z).abs() >= tolerance;

        if same_name && !moved {
            return RowAction::Unchanged;
        }

        let keep_name_ref = match stored {
            Identifier::NonStandard { name_ref } if same_code => Some(name_ref),
            _ => None,
        };
        RowAction::Update {
            row_id: self.row_id,
            keep_name_ref,
        }
    }
}

fn probe_row(conn: &Connection, edsm_id: i64) -> rusqlite::Result<Option<ExistingRow>> {
    conn.query_row(
        "SELECT s.id, s.name, c.name, n.name, s.x, s.y, s.z
         FROM Systems s
         JOIN Sectors c ON c.id = s.sector
         LEFT JOIN Names n ON n.id = s.name
         WHERE s.edsmid = ?1",
        params![edsm_id],
        |row| {
            Ok(ExistingRow {
                row_id: row.get(0)?,
                code: row.get(1)?,
                sector_name: row.get(2)?,
                names_text: row.get(3)?,
                x: row.get(4)?,
                y: row.get(5)?,
                z: row.get(6)?,
            })
        },
    )
    .optional()
}

/// Name column value for a queued system, inserting a Names row if needed
fn name_code(
    conn: &Connection,
    system: &mut QueuedSystem,
    keep_name_ref: Option<u32>,
    name_ids: &mut NameIdAllocator,
) -> CatalogResult<i64> {
    if system.classification.is_standard() {
        return Ok(system.classification.id() as i64);
    }

    let name_ref = match keep_name_ref {
        Some(name_ref) => name_ref,
        None => {
            let name_ref = name_ids
                .allocate()
                .ok_or_else(|| CatalogError::InvalidInput("Names id space exhausted".into()))?;
            conn.execute(
                "INSERT INTO Names (id, name) VALUES (?1, ?2)",
                params![name_ref, system.classification.star_name],
            )?;
            name_ref
        }
    };
    system.classification.set_name_ref(name_ref);
    Ok(system.classification.id() as i64)
}

fn write_system(
    conn: &Connection,
    sector_id: i64,
    system: &mut QueuedSystem,
    name_ids: &mut NameIdAllocator,
) -> CatalogResult<()> {
    match system.action {
        RowAction::Insert => {
            let code = name_code(conn, system, None, name_ids)?;
            conn.execute(
                "INSERT INTO Systems (sector, name, x, y, z, edsmid) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![sector_id, code, system.x, system.y, system.z, system.edsm_id],
            )?;
        }
        RowAction::Update { row_id, keep_name_ref } => {
            let code = name_code(conn, system, keep_name_ref, name_ids)?;
            conn.execute(
                "UPDATE Systems SET sector = ?1, name = ?2, x = ?3, y = ?4, z = ?5 WHERE id = ?6",
                params![sector_id, code, system.x, system.y, system.z, row_id],
            )?;
        }
        RowAction::Unchanged => {}
    }
    Ok(())
}

/// Ingest a line-oriented dump
///
/// `cancel` is polled after every batch; once it returns true the run stops
/// with the batches written so far.
pub fn ingest_reader<R, C>(
    store: &Store,
    reader: R,
    options: &IngestOptions,
    cancel: C,
) -> CatalogResult<IngestReport>
where
    R: BufRead,
    C: Fn() -> bool,
{
    let yield_sleep = Duration::from_millis(options.yield_sleep_ms);
    let mut session = IngestSession::new(store, options.clone())?;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if !session.push_line(index + 1, &line)? {
            continue;
        }

        while store.should_yield() {
            tracing::debug!("Readers waiting, pausing ingest for {:?}", yield_sleep);
            std::thread::sleep(yield_sleep);
        }

        if cancel() {
            tracing::info!("Ingest cancelled after batch {}", session.report().batches);
            session.report.cancelled = true;
            return Ok(session.into_report());
        }
    }

    session.finish()
}

/// Ingest a dump file
pub fn ingest_file<C>(
    store: &Store,
    path: impl AsRef<Path>,
    options: &IngestOptions,
    cancel: C,
) -> CatalogResult<IngestReport>
where
    C: Fn() -> bool,
{
    let path = path.as_ref();
    tracing::info!("Ingesting systems from {:?}", path);
    let file = std::fs::File::open(path)?;
    ingest_reader(store, std::io::BufReader::new(file), options, cancel)
}

/// Ingest dump text held in memory
pub fn ingest_str(store: &Store, text: &str, options: &IngestOptions) -> CatalogResult<IngestReport> {
    ingest_reader(store, text.as_bytes(), options, || false)
}
