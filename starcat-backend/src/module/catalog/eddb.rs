///! EDDB enrichment ingest
///!
///! Populated-system details keyed by EDSM id. Rows are upserted; a row is
///! only replaced by a record with a newer `updated_at`.

use super::store::Store;
use crate::error::CatalogResult;
use rusqlite::{Connection, params};
use starcat_common::EddbSystemJson;
use std::io::BufRead;
use std::path::Path;
use std::time::Instant;

/// Records written per transaction
const EDDB_BATCH: usize = 10_000;

const UPSERT_SQL: &str = "
    INSERT INTO EDDB (edsmid, eddbid, eddbupdatedat, population, faction, government,
                      allegiance, state, security, primaryeconomy, needspermit, power,
                      powerstate, properties)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
    ON CONFLICT(edsmid) DO UPDATE SET
        eddbid = excluded.eddbid,
        eddbupdatedat = excluded.eddbupdatedat,
        population = excluded.population,
        faction = excluded.faction,
        government = excluded.government,
        allegiance = excluded.allegiance,
        state = excluded.state,
        security = excluded.security,
        primaryeconomy = excluded.primaryeconomy,
        needspermit = excluded.needspermit,
        power = excluded.power,
        powerstate = excluded.powerstate,
        properties = excluded.properties
    WHERE excluded.eddbupdatedat > EDDB.eddbupdatedat
";

/// Outcome of an EDDB ingest
#[derive(Debug, Clone, Default)]
pub struct EddbReport {
    pub records_read: usize,
    /// Rows inserted or replaced
    pub upserted: usize,
    pub unpopulated: usize,
    pub stale: usize,
    pub malformed: usize,
    pub duration_seconds: f64,
}

struct PendingRow {
    record: EddbSystemJson,
    edsm_id: i64,
    raw: String,
}

fn write_rows(store: &Store, rows: &mut Vec<PendingRow>, report: &mut EddbReport) -> CatalogResult<()> {
    if rows.is_empty() {
        return Ok(());
    }

    store.write(|conn| {
        let tx = conn.transaction()?;
        for row in rows.iter() {
            if upsert(&tx, row)? == 0 {
                report.stale += 1;
            } else {
                report.upserted += 1;
            }
        }
        tx.commit()?;
        Ok(())
    })?;

    tracing::debug!("EDDB batch of {} written", rows.len());
    rows.clear();
    Ok(())
}

fn upsert(conn: &Connection, row: &PendingRow) -> rusqlite::Result<usize> {
    let r = &row.record;
    conn.execute(
        UPSERT_SQL,
        params![
            row.edsm_id,
            r.id.unwrap_or_default(),
            r.updated_at.unwrap_or_default(),
            r.population.unwrap_or_default(),
            r.controlling_minor_faction,
            r.government,
            r.allegiance,
            r.primary_state(),
            r.security,
            r.primary_economy,
            r.needs_permit.unwrap_or(false),
            r.power,
            r.power_state,
            row.raw,
        ],
    )
}

/// Ingest an EDDB systems dump (JSON lines, or an array laid out one object per line)
pub fn ingest_eddb<R: BufRead>(store: &Store, reader: R) -> CatalogResult<EddbReport> {
    let started = Instant::now();
    let mut report = EddbReport::default();
    let mut pending = Vec::with_capacity(EDDB_BATCH);

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim().trim_start_matches('[').trim_end_matches(']').trim();
        let text = text.trim_end_matches(',').trim();
        if text.is_empty() {
            continue;
        }
        report.records_read += 1;

        let record: EddbSystemJson = match serde_json::from_str(text) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping malformed EDDB line {}: {}", index + 1, e);
                report.malformed += 1;
                continue;
            }
        };

        if record.is_populated == Some(false) {
            report.unpopulated += 1;
            continue;
        }
        let Some(edsm_id) = record.edsm_id else {
            tracing::warn!("Skipping EDDB line {}: no edsm_id", index + 1);
            report.malformed += 1;
            continue;
        };

        pending.push(PendingRow {
            record,
            edsm_id,
            raw: text.to_string(),
        });
        if pending.len() >= EDDB_BATCH {
            write_rows(store, &mut pending, &mut report)?;
        }
    }
    write_rows(store, &mut pending, &mut report)?;

    report.duration_seconds = started.elapsed().as_secs_f64();
    tracing::info!(
        "EDDB ingest complete: {} read, {} upserted, {} stale, {} unpopulated, {} malformed in {:.2}s",
        report.records_read,
        report.upserted,
        report.stale,
        report.unpopulated,
        report.malformed,
        report.duration_seconds
    );
    Ok(report)
}

pub fn ingest_eddb_file(store: &Store, path: impl AsRef<Path>) -> CatalogResult<EddbReport> {
    let path = path.as_ref();
    tracing::info!("Ingesting EDDB systems from {:?}", path);
    let file = std::fs::File::open(path)?;
    ingest_eddb(store, std::io::BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eddb_line(edsm_id: i64, updated_at: i64, population: i64, populated: bool) -> String {
        json!({
            "id": edsm_id + 5000,
            "edsm_id": edsm_id,
            "updated_at": updated_at,
            "is_populated": populated,
            "population": population,
            "controlling_minor_faction": "Mother Gaia",
            "government": "Democracy",
            "allegiance": "Federation",
            "states": [{ "id": 80, "name": "None" }, { "id": 16, "name": "Boom" }],
            "security": "High",
            "primary_economy": "Refinery",
            "needs_permit": true,
            "power": "Zachary Hudson",
            "power_state": "Controlled"
        })
        .to_string()
    }

    fn population(store: &Store, edsm_id: i64) -> i64 {
        store
            .read(|conn| {
                conn.query_row(
                    "SELECT population FROM EDDB WHERE edsmid = ?1",
                    params![edsm_id],
                    |r| r.get(0),
                )
            })
            .unwrap()
    }

    #[test]
    fn test_ingest_and_skip() {
        let store = Store::open_in_memory().unwrap();
        let text = format!(
            "[\n{},\n{},\n{{\"id\":\n{}\n]",
            eddb_line(27, 100, 22_780_919_531, true),
            eddb_line(44, 100, 0, false),
            json!({ "id": 9, "population": 1 }),
        );

        let report = ingest_eddb(&store, text.as_bytes()).unwrap();
        assert_eq!(report.records_read, 4);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.unpopulated, 1);
        assert_eq!(report.malformed, 2);
        assert_eq!(store.stats().unwrap().eddb, 1);

        let (state, permit, properties): (String, bool, String) = store
            .read(|conn| {
                conn.query_row(
                    "SELECT state, needspermit, properties FROM EDDB WHERE edsmid = 27",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
            })
            .unwrap();
        assert_eq!(state, "None");
        assert!(permit);
        assert!(properties.contains("Mother Gaia"));
    }

    #[test]
    fn test_only_newer_records_replace() {
        let store = Store::open_in_memory().unwrap();
        ingest_eddb(&store, eddb_line(27, 200, 10, true).as_bytes()).unwrap();

        let report = ingest_eddb(&store, eddb_line(27, 100, 20, true).as_bytes()).unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(population(&store, 27), 10);

        let report = ingest_eddb(&store, eddb_line(27, 300, 30, true).as_bytes()).unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(population(&store, 27), 30);
    }
}
