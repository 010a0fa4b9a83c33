///! Read-side queries over the catalog store
///!
///! Every query holds the store lock for a single round trip. Stored rows are
///! turned back into display names through the name codec.

use super::name_codec::{self, EntryType, NON_STANDARD_SECTOR};
use super::store::Store;
use crate::error::CatalogResult;
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use starcat_common::{EddbInfo, FIXED_POINT_SCALE, Position, StarVertex, SystemRecord, to_fixed};
use std::collections::HashSet;
use std::sync::Arc;

const SYSTEM_SELECT: &str = "
    SELECT s.edsmid, s.name, s.x, s.y, s.z, c.id, c.name, c.gridid, n.name
    FROM Systems s
    JOIN Sectors c ON c.id = s.sector
    LEFT JOIN Names n ON n.id = s.name";

/// Half-width of the box searched by [`QueryEngine::position_lookup`], fixed-point units
pub const POSITION_LOOKUP_UNITS: i32 = 16;

/// Multiplier of the deterministic sampling hash used by vector extracts
const SAMPLE_HASH: i64 = 2331;

const COLOR_ORIGIN: u32 = 0xFFFF_D700;
const COLOR_TIERS: [u32; 4] = [0xFFFF_FFFF, 0xFFD0_D0D0, 0xFFA0_A0A0, 0xFF70_7070];

fn map_system(row: &Row<'_>) -> rusqlite::Result<SystemRecord> {
    let code: i64 = row.get(1)?;
    let sector: String = row.get(6)?;
    let names_text: Option<String> = row.get(8)?;
    Ok(SystemRecord {
        name: name_codec::display_name(code as u64, &sector, names_text.as_deref()),
        x: row.get(2)?,
        y: row.get(3)?,
        z: row.get(4)?,
        edsm_id: row.get(0)?,
        grid_id: row.get(7)?,
        sector_id: row.get(5)?,
    })
}

/// Escape `%`, `_` and the escape character for a `LIKE ... ESCAPE '\'` pattern
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// A system returned by a distance query
#[derive(Debug, Clone, PartialEq)]
pub struct NearbySystem {
    pub system: SystemRecord,
    /// Distance in light years from the query point
    pub distance: f64,
}

/// Scoring used by [`QueryEngine::nearest_on_path`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathMetric {
    /// Closest to the waypoint
    #[default]
    NearestWaypoint,
    /// Smallest perpendicular distance from the current to waypoint line
    MinDeviationFromPath,
    /// Closest to the waypoint among candidates deviating at most 100 ly
    MaxDeviation100Ly,
    MaxDeviation250Ly,
    MaxDeviation500Ly,
    /// Distance to the waypoint plus half the deviation
    WaypointDeviationHalf,
}

impl PathMetric {
    pub const ALL: [PathMetric; 6] = [
        PathMetric::NearestWaypoint,
        PathMetric::MinDeviationFromPath,
        PathMetric::MaxDeviation100Ly,
        PathMetric::MaxDeviation250Ly,
        PathMetric::MaxDeviation500Ly,
        PathMetric::WaypointDeviationHalf,
    ];

    fn deviation_limit(&self) -> Option<f64> {
        match self {
            PathMetric::MaxDeviation100Ly => Some(100.0),
            PathMetric::MaxDeviation250Ly => Some(250.0),
            PathMetric::MaxDeviation500Ly => Some(500.0),
            _ => None,
        }
    }

    /// Score of a candidate, lower is better; `None` rules it out
    fn score(&self, step: &PathStep) -> Option<f64> {
        if let Some(limit) = self.deviation_limit() {
            return (step.deviation <= limit).then(|| step.distance_to_wanted.powi(2));
        }
        Some(match self {
            PathMetric::NearestWaypoint => step.distance_to_wanted.powi(2),
            PathMetric::MinDeviationFromPath => step.deviation,
            _ => step.distance_to_wanted + step.deviation / 2.0,
        })
    }
}

/// Chosen next system of a route
#[derive(Debug, Clone, PartialEq)]
pub struct PathStep {
    pub system: SystemRecord,
    pub distance_from_current: f64,
    pub distance_to_wanted: f64,
    /// Perpendicular distance from the current to waypoint line
    pub deviation: f64,
}

/// Distance from `point` to the infinite line through `from` and `to`
fn deviation_from_line(point: &Position, from: &Position, to: &Position) -> f64 {
    let direction = to.sub(from);
    let length = direction.length();
    let offset = point.sub(from);
    if length == 0.0 {
        return offset.length();
    }
    offset.cross(&direction).length() / length
}

/// Fixed-point box `[lo, hi]` per axis
#[derive(Debug, Clone, Copy)]
struct FixedBox {
    lo: (i32, i32, i32),
    hi: (i32, i32, i32),
}

impl FixedBox {
    fn around(centre: &Position, half_width_ly: f64) -> Self {
        let (x, y, z) = centre.to_fixed();
        let r = to_fixed(half_width_ly.abs());
        Self {
            lo: (x.saturating_sub(r), y.saturating_sub(r), z.saturating_sub(r)),
            hi: (x.saturating_add(r), y.saturating_add(r), z.saturating_add(r)),
        }
    }

    fn intersect(&self, other: &FixedBox) -> Option<FixedBox> {
        let lo = (
            self.lo.0.max(other.lo.0),
            self.lo.1.max(other.lo.1),
            self.lo.2.max(other.lo.2),
        );
        let hi = (
            self.hi.0.min(other.hi.0),
            self.hi.1.min(other.hi.1),
            self.hi.2.min(other.hi.2),
        );
        (lo.0 <= hi.0 && lo.1 <= hi.1 && lo.2 <= hi.2).then_some(FixedBox { lo, hi })
    }
}

/// Catalog queries
pub struct QueryEngine {
    store: Arc<Store>,
}

impl QueryEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn select_systems<P: rusqlite::Params>(&self, clause: &str, params: P) -> CatalogResult<Vec<SystemRecord>> {
        let sql = format!("{} {}", SYSTEM_SELECT, clause);
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params, map_system)?;
            rows.collect()
        })
    }

    /// All systems with exactly this name (names are not unique)
    ///
    /// Matching is case-insensitive. A procedural name is looked up both by
    /// its code and, when its spelling is not canonical, by stored text.
    pub fn find_exact(&self, name: &str) -> CatalogResult<Vec<SystemRecord>> {
        let name = name.trim();
        let mut found = Vec::new();

        let classification = name_codec::classify(name);
        if classification.is_standard() && classification.entry_type == EntryType::NValue {
            found = self.select_systems(
                "WHERE c.name = ?1 COLLATE NOCASE AND s.name = ?2 ORDER BY s.edsmid",
                params![classification.sector, classification.id() as i64],
            )?;
        }

        let stored = name_codec::classify_canonical(name);
        if !stored.is_standard() {
            let by_text = self.select_systems(
                "WHERE c.name = ?1 COLLATE NOCASE AND n.name = ?2 ORDER BY s.edsmid",
                params![stored.sector, stored.star_name],
            )?;
            let seen: HashSet<i64> = found.iter().map(|s| s.edsm_id).collect();
            found.extend(by_text.into_iter().filter(|s| !seen.contains(&s.edsm_id)));
        }

        tracing::debug!("find_exact '{}': {} result(s)", name, found.len());
        Ok(found)
    }

    /// Systems whose name starts with `name`, at most `limit`
    pub fn find_wildcard(&self, name: &str, limit: usize) -> CatalogResult<Vec<SystemRecord>> {
        let name = name.trim();
        if name.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit as i64;

        let classification = name_codec::classify(name);
        if classification.is_standard() {
            return self.select_systems(
                "WHERE c.name = ?1 COLLATE NOCASE AND s.name BETWEEN ?2 AND ?3 ORDER BY s.name, s.edsmid LIMIT ?4",
                params![
                    classification.sector,
                    classification.id() as i64,
                    classification.id_high() as i64,
                    limit
                ],
            );
        }

        let mut found = self.select_systems(
            "WHERE c.name = ?1 COLLATE NOCASE AND n.name LIKE ?2 ESCAPE '\\' ORDER BY n.name, s.edsmid LIMIT ?3",
            params![
                classification.sector,
                format!("{}%", escape_like(&classification.star_name)),
                limit
            ],
        )?;

        if classification.sector == NON_STANDARD_SECTOR && (found.len() as i64) < limit {
            let seen: HashSet<i64> = found.iter().map(|s| s.edsm_id).collect();
            let by_sector = self.select_systems(
                "WHERE c.name LIKE ?1 ESCAPE '\\' ORDER BY c.name, s.name, s.edsmid LIMIT ?2",
                params![format!("{}%", escape_like(name)), limit],
            )?;
            found.extend(by_sector.into_iter().filter(|s| !seen.contains(&s.edsm_id)));
            found.truncate(limit as usize);
        }

        Ok(found)
    }

    /// Up to `max_items + 1` systems around a point, nearest first
    ///
    /// The extra slot is for a system sitting on the query point itself when
    /// `min_dist` is zero. Candidates come from the box of half-width
    /// `max_dist`; with `spherical` anything outside the sphere of radius
    /// `max_dist` is dropped too.
    pub fn k_nearest(
        &self,
        centre: &Position,
        max_items: usize,
        min_dist: f64,
        max_dist: f64,
        spherical: bool,
    ) -> CatalogResult<Vec<NearbySystem>> {
        if max_items == 0 || max_dist < 0.0 || !centre.is_finite() {
            return Ok(Vec::new());
        }

        let (cx, cy, cz) = centre.to_fixed();
        let bounds = FixedBox::around(centre, max_dist);
        let min_sq = (min_dist.max(0.0) * FIXED_POINT_SCALE).powi(2);
        let max_sq = if spherical {
            (max_dist * FIXED_POINT_SCALE).powi(2)
        } else {
            f64::MAX
        };

        let sql = "
            SELECT * FROM (
                SELECT s.edsmid, s.name, s.x, s.y, s.z, c.id, c.name, c.gridid, n.name,
                       (s.x - ?1) * (s.x - ?1) + (s.y - ?2) * (s.y - ?2) + (s.z - ?3) * (s.z - ?3) AS d2
                FROM Systems s
                JOIN Sectors c ON c.id = s.sector
                LEFT JOIN Names n ON n.id = s.name
                WHERE s.x BETWEEN ?4 AND ?5 AND s.z BETWEEN ?6 AND ?7 AND s.y BETWEEN ?8 AND ?9
            )
            WHERE d2 >= ?10 AND d2 <= ?11
            ORDER BY d2, edsmid
            LIMIT ?12";

        let systems = self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(
                params![
                    cx,
                    cy,
                    cz,
                    bounds.lo.0,
                    bounds.hi.0,
                    bounds.lo.2,
                    bounds.hi.2,
                    bounds.lo.1,
                    bounds.hi.1,
                    min_sq,
                    max_sq,
                    max_items as i64 + 1
                ],
                map_system,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(systems
            .into_iter()
            .map(|system| {
                let distance = system.distance_to(centre);
                NearbySystem { system, distance }
            })
            .collect())
    }

    /// Best next system on the way from `current` towards `wanted`
    pub fn nearest_on_path(
        &self,
        current: &Position,
        wanted: &Position,
        max_from_current: f64,
        max_from_wanted: f64,
        metric: PathMetric,
    ) -> CatalogResult<Option<PathStep>> {
        if !current.is_finite() || !wanted.is_finite() {
            return Ok(None);
        }
        let Some(bounds) = FixedBox::around(current, max_from_current)
            .intersect(&FixedBox::around(wanted, max_from_wanted))
        else {
            return Ok(None);
        };

        let candidates = self.select_systems(
            "WHERE s.x BETWEEN ?1 AND ?2 AND s.z BETWEEN ?3 AND ?4 AND s.y BETWEEN ?5 AND ?6",
            params![bounds.lo.0, bounds.hi.0, bounds.lo.2, bounds.hi.2, bounds.lo.1, bounds.hi.1],
        )?;

        let here = current.to_fixed();
        let mut best: Option<(f64, PathStep)> = None;
        for system in candidates {
            if (system.x, system.y, system.z) == here {
                continue;
            }
            let position = system.position();
            let step = PathStep {
                distance_from_current: position.distance(current),
                distance_to_wanted: position.distance(wanted),
                deviation: deviation_from_line(&position, current, wanted),
                system,
            };
            let Some(score) = metric.score(&step) else {
                continue;
            };

            let better = match &best {
                None => true,
                Some((best_score, best_step)) => {
                    score < *best_score
                        || (score == *best_score && step.system.edsm_id < best_step.system.edsm_id)
                }
            };
            if better {
                best = Some((score, step));
            }
        }

        if let Some((score, step)) = &best {
            tracing::debug!(
                "nearest_on_path {:?}: {} (score {:.3}, deviation {:.2} ly)",
                metric,
                step.system.name,
                score,
                step.deviation
            );
        }
        Ok(best.map(|(_, step)| step))
    }

    /// System at a position, within a few fixed-point units
    pub fn position_lookup(&self, position: &Position) -> CatalogResult<Option<SystemRecord>> {
        if !position.is_finite() {
            return Ok(None);
        }
        let (x, y, z) = position.to_fixed();
        let bounds = FixedBox::around(position, POSITION_LOOKUP_UNITS as f64 / FIXED_POINT_SCALE);
        let found = self.select_systems(
            "WHERE s.x BETWEEN ?1 AND ?2 AND s.z BETWEEN ?3 AND ?4 AND s.y BETWEEN ?5 AND ?6
             ORDER BY (s.x - ?7) * (s.x - ?7) + (s.y - ?8) * (s.y - ?8) + (s.z - ?9) * (s.z - ?9), s.edsmid
             LIMIT 1",
            params![
                bounds.lo.0,
                bounds.hi.0,
                bounds.lo.2,
                bounds.hi.2,
                bounds.lo.1,
                bounds.hi.1,
                x,
                y,
                z
            ],
        )?;
        Ok(found.into_iter().next())
    }

    /// Sampled star positions of one grid cell, coloured for display
    ///
    /// `percentage` (0..=100) of the systems are kept by a deterministic hash
    /// of their EDSM id. The system at the origin is always kept and
    /// highlighted.
    pub fn vector_extract(&self, grid_id: i32, percentage: u8) -> CatalogResult<Vec<StarVertex>> {
        let percentage = percentage.min(100) as i64;
        let rows: Vec<(i64, i32, i32, i32)> = self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT s.edsmid, s.x, s.y, s.z
                 FROM Systems s
                 JOIN Sectors c ON c.id = s.sector
                 WHERE c.gridid = ?1
                   AND (((s.edsmid * ?2) % 100) < ?3 OR (s.x = 0 AND s.y = 0 AND s.z = 0))
                 ORDER BY s.edsmid",
            )?;
            let rows = stmt.query_map(params![grid_id, SAMPLE_HASH, percentage], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect()
        })?;

        Ok(rows
            .into_iter()
            .map(|(edsm_id, x, y, z)| {
                let color = if x == 0 && y == 0 && z == 0 {
                    COLOR_ORIGIN
                } else {
                    COLOR_TIERS[(edsm_id & 3) as usize]
                };
                let position = Position::from_fixed(x, y, z);
                StarVertex {
                    position: [position.x as f32, position.y as f32, position.z as f32],
                    color,
                }
            })
            .collect())
    }

    pub fn find_by_edsm_id(&self, edsm_id: i64) -> CatalogResult<Option<SystemRecord>> {
        let found = self.select_systems("WHERE s.edsmid = ?1", params![edsm_id])?;
        Ok(found.into_iter().next())
    }

    /// EDDB enrichment for a system, if it is populated
    pub fn eddb_info(&self, edsm_id: i64) -> CatalogResult<Option<EddbInfo>> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT edsmid, eddbid, eddbupdatedat, population, faction, government, allegiance,
                        state, security, primaryeconomy, needspermit, power, powerstate
                 FROM EDDB WHERE edsmid = ?1",
                params![edsm_id],
                |row| {
                    Ok(EddbInfo {
                        edsm_id: row.get(0)?,
                        eddb_id: row.get(1)?,
                        updated_at: row.get(2)?,
                        population: row.get(3)?,
                        faction: row.get(4)?,
                        government: row.get(5)?,
                        allegiance: row.get(6)?,
                        state: row.get(7)?,
                        security: row.get(8)?,
                        primary_economy: row.get(9)?,
                        needs_permit: row.get(10)?,
                        power: row.get(11)?,
                        power_state: row.get(12)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Number of systems stored in a grid cell
    pub fn systems_in_grid(&self, grid_id: i32) -> CatalogResult<i64> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM Systems s JOIN Sectors c ON c.id = s.sector WHERE c.gridid = ?1",
                params![grid_id],
                |row| row.get(0),
            )
        })
    }
}
