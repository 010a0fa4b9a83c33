///! Process-lifetime memo of resolved systems
///!
///! Indexed by EDSM id and by lower-cased name. Names are not unique, so the
///! name index keeps every system seen under a name and a query position
///! picks among them.

use super::query::QueryEngine;
use crate::error::{CatalogError, CatalogResult};
use serde::{Deserialize, Serialize};
use starcat_common::{Position, SystemRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Two positions closer than this (ly) are the same system
    #[serde(default = "default_tie_distance_ly")]
    pub tie_distance_ly: f64,
}

fn default_tie_distance_ly() -> f64 {
    0.5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tie_distance_ly: default_tie_distance_ly(),
        }
    }
}

/// What the caller knows about a system
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemLookup {
    pub edsm_id: Option<i64>,
    pub name: Option<String>,
    pub position: Option<Position>,
}

impl SystemLookup {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_edsm_id(edsm_id: i64) -> Self {
        Self {
            edsm_id: Some(edsm_id),
            ..Default::default()
        }
    }

    pub fn by_position(position: Position) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    fn name_key(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_lowercase)
    }
}

#[derive(Default)]
struct CacheMaps {
    by_edsm_id: HashMap<i64, Arc<SystemRecord>>,
    by_name: HashMap<String, Vec<Arc<SystemRecord>>>,
}

impl CacheMaps {
    fn insert(&mut self, system: Arc<SystemRecord>) {
        if let Some(old) = self.by_edsm_id.remove(&system.edsm_id) {
            let old_key = old.name.to_lowercase();
            if let Some(bucket) = self.by_name.get_mut(&old_key) {
                bucket.retain(|s| s.edsm_id != system.edsm_id);
                if bucket.is_empty() {
                    self.by_name.remove(&old_key);
                }
            }
            if old.name != system.name {
                tracing::debug!("System {} renamed: '{}' -> '{}'", system.edsm_id, old.name, system.name);
            }
        }

        self.by_name
            .entry(system.name.to_lowercase())
            .or_default()
            .push(Arc::clone(&system));
        self.by_edsm_id.insert(system.edsm_id, system);
    }
}

/// Nearest of `candidates` within `radius` of `position`
fn nearest_within<'a, I>(candidates: I, position: &Position, radius: f64) -> Option<&'a SystemRecord>
where
    I: IntoIterator<Item = &'a SystemRecord>,
{
    candidates
        .into_iter()
        .map(|s| (s.distance_to(position), s))
        .filter(|(d, _)| *d <= radius)
        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.edsm_id.cmp(&b.1.edsm_id)))
        .map(|(_, s)| s)
}

/// Memo table in front of the query engine
pub struct SystemCache {
    engine: Arc<QueryEngine>,
    tie_distance_ly: f64,
    maps: Mutex<CacheMaps>,
}

impl SystemCache {
    pub fn new(engine: Arc<QueryEngine>, config: &CacheConfig) -> Self {
        Self {
            engine,
            tie_distance_ly: config.tie_distance_ly,
            maps: Mutex::new(CacheMaps::default()),
        }
    }

    /// Resolve a system, consulting the store on a miss
    ///
    /// The whole lookup runs under the cache lock, so concurrent callers
    /// never see a half-updated index.
    pub fn resolve(&self, query: &SystemLookup) -> CatalogResult<Option<Arc<SystemRecord>>> {
        let mut maps = self.maps.lock().map_err(|_| CatalogError::LockPoisoned)?;
        let name_key = query.name_key();

        let id_hit = query.edsm_id.and_then(|id| maps.by_edsm_id.get(&id).cloned());
        let name_hits: Vec<Arc<SystemRecord>> = name_key
            .as_ref()
            .and_then(|key| maps.by_name.get(key).cloned())
            .unwrap_or_default();

        match &query.position {
            Some(position) => {
                let candidates = id_hit.iter().chain(name_hits.iter()).map(|s| &**s);
                if let Some(hit) = nearest_within(candidates, position, self.tie_distance_ly) {
                    if let Some(cached) = maps.by_edsm_id.get(&hit.edsm_id) {
                        return Ok(Some(Arc::clone(cached)));
                    }
                }
            }
            None => {
                if let Some(hit) = id_hit {
                    return Ok(Some(hit));
                }
                if let [single] = name_hits.as_slice() {
                    return Ok(Some(Arc::clone(single)));
                }
            }
        }

        let Some(mut system) = self.fetch(query)? else {
            tracing::debug!("Unresolved system {:?}", query);
            return Ok(None);
        };
        if let Some(position) = &query.position {
            system.set_position(position);
        }

        let system = Arc::new(system);
        maps.insert(Arc::clone(&system));
        Ok(Some(system))
    }

    /// Store lookup: by id, then by name, then by position
    fn fetch(&self, query: &SystemLookup) -> CatalogResult<Option<SystemRecord>> {
        if let Some(id) = query.edsm_id {
            if let Some(system) = self.engine.find_by_edsm_id(id)? {
                return Ok(Some(system));
            }
        }

        let mut named = match query.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => self.engine.find_exact(name)?,
            _ => Vec::new(),
        };

        let Some(position) = &query.position else {
            return Ok(if named.is_empty() { None } else { Some(named.swap_remove(0)) });
        };

        if let Some(system) = nearest_within(named.iter(), position, self.tie_distance_ly) {
            return Ok(Some(system.clone()));
        }
        if let Some(system) = self.engine.position_lookup(position)? {
            return Ok(Some(system));
        }
        // a lone name match whose coordinates have since moved
        Ok(if named.len() == 1 { named.pop() } else { None })
    }

    /// Systems cached under a name
    pub fn cached_by_name(&self, name: &str) -> CatalogResult<Vec<Arc<SystemRecord>>> {
        let maps = self.maps.lock().map_err(|_| CatalogError::LockPoisoned)?;
        Ok(maps
            .by_name
            .get(&name.trim().to_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.maps.lock().map(|m| m.by_edsm_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> CatalogResult<()> {
        let mut maps = self.maps.lock().map_err(|_| CatalogError::LockPoisoned)?;
        *maps = CacheMaps::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::catalog::ingest::{IngestOptions, ingest_str};
    use crate::module::catalog::testutil::{edsm_line, local_bubble, seeded_store};
    use crate::module::catalog::store::Store;

    fn cache_over(store: Arc<Store>) -> SystemCache {
        SystemCache::new(Arc::new(QueryEngine::new(store)), &CacheConfig::default())
    }

    #[test]
    fn test_resolve_by_name_then_hit() {
        let cache = cache_over(local_bubble());

        let sol = cache.resolve(&SystemLookup::by_name("Sol")).unwrap().unwrap();
        assert_eq!(sol.edsm_id, 27);
        assert_eq!(cache.len(), 1);

        let again = cache.resolve(&SystemLookup::by_name("SOL")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&sol, &again));

        let by_id = cache.resolve(&SystemLookup::by_edsm_id(27)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&sol, &by_id));
    }

    #[test]
    fn test_resolve_by_position() {
        let cache = cache_over(local_bubble());
        let found = cache
            .resolve(&SystemLookup::by_position(Position::new(3.03, -0.09, 3.16)))
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "Alpha Centauri");
        // query coordinates win
        assert_eq!(found.x, starcat_common::to_fixed(3.03));

        assert!(cache.resolve(&SystemLookup::by_name("Nowhere")).unwrap().is_none());
        assert!(cache.resolve(&SystemLookup::default()).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_names_split_by_position() {
        let cache = cache_over(seeded_store(&[
            (3, "Twin", 1.0, 0.0, 0.0),
            (4, "Twin", 2.0, 0.0, 0.0),
        ]));

        let far = cache
            .resolve(&SystemLookup::by_name("Twin").with_position(Position::new(2.1, 0.0, 0.0)))
            .unwrap()
            .unwrap();
        assert_eq!(far.edsm_id, 4);

        let near = cache
            .resolve(&SystemLookup::by_name("twin").with_position(Position::new(1.0, 0.0, 0.0)))
            .unwrap()
            .unwrap();
        assert_eq!(near.edsm_id, 3);
        assert_eq!(cache.cached_by_name("Twin").unwrap().len(), 2);

        // cached now: resolved without touching the store
        let hit = cache
            .resolve(&SystemLookup::by_name("Twin").with_position(Position::new(2.0, 0.2, 0.0)))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&hit, &far));
    }

    #[test]
    fn test_rename_drops_stale_entry() {
        let store = local_bubble();
        let cache = cache_over(Arc::clone(&store));
        cache.resolve(&SystemLookup::by_name("Alpha Centauri")).unwrap().unwrap();

        let renamed = edsm_line(44, "Rigil Kentaurus", 3.03125, -0.09375, 3.15625, "2021-01-01 00:00:00");
        ingest_str(&store, &renamed, &IngestOptions::default()).unwrap();

        let found = cache
            .resolve(&SystemLookup::by_name("Rigil Kentaurus"))
            .unwrap()
            .unwrap();
        assert_eq!(found.edsm_id, 44);
        assert!(cache.cached_by_name("Alpha Centauri").unwrap().is_empty());
        assert_eq!(cache.cached_by_name("rigil kentaurus").unwrap().len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_moved_system_keeps_identity() {
        let cache = cache_over(local_bubble());
        let moved = Position::new(100.0, 0.0, 0.0);
        let found = cache
            .resolve(&SystemLookup::by_name("Sirius").with_position(moved))
            .unwrap()
            .unwrap();
        assert_eq!(found.edsm_id, 512);
        assert_eq!(found.position(), moved);
        assert_eq!(cache.len(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }
}
