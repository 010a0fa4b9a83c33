///! Per-run sector registry
///!
///! Sectors live in an arena addressed by stable index. A name may recur in
///! several grid cells, so names map to a list of indices rather than one.
///! Names are keyed exactly as spelled; "HIP" and "hip" are distinct sectors.
///! Each sector also carries the queue of systems waiting for the next batch
///! write. The cache belongs to one ingest session and is dropped with it.

use super::name_codec::{Classification, NAME_REF_MASK};
use crate::error::CatalogResult;
use std::collections::HashMap;

/// What a queued system needs at write time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    /// Rewrite the existing row; keep the Names row when the name is unchanged
    Update { row_id: i64, keep_name_ref: Option<u32> },
    Unchanged,
}

/// A classified system waiting for the next batch write
#[derive(Debug, Clone)]
pub struct QueuedSystem {
    pub edsm_id: i64,
    pub name: String,
    pub classification: Classification,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub grid_id: i32,
    pub action: RowAction,
}

/// A sector known to the current run
#[derive(Debug, Clone)]
pub struct Sector {
    pub id: i64,
    pub name: String,
    pub grid_id: i32,
    /// Assigned locally, not yet written to the store
    pub needs_insert: bool,
    pub queued: Vec<QueuedSystem>,
}

/// Arena of sectors with name and id indexes
#[derive(Debug, Default)]
pub struct SectorCache {
    sectors: Vec<Sector>,
    by_name: HashMap<String, Vec<usize>>,
    by_id: HashMap<i64, usize>,
    next_id: i64,
}

impl SectorCache {
    /// Create an empty cache handing out ids from `next_id`
    pub fn new(next_id: i64) -> Self {
        Self {
            next_id,
            ..Default::default()
        }
    }

    /// Find or create the sector for (name, grid cell)
    ///
    /// `lookup` is consulted once per new pair for an id already in the store;
    /// when it has none the next sequential id is assigned and the sector is
    /// marked for insertion.
    pub fn resolve<F>(&mut self, name: &str, grid_id: i32, lookup: F) -> CatalogResult<usize>
    where
        F: FnOnce(&str, i32) -> CatalogResult<Option<i64>>,
    {
        if let Some(indices) = self.by_name.get(name) {
            if let Some(&index) = indices
                .iter()
                .find(|&&i| self.sectors[i].grid_id == grid_id)
            {
                return Ok(index);
            }
        }

        let (id, needs_insert) = match lookup(name, grid_id)? {
            Some(id) => (id, false),
            None => {
                let id = self.next_id;
                self.next_id += 1;
                (id, true)
            }
        };

        let index = self.sectors.len();
        self.sectors.push(Sector {
            id,
            name: name.to_string(),
            grid_id,
            needs_insert,
            queued: Vec::new(),
        });
        self.by_name.entry(name.to_string()).or_default().push(index);
        self.by_id.insert(id, index);

        tracing::debug!(
            "Sector {} '{}' in grid {} ({})",
            id,
            name,
            grid_id,
            if needs_insert { "new" } else { "existing" }
        );
        Ok(index)
    }

    pub fn get(&self, index: usize) -> &Sector {
        &self.sectors[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Sector {
        &mut self.sectors[index]
    }

    pub fn by_id(&self, id: i64) -> Option<&Sector> {
        self.by_id.get(&id).map(|&i| &self.sectors[i])
    }

    /// All sectors sharing a name, one per grid cell
    pub fn by_name(&self, name: &str) -> Vec<&Sector> {
        self.by_name
            .get(name)
            .map(|indices| indices.iter().map(|&i| &self.sectors[i]).collect())
            .unwrap_or_default()
    }

    pub fn queue(&mut self, index: usize, system: QueuedSystem) {
        self.sectors[index].queued.push(system);
    }

    pub fn queued_len(&self) -> usize {
        self.sectors.iter().map(|s| s.queued.len()).sum()
    }

    /// Sectors with systems waiting
    pub fn pending_mut(&mut self) -> impl Iterator<Item = &mut Sector> {
        self.sectors.iter_mut().filter(|s| !s.queued.is_empty())
    }

    /// Sectors assigned an id locally that still need a row
    pub fn unwritten_mut(&mut self) -> impl Iterator<Item = &mut Sector> {
        self.sectors.iter_mut().filter(|s| s.needs_insert)
    }

    pub fn clear_queues(&mut self) {
        for sector in &mut self.sectors {
            sector.queued.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }
}

/// Allocator for Names row ids, bounded by the width of a name reference
#[derive(Debug)]
pub struct NameIdAllocator {
    next: i64,
}

impl NameIdAllocator {
    pub fn new(next: i64) -> Self {
        Self { next }
    }

    pub fn allocate(&mut self) -> Option<u32> {
        if self.next < 1 || self.next > NAME_REF_MASK as i64 {
            return None;
        }
        let id = self.next as u32;
        self.next += 1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::catalog::name_codec::classify;

    fn queued(edsm_id: i64, name: &str) -> QueuedSystem {
        QueuedSystem {
            edsm_id,
            name: name.to_string(),
            classification: classify(name),
            x: 0,
            y: 0,
            z: 0,
            grid_id: 1210,
            action: RowAction::Insert,
        }
    }

    #[test]
    fn test_same_name_different_cells() {
        let mut cache = SectorCache::new(1);
        let a = cache.resolve("Wregoe", 1210, |_, _| Ok(None)).unwrap();
        let b = cache.resolve("Wregoe", 1211, |_, _| Ok(None)).unwrap();
        let again = cache.resolve("Wregoe", 1210, |_, _| panic!("cached")).unwrap();

        assert_ne!(a, b);
        assert_eq!(a, again);
        assert_eq!(cache.get(a).id, 1);
        assert_eq!(cache.get(b).id, 2);
        assert_eq!(cache.by_name("Wregoe").len(), 2);
        assert!(cache.by_name("wregoe").is_empty());
        assert_eq!(cache.by_id(2).unwrap().grid_id, 1211);
    }

    #[test]
    fn test_names_differing_in_case_are_distinct() {
        let mut cache = SectorCache::new(1);
        let upper = cache.resolve("HIP", 1210, |_, _| Ok(None)).unwrap();
        let lower = cache.resolve("hip", 1210, |name, _| {
            assert_eq!(name, "hip");
            Ok(None)
        })
        .unwrap();
        assert_ne!(upper, lower);
        assert_eq!(cache.get(lower).name, "hip");
        assert_eq!(cache.unwritten_mut().count(), 2);
    }

    #[test]
    fn test_existing_sector_is_reused() {
        let mut cache = SectorCache::new(50);
        let index = cache.resolve("Wregoe", 1210, |_, _| Ok(Some(17))).unwrap();
        assert_eq!(cache.get(index).id, 17);
        assert!(!cache.get(index).needs_insert);

        let fresh = cache.resolve("Pru Aescs", 1210, |_, _| Ok(None)).unwrap();
        assert_eq!(cache.get(fresh).id, 50);
        assert!(cache.get(fresh).needs_insert);
        assert_eq!(cache.unwritten_mut().count(), 1);
    }

    #[test]
    fn test_queues() {
        let mut cache = SectorCache::new(1);
        let index = cache.resolve("Sol", 1210, |_, _| Ok(None)).unwrap();
        cache.queue(index, queued(27, "Sol"));
        cache.queue(index, queued(28, "Sol B"));
        assert_eq!(cache.queued_len(), 2);
        assert_eq!(cache.pending_mut().count(), 1);
        cache.clear_queues();
        assert_eq!(cache.queued_len(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_name_id_allocator_bounds() {
        let mut ids = NameIdAllocator::new(NAME_REF_MASK as i64);
        assert_eq!(ids.allocate(), Some(NAME_REF_MASK));
        assert_eq!(ids.allocate(), None);
    }
}
