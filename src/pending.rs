//! Per-batch index of the node ids the current batch still needs.

use std::collections::BTreeMap;

use crate::cache::CoordinateCache;
use crate::data::osm::{Coord, OsmId};
use crate::errors::Result;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: OsmId,
    coord: Coord,
}

/// Keyed by the decimal id string, so ids sharing a prefix sit together.
/// Rebuilt from scratch for each batch and never persisted.
#[derive(Debug, Default)]
pub struct PendingLookupIndex {
    entries: BTreeMap<String, Entry>,
}

impl PendingLookupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole index with `ids`, all unresolved. Repeated ids collapse.
    pub fn seed<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = OsmId>,
    {
        self.entries.clear();
        for id in ids {
            self.entries.insert(
                id.to_string(),
                Entry {
                    id,
                    coord: Coord::UNRESOLVED,
                },
            );
        }
    }

    /// Records a coordinate for a seeded id. Returns false if the id was never seeded.
    pub fn mark_resolved(&mut self, id: OsmId, coord: Coord) -> bool {
        match self.entries.get_mut(&id.to_string()) {
            Some(entry) => {
                entry.coord = coord;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: OsmId) -> Option<Coord> {
        self.entries
            .get(&id.to_string())
            .map(|entry| entry.coord)
            .filter(|coord| !coord.is_unresolved())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !entry.coord.is_unresolved())
            .count()
    }

    pub fn unresolved_ids(&self) -> Vec<OsmId> {
        self.entries
            .values()
            .filter(|entry| entry.coord.is_unresolved())
            .map(|entry| entry.id)
            .collect()
    }

    /// Cache warm pass: copies every coordinate the disk cache already knows.
    /// Returns the number of ids resolved.
    pub fn warm(&mut self, cache: &CoordinateCache) -> Result<usize> {
        let wanted = self.unresolved_ids();
        if wanted.is_empty() {
            return Ok(0);
        }
        let found = cache.get_many(&wanted)?;
        let mut hits = 0;
        for (id, coord) in found {
            if self.mark_resolved(id, coord) {
                hits += 1;
            }
        }
        Ok(hits)
    }
}
