//! Remote fallback for coordinates the cache could not supply.
//!
//! A batch gets at most [`MAX_RESOLVE_PASSES`] passes of single-node requests.
//! Whatever is still missing afterwards is fixed way by way: the way is fetched
//! again from the authority together with all of its nodes. A way that cannot
//! be completed is flagged and left for the caller to drop.

use std::collections::{HashMap, HashSet};
use std::thread;

use log::{debug, warn};

use crate::cache::CoordinateCache;
use crate::data::osm::{Coord, OsmId, Way};
use crate::errors::{Error, Result};
use crate::pending::PendingLookupIndex;
use crate::remote::RemoteAuthority;

pub const MAX_RESOLVE_PASSES: usize = 3;

/// A way together with the coordinates found so far, one slot per node reference.
#[derive(Debug, Clone, PartialEq)]
pub struct WayInProgress {
    pub way: Way,
    pub coords: Vec<Coord>,
    pub unresolved: bool,
}

impl WayInProgress {
    pub fn new(way: Way) -> Self {
        let coords = vec![Coord::UNRESOLVED; way.node_ids.len()];
        WayInProgress {
            way,
            coords,
            unresolved: false,
        }
    }

    /// Fills empty slots from `lookup`. Returns how many slots are still empty.
    pub fn fill<F>(&mut self, lookup: F) -> usize
    where
        F: Fn(OsmId) -> Option<Coord>,
    {
        let mut missing = 0;
        for (slot, &id) in self.coords.iter_mut().zip(&self.way.node_ids) {
            if slot.is_unresolved() {
                match lookup(id) {
                    Some(coord) => *slot = coord,
                    None => missing += 1,
                }
            }
        }
        missing
    }

    pub fn fill_from(&mut self, index: &PendingLookupIndex) -> usize {
        self.fill(|id| index.get(id))
    }

    pub fn is_complete(&self) -> bool {
        !self.coords.iter().any(Coord::is_unresolved)
    }

    pub fn missing_ids(&self) -> impl Iterator<Item = OsmId> + '_ {
        self.coords
            .iter()
            .zip(&self.way.node_ids)
            .filter(|(coord, _)| coord.is_unresolved())
            .map(|(_, &id)| id)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveReport {
    pub passes: usize,
    pub remote_requests: usize,
    pub remote_failures: usize,
    pub ways_refetched: usize,
    pub unresolved_ways: usize,
}

pub struct FallbackResolver<'a, A: RemoteAuthority + ?Sized> {
    cache: &'a CoordinateCache,
    authority: &'a A,
    workers: usize,
}

impl<'a, A: RemoteAuthority + ?Sized> FallbackResolver<'a, A> {
    pub fn new(cache: &'a CoordinateCache, authority: &'a A, workers: usize) -> Self {
        FallbackResolver {
            cache,
            authority,
            workers: workers.max(1),
        }
    }

    /// Completes as many ways of the batch as possible. Only cache I/O errors
    /// are returned; remote trouble ends up in the report.
    pub fn resolve(
        &self,
        ways: &mut [WayInProgress],
        index: &mut PendingLookupIndex,
    ) -> Result<ResolveReport> {
        let mut report = ResolveReport::default();

        for pass in 1..=MAX_RESOLVE_PASSES {
            report.passes = pass;
            let missing = collect_missing(ways, index);
            if missing.is_empty() {
                break;
            }
            debug!(pass = pass, missing = missing.len(); "Requesting missing nodes");

            let mut all_resolved = true;
            let mut fetched: HashMap<OsmId, Coord> = HashMap::new();
            for (id, outcome) in self.fetch_nodes(&missing) {
                report.remote_requests += 1;
                let coord = match outcome {
                    Ok(coord) => coord,
                    Err(err) => {
                        let msg = err.to_string();
                        debug!(id = id, pass = pass, err = msg.as_str(); "Node request failed");
                        report.remote_failures += 1;
                        all_resolved = false;
                        continue;
                    }
                };
                if self.write_back(id, coord)? {
                    index.mark_resolved(id, coord);
                    fetched.insert(id, coord);
                } else {
                    all_resolved = false;
                }
            }
            for way in ways.iter_mut() {
                way.fill(|id| fetched.get(&id).copied());
            }

            if all_resolved {
                break;
            }
        }

        self.verify(ways, index, &mut report)?;
        Ok(report)
    }

    /// Appends a fetched coordinate to the cache. A value the cache refuses is
    /// logged and reported as `false`.
    fn write_back(&self, id: OsmId, coord: Coord) -> Result<bool> {
        match self.cache.put(id, coord) {
            Ok(()) => Ok(true),
            Err(Error::InvalidValue { .. }) => {
                warn!(id = id; "Remote authority returned an unusable coordinate");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// One request per id. With more than one worker the ids are split over
    /// scoped threads; an id never appears in two chunks.
    fn fetch_nodes(&self, ids: &[OsmId]) -> Vec<(OsmId, Result<Coord>)> {
        let fetch = |id: OsmId| (id, self.authority.fetch_node(id).map(|node| node.coord()));
        if self.workers == 1 || ids.len() == 1 {
            return ids.iter().map(|&id| fetch(id)).collect();
        }

        let chunk_size = ids.len().div_ceil(self.workers);
        thread::scope(|scope| {
            let handles: Vec<_> = ids
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move || chunk.iter().map(|&id| fetch(id)).collect::<Vec<_>>()))
                .collect();

            let mut results = Vec::with_capacity(ids.len());
            for (chunk, handle) in ids.chunks(chunk_size).zip(handles) {
                match handle.join() {
                    Ok(fetched) => results.extend(fetched),
                    Err(_) => results.extend(chunk.iter().map(|&id| {
                        (id, Err(Error::Remote(format!("request worker for node {id} panicked"))))
                    })),
                }
            }
            results
        })
    }

    /// Final check: every way still missing a coordinate is fetched again as a
    /// whole, its nodes straight from the authority.
    fn verify(
        &self,
        ways: &mut [WayInProgress],
        index: &mut PendingLookupIndex,
        report: &mut ResolveReport,
    ) -> Result<()> {
        let mut attempted: HashSet<OsmId> = HashSet::new();
        let mut refetched: HashMap<OsmId, (Way, Vec<Coord>)> = HashMap::new();

        for progress in ways.iter_mut() {
            if progress.is_complete() {
                continue;
            }
            let id = progress.way.id;

            if !refetched.contains_key(&id) {
                if !attempted.insert(id) {
                    // Already failed once in this batch.
                    progress.unresolved = true;
                    report.unresolved_ways += 1;
                    continue;
                }
                report.ways_refetched += 1;
                match self.refetch_way(id, index, report) {
                    Ok(done) => {
                        refetched.insert(id, done);
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        let msg = err.to_string();
                        warn!(id = id, err = msg.as_str(); "Way could not be resolved, dropping it");
                        progress.unresolved = true;
                        report.unresolved_ways += 1;
                        continue;
                    }
                }
            }

            if let Some((fresh, coords)) = refetched.get(&id) {
                progress.way.tags = fresh.tags.clone();
                progress.way.node_ids = fresh.node_ids.clone();
                progress.coords = coords.clone();
                progress.unresolved = false;
            }
        }
        Ok(())
    }

    fn refetch_way(
        &self,
        id: OsmId,
        index: &mut PendingLookupIndex,
        report: &mut ResolveReport,
    ) -> Result<(Way, Vec<Coord>)> {
        report.remote_requests += 1;
        let way = self.authority.fetch_way(id)?;

        let mut fetched: HashMap<OsmId, Coord> = HashMap::new();
        let mut coords = Vec::with_capacity(way.node_ids.len());
        for &node_id in &way.node_ids {
            let coord = match fetched.get(&node_id) {
                Some(coord) => *coord,
                None => {
                    report.remote_requests += 1;
                    let coord = self.authority.fetch_node(node_id)?.coord();
                    fetched.insert(node_id, coord);
                    coord
                }
            };
            coords.push(coord);
        }

        for (&node_id, &coord) in &fetched {
            if index.get(node_id).is_some() {
                continue;
            }
            if self.cache.lookup(node_id)?.is_some() || self.write_back(node_id, coord)? {
                index.mark_resolved(node_id, coord);
            }
        }
        Ok((way, coords))
    }
}

/// Distinct ids still missing across the batch, in first-seen order.
fn collect_missing(ways: &mut [WayInProgress], index: &PendingLookupIndex) -> Vec<OsmId> {
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for way in ways.iter_mut() {
        if way.fill_from(index) == 0 {
            continue;
        }
        for id in way.missing_ids() {
            if seen.insert(id) {
                missing.push(id);
            }
        }
    }
    missing
}
