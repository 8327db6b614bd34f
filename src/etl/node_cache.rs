//! Cache population and verification straight from a dump.
//!
//! Dumps list nodes first, so both stop at the first way.

use log::{info, warn};
use serde::Serialize;

use crate::cache::{CoordinateCache, StoreOutcome};
use crate::data::osm::{Coord, Node, OsmId};
use crate::data::Element;
use crate::errors::{Error, Result};
use crate::etl::Etl;

const VERIFY_CHUNK: usize = 1024;

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeCacheReport {
    pub nodes_seen: usize,
    pub cached: usize,
    pub already_cached: usize,
    pub invalid: usize,
    /// First way of the dump, where population stopped.
    pub stopped_at: Option<OsmId>,
}

impl NodeCacheReport {
    pub fn record(&mut self, outcome: StoreOutcome) {
        self.nodes_seen += 1;
        match outcome {
            StoreOutcome::Stored => self.cached += 1,
            StoreOutcome::AlreadyCached => self.already_cached += 1,
            StoreOutcome::Invalid => self.invalid += 1,
        }
    }
}

pub struct NodeCacheEtl<'a, I> {
    elements: Option<I>,
    cache: &'a CoordinateCache,
    report: NodeCacheReport,
}

impl<'a, I> NodeCacheEtl<'a, I>
where
    I: Iterator<Item = Result<Element>>,
{
    pub fn new(elements: I, cache: &'a CoordinateCache) -> Self {
        NodeCacheEtl {
            elements: Some(elements),
            cache,
            report: NodeCacheReport::default(),
        }
    }

    pub fn report(&self) -> NodeCacheReport {
        self.report
    }
}

impl<I> Etl for NodeCacheEtl<'_, I>
where
    I: Iterator<Item = Result<Element>>,
{
    type Input = I;
    type Output = NodeCacheReport;

    fn etl_name(&self) -> &str {
        "node_cache"
    }

    fn extract(&mut self) -> Result<Self::Input> {
        self.elements
            .take()
            .ok_or_else(|| Error::Config("node cache stage already consumed its input".into()))
    }

    fn transform(&mut self, input: Self::Input) -> Result<Self::Output> {
        let mut report = NodeCacheReport::default();
        for element in input {
            match element? {
                Element::Node(node) => report.record(self.cache.store_node(&node)?),
                other => {
                    report.stopped_at = Some(other.id());
                    break;
                }
            }
        }
        Ok(report)
    }

    fn load(&mut self, output: Self::Output) -> Result<()> {
        info!(
            etl_name = self.etl_name(),
            nodes_seen = output.nodes_seen,
            cached = output.cached,
            already_cached = output.already_cached,
            invalid = output.invalid;
            "Node cache populated"
        );
        self.report = output;
        Ok(())
    }
}

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub missing: usize,
    /// Cached under a different coordinate; the first write won.
    pub mismatched: usize,
    /// Nodes the cache would refuse, not checked.
    pub invalid: usize,
}

/// Checks that every node of the dump resolves in the cache.
pub fn verify_cache<I>(elements: I, cache: &CoordinateCache) -> Result<VerifyReport>
where
    I: IntoIterator<Item = Result<Element>>,
{
    let mut report = VerifyReport::default();
    let mut chunk: Vec<Node> = Vec::with_capacity(VERIFY_CHUNK);

    for element in elements {
        match element? {
            Element::Node(node) if node.coord().is_unresolved() || node.id == 0 => report.invalid += 1,
            Element::Node(node) => {
                chunk.push(node);
                if chunk.len() == VERIFY_CHUNK {
                    verify_chunk(&mut chunk, cache, &mut report)?;
                }
            }
            _ => break,
        }
    }
    verify_chunk(&mut chunk, cache, &mut report)?;

    if report.missing > 0 {
        warn!(checked = report.checked, missing = report.missing; "Cache is missing nodes");
    }
    Ok(report)
}

fn verify_chunk(chunk: &mut Vec<Node>, cache: &CoordinateCache, report: &mut VerifyReport) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    let ids: Vec<OsmId> = chunk.iter().map(|node| node.id).collect();
    let found = cache.get_many(&ids)?;
    for node in chunk.drain(..) {
        report.checked += 1;
        match found.get(&node.id) {
            None => report.missing += 1,
            Some(coord) if *coord != Coord::new(node.lon, node.lat) => report.mismatched += 1,
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::osm::Way;
    use tempfile::TempDir;

    fn dump() -> Vec<Result<Element>> {
        vec![
            Ok(Element::Node(Node::new(1, 10.0, 20.0))),
            Ok(Element::Node(Node::new(2, 10.0, 20.1))),
            Ok(Element::Node(Node::new(3, 0.0, 0.0))),
            Ok(Element::Way(Way::new(99, vec![1, 2]))),
            Ok(Element::Node(Node::new(4, 1.0, 1.0))),
        ]
    }

    #[test]
    fn populates_until_first_way() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();

        let mut etl = NodeCacheEtl::new(dump().into_iter(), &cache);
        etl.process().unwrap();
        let report = etl.report();

        assert_eq!(report.nodes_seen, 3);
        assert_eq!(report.cached, 2);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.stopped_at, Some(99));
        assert_eq!(cache.get(2).unwrap(), Coord::new(10.0, 20.1));
        assert!(cache.lookup(4).unwrap().is_none());

        assert!(etl.process().is_err());
    }

    #[test]
    fn second_population_finds_everything_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        NodeCacheEtl::new(dump().into_iter(), &cache).process().unwrap();

        let mut again = NodeCacheEtl::new(dump().into_iter(), &cache);
        again.process().unwrap();
        assert_eq!(again.report().cached, 0);
        assert_eq!(again.report().already_cached, 2);
    }

    #[test]
    fn decode_error_stops_population() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        let elements = vec![
            Ok(Element::Node(Node::new(1, 10.0, 20.0))),
            Err(Error::Decode("broken".into())),
        ];
        let err = NodeCacheEtl::new(elements.into_iter(), &cache).process().unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(cache.get(1).unwrap(), Coord::new(10.0, 20.0));
    }

    #[test]
    fn verify_reports_missing_and_mismatched_nodes() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        cache.put(1, Coord::new(10.0, 20.0)).unwrap();
        cache.put(2, Coord::new(5.0, 5.0)).unwrap();

        let report = verify_cache(dump(), &cache).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.missing, 0);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.invalid, 1);

        let empty = CoordinateCache::open(tmp.path().join("empty"), 10).unwrap();
        let report = verify_cache(dump(), &empty).unwrap();
        assert_eq!(report.missing, 2);
    }
}
