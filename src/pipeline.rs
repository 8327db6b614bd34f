//! Routes the element stream: nodes into the cache, ways into batches.

use log::{error, info, warn};
use serde::Serialize;

use crate::assembler::{GeometryAssembler, TagCleaner};
use crate::batch::BatchAccumulator;
use crate::cache::{CoordinateCache, StoreOutcome};
use crate::config::ImportConfig;
use crate::data::geometry::RecordKind;
use crate::data::osm::{Node, OsmId, Way};
use crate::data::Element;
use crate::errors::Result;
use crate::etl::way_batch::{BatchReport, WayBatchEtl};
use crate::etl::Etl;
use crate::pending::PendingLookupIndex;
use crate::remote::RemoteAuthority;
use crate::resolver::FallbackResolver;
use crate::sink::Sink;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StreamingPoints,
    StreamingWays,
    Draining,
    Done,
}

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub nodes_seen: usize,
    pub nodes_cached: usize,
    pub nodes_already_cached: usize,
    pub nodes_invalid: usize,
    pub ways_seen: usize,
    pub ways_skipped: usize,
    /// Records the sink already held when their batch was loaded.
    pub records_skipped: usize,
    pub relations: usize,
    pub batches: usize,
    pub remote_requests: usize,
    pub remote_failures: usize,
    pub ways_refetched: usize,
    pub unresolved_ways: usize,
    pub points_inserted: usize,
    pub polylines_inserted: usize,
    pub polygons_inserted: usize,
    pub sink_failures: usize,
}

impl ImportStats {
    fn record_node(&mut self, outcome: StoreOutcome) {
        self.nodes_seen += 1;
        match outcome {
            StoreOutcome::Stored => self.nodes_cached += 1,
            StoreOutcome::AlreadyCached => self.nodes_already_cached += 1,
            StoreOutcome::Invalid => self.nodes_invalid += 1,
        }
    }

    fn record_batch(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.remote_requests += report.resolve.remote_requests;
        self.remote_failures += report.resolve.remote_failures;
        self.ways_refetched += report.resolve.ways_refetched;
        self.unresolved_ways += report.unresolved_ways;
        self.polylines_inserted += report.polylines_inserted;
        self.polygons_inserted += report.polygons_inserted;
        self.records_skipped += report.skipped_existing;
        self.sink_failures += report.sink_failures;
    }
}

/// Everything the driver mutates while streaming.
#[derive(Debug)]
pub struct PipelineState {
    pub accumulator: BatchAccumulator,
    pub index: PendingLookupIndex,
    pub stats: ImportStats,
    pub phase: Phase,
}

impl PipelineState {
    pub fn new(batch_size: usize) -> Self {
        PipelineState {
            accumulator: BatchAccumulator::new(batch_size),
            index: PendingLookupIndex::new(),
            stats: ImportStats::default(),
            phase: Phase::StreamingPoints,
        }
    }
}

pub struct ImportPipeline<'a, A: RemoteAuthority + ?Sized, S: Sink + ?Sized> {
    cache: &'a CoordinateCache,
    authority: &'a A,
    sink: &'a mut S,
    assembler: GeometryAssembler,
    workers: usize,
    skip_existing: bool,
    import_points: bool,
    state: PipelineState,
}

impl<'a, A: RemoteAuthority + ?Sized, S: Sink + ?Sized> ImportPipeline<'a, A, S> {
    pub fn new(config: &ImportConfig, cache: &'a CoordinateCache, authority: &'a A, sink: &'a mut S) -> Self {
        ImportPipeline {
            cache,
            authority,
            sink,
            assembler: GeometryAssembler::new(TagCleaner::new(config.deny_rules.clone())),
            workers: config.remote.workers,
            skip_existing: config.skip_existing,
            import_points: config.import_points,
            state: PipelineState::new(config.batch_size),
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn stats(&self) -> ImportStats {
        self.state.stats
    }

    /// Consumes the whole stream. Stops at the first decode or cache I/O error.
    pub fn run<I>(&mut self, elements: I) -> Result<ImportStats>
    where
        I: IntoIterator<Item = Result<Element>>,
    {
        for element in elements {
            let element = match element {
                Ok(element) => element,
                Err(err) => {
                    let msg = err.to_string();
                    error!(err = msg.as_str(); "Could not decode element stream");
                    return Err(err);
                }
            };
            self.handle_element(element)?;
        }
        self.finish()?;
        Ok(self.state.stats)
    }

    pub fn handle_element(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Node(node) => self.handle_node(node),
            Element::Way(way) => self.handle_way(way),
            Element::Relation(_) => {
                self.state.stats.relations += 1;
                if !self.state.accumulator.is_empty() {
                    self.flush_batch()?;
                }
                self.state.phase = Phase::Draining;
                Ok(())
            }
        }
    }

    /// Flushes what is left and closes the sink.
    pub fn finish(&mut self) -> Result<()> {
        if !self.state.accumulator.is_empty() {
            self.flush_batch()?;
        }
        if let Err(err) = self.sink.flush() {
            let msg = err.to_string();
            warn!(err = msg.as_str(); "Sink flush failed");
            self.state.stats.sink_failures += 1;
        }
        self.state.phase = Phase::Done;

        let stats = &self.state.stats;
        info!(
            nodes_seen = stats.nodes_seen,
            nodes_cached = stats.nodes_cached,
            ways_seen = stats.ways_seen,
            ways_skipped = stats.ways_skipped,
            records_skipped = stats.records_skipped,
            batches = stats.batches,
            remote_requests = stats.remote_requests,
            remote_failures = stats.remote_failures,
            unresolved_ways = stats.unresolved_ways,
            points = stats.points_inserted,
            polylines = stats.polylines_inserted,
            polygons = stats.polygons_inserted,
            sink_failures = stats.sink_failures;
            "Import finished"
        );
        Ok(())
    }

    fn handle_node(&mut self, node: Node) -> Result<()> {
        let outcome = self.cache.store_node(&node)?;
        self.state.stats.record_node(outcome);
        if self.import_points && outcome != StoreOutcome::Invalid {
            self.insert_point(node);
        }
        Ok(())
    }

    fn handle_way(&mut self, way: Way) -> Result<()> {
        self.state.stats.ways_seen += 1;
        self.state.phase = Phase::StreamingWays;
        if self.stored(RecordKind::Polyline, way.id) {
            self.state.stats.ways_skipped += 1;
            return Ok(());
        }
        self.state.accumulator.add(way);
        if self.state.accumulator.is_full() {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn insert_point(&mut self, node: Node) {
        if self.stored(RecordKind::Point, node.id) {
            return;
        }
        let id = node.id;
        let inserted = self
            .assembler
            .assemble_node(node)
            .and_then(|record| match record {
                Some(record) => self.sink.insert(&record).map(|_| true),
                None => Ok(false),
            });
        match inserted {
            Ok(true) => self.state.stats.points_inserted += 1,
            Ok(false) => {}
            Err(err) => {
                let msg = err.to_string();
                warn!(id = id, err = msg.as_str(); "Could not insert point");
                self.state.stats.sink_failures += 1;
            }
        }
    }

    /// Only consults the sink when `skip_existing` is on.
    fn stored(&self, kind: RecordKind, id: OsmId) -> bool {
        if !self.skip_existing {
            return false;
        }
        self.sink.exists(kind, id).unwrap_or_else(|err| {
            let msg = err.to_string();
            warn!(id = id, err = msg.as_str(); "Sink lookup failed");
            false
        })
    }

    fn flush_batch(&mut self) -> Result<()> {
        let resolver = FallbackResolver::new(self.cache, self.authority, self.workers);
        let mut etl = WayBatchEtl::new(
            &mut self.state.accumulator,
            &mut self.state.index,
            self.cache,
            resolver,
            &self.assembler,
            &mut *self.sink,
        )
        .with_skip_existing(self.skip_existing);
        etl.process()?;
        let report = etl.report();

        self.state.stats.record_batch(&report);
        info!(
            batch = self.state.stats.batches,
            ways = report.ways,
            distinct_nodes = report.distinct_nodes,
            cache_hits = report.cache_hits,
            resolved_nodes = report.resolved_nodes,
            remote_requests = report.resolve.remote_requests,
            unresolved_ways = report.unresolved_ways;
            "Flushed way batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::osm::Relation;
    use crate::remote::MemoryAuthority;
    use crate::sink::MemorySink;
    use tempfile::TempDir;

    fn config(batch_size: usize) -> ImportConfig {
        let mut config = ImportConfig::from_json(
            r#"{"data_path": "unused.osm", "cache_dir": "unused", "output_dir": "unused"}"#,
        )
        .unwrap();
        config.batch_size = batch_size;
        config
    }

    #[test]
    fn phases_follow_the_stream() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        let authority = MemoryAuthority::new();
        let mut sink = MemorySink::new();
        let mut pipeline = ImportPipeline::new(&config(10), &cache, &authority, &mut sink);

        assert_eq!(pipeline.phase(), Phase::StreamingPoints);
        pipeline.handle_element(Element::Node(Node::new(1, 1.0, 1.0))).unwrap();
        pipeline.handle_element(Element::Node(Node::new(2, 2.0, 2.0))).unwrap();
        assert_eq!(pipeline.phase(), Phase::StreamingPoints);

        pipeline.handle_element(Element::Way(Way::new(5, vec![1, 2]))).unwrap();
        assert_eq!(pipeline.phase(), Phase::StreamingWays);
        assert_eq!(pipeline.state().accumulator.len(), 1);

        pipeline
            .handle_element(Element::Relation(Relation {
                id: 9,
                tags: Default::default(),
                info: Default::default(),
            }))
            .unwrap();
        assert_eq!(pipeline.phase(), Phase::Draining);
        assert!(pipeline.state().accumulator.is_empty());
        assert_eq!(pipeline.stats().batches, 1);

        pipeline.finish().unwrap();
        assert_eq!(pipeline.phase(), Phase::Done);
        assert_eq!(pipeline.stats().batches, 1);
    }

    #[test]
    fn records_skipped_at_load_are_not_skipped_ways() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        let authority = MemoryAuthority::new();
        let mut sink = MemorySink::new();
        let mut config = config(10);
        config.skip_existing = true;
        let mut pipeline = ImportPipeline::new(&config, &cache, &authority, &mut sink);

        for (id, lon, lat) in [(1, 1.0, 1.0), (2, 2.0, 1.0), (3, 2.0, 2.0)] {
            pipeline.handle_element(Element::Node(Node::new(id, lon, lat))).unwrap();
        }
        let ring = Way::new(7, vec![1, 2, 3, 1]).with_tag("building", "yes");
        pipeline.handle_element(Element::Way(ring.clone())).unwrap();
        pipeline.handle_element(Element::Way(ring)).unwrap();
        pipeline.finish().unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.ways_skipped, 0);
        assert_eq!(stats.records_skipped, 2);
        assert_eq!(stats.polylines_inserted, 1);
        assert_eq!(stats.polygons_inserted, 1);
    }

    #[test]
    fn full_accumulator_flushes_immediately() {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        let authority = MemoryAuthority::new();
        let mut sink = MemorySink::new();
        let mut pipeline = ImportPipeline::new(&config(2), &cache, &authority, &mut sink);

        pipeline.handle_element(Element::Node(Node::new(1, 1.0, 1.0))).unwrap();
        pipeline.handle_element(Element::Node(Node::new(2, 2.0, 2.0))).unwrap();
        pipeline.handle_element(Element::Way(Way::new(5, vec![1, 2]))).unwrap();
        assert_eq!(pipeline.stats().batches, 0);
        pipeline.handle_element(Element::Way(Way::new(6, vec![2, 1]))).unwrap();
        assert_eq!(pipeline.stats().batches, 1);
        assert!(pipeline.state().accumulator.is_empty());
        assert_eq!(pipeline.stats().polylines_inserted, 2);
    }
}
