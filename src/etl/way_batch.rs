use log::warn;

use crate::assembler::GeometryAssembler;
use crate::batch::BatchAccumulator;
use crate::cache::CoordinateCache;
use crate::data::geometry::{Record, RecordKind};
use crate::errors::{Error, Result};
use crate::etl::Etl;
use crate::pending::PendingLookupIndex;
use crate::remote::RemoteAuthority;
use crate::resolver::{FallbackResolver, ResolveReport, WayInProgress};
use crate::sink::Sink;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub ways: usize,
    pub distinct_nodes: usize,
    pub cache_hits: usize,
    /// Distinct nodes with a coordinate once the resolver is done.
    pub resolved_nodes: usize,
    pub resolve: ResolveReport,
    pub unresolved_ways: usize,
    pub polylines_inserted: usize,
    pub polygons_inserted: usize,
    pub skipped_existing: usize,
    pub sink_failures: usize,
}

/// Drains the accumulator and carries its ways through to the sink.
///
/// Extract seeds the pending index from the drained ways and warms it from
/// the cache, transform runs the fallback resolver and the assembler, load
/// writes the records.
pub struct WayBatchEtl<'a, A: RemoteAuthority + ?Sized, S: Sink + ?Sized> {
    accumulator: &'a mut BatchAccumulator,
    index: &'a mut PendingLookupIndex,
    cache: &'a CoordinateCache,
    resolver: FallbackResolver<'a, A>,
    assembler: &'a GeometryAssembler,
    sink: &'a mut S,
    skip_existing: bool,
    report: BatchReport,
}

impl<'a, A: RemoteAuthority + ?Sized, S: Sink + ?Sized> WayBatchEtl<'a, A, S> {
    pub fn new(
        accumulator: &'a mut BatchAccumulator,
        index: &'a mut PendingLookupIndex,
        cache: &'a CoordinateCache,
        resolver: FallbackResolver<'a, A>,
        assembler: &'a GeometryAssembler,
        sink: &'a mut S,
    ) -> Self {
        WayBatchEtl {
            accumulator,
            index,
            cache,
            resolver,
            assembler,
            sink,
            skip_existing: false,
            report: BatchReport::default(),
        }
    }

    pub fn with_skip_existing(mut self, skip_existing: bool) -> Self {
        self.skip_existing = skip_existing;
        self
    }

    pub fn report(&self) -> BatchReport {
        self.report
    }

    fn already_stored(&self, record: &Record) -> bool {
        if !self.skip_existing {
            return false;
        }
        match self.sink.exists(record.kind(), record.id()) {
            Ok(exists) => exists,
            Err(err) => {
                let msg = err.to_string();
                warn!(id = record.id(), err = msg.as_str(); "Sink lookup failed, inserting anyway");
                false
            }
        }
    }
}

impl<A: RemoteAuthority + ?Sized, S: Sink + ?Sized> Etl for WayBatchEtl<'_, A, S> {
    type Input = Vec<WayInProgress>;
    type Output = Vec<Record>;

    fn etl_name(&self) -> &str {
        "way_batch"
    }

    fn extract(&mut self) -> Result<Self::Input> {
        let batch = self.accumulator.drain();
        self.report.ways = batch.ways.len();
        self.index.seed(batch.referenced_ids);
        self.report.distinct_nodes = self.index.len();
        self.report.cache_hits = self.index.warm(self.cache)?;
        Ok(batch.ways.into_iter().map(WayInProgress::new).collect())
    }

    fn transform(&mut self, mut ways: Self::Input) -> Result<Self::Output> {
        let resolve = self.resolver.resolve(&mut ways, self.index)?;
        self.report.resolve = resolve;
        self.report.resolved_nodes = self.index.resolved_count();
        self.report.unresolved_ways = resolve.unresolved_ways;

        let mut records = Vec::with_capacity(ways.len());
        for progress in ways {
            if progress.unresolved {
                continue;
            }
            match self.assembler.assemble_way(progress.way, progress.coords) {
                Ok(assembled) => records.extend(assembled),
                Err(Error::UnresolvedGeometry(id)) => {
                    warn!(id = id; "Way still has unresolved coordinates, dropping it");
                    self.report.unresolved_ways += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    fn load(&mut self, output: Self::Output) -> Result<()> {
        for record in output {
            if self.already_stored(&record) {
                self.report.skipped_existing += 1;
                continue;
            }
            match self.sink.insert(&record) {
                Ok(()) => match record.kind() {
                    RecordKind::Polygon => self.report.polygons_inserted += 1,
                    _ => self.report.polylines_inserted += 1,
                },
                Err(err) => {
                    let msg = err.to_string();
                    warn!(id = record.id(), kind = record.kind().as_str(), err = msg.as_str(); "Sink insert failed");
                    self.report.sink_failures += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::osm::{Coord, Way};
    use crate::remote::MemoryAuthority;
    use crate::sink::MemorySink;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        cache: CoordinateCache,
        authority: MemoryAuthority,
        assembler: GeometryAssembler,
        index: PendingLookupIndex,
        sink: MemorySink,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let cache = CoordinateCache::open(tmp.path(), 10).unwrap();
        for (id, lon, lat) in [(1, 1.0, 1.0), (2, 2.0, 1.0), (3, 2.0, 2.0)] {
            cache.put(id, Coord::new(lon, lat)).unwrap();
        }
        Fixture {
            _tmp: tmp,
            cache,
            authority: MemoryAuthority::new(),
            assembler: GeometryAssembler::default(),
            index: PendingLookupIndex::new(),
            sink: MemorySink::new(),
        }
    }

    fn run(fx: &mut Fixture, accumulator: &mut BatchAccumulator, skip_existing: bool) -> BatchReport {
        let resolver = FallbackResolver::new(&fx.cache, &fx.authority, 1);
        let mut etl = WayBatchEtl::new(
            accumulator,
            &mut fx.index,
            &fx.cache,
            resolver,
            &fx.assembler,
            &mut fx.sink,
        )
        .with_skip_existing(skip_existing);
        etl.process().unwrap();
        etl.report()
    }

    #[test]
    fn batch_is_drained_into_the_sink() {
        let mut fx = fixture();
        let mut accumulator = BatchAccumulator::new(10);
        accumulator.add(Way::new(10, vec![1, 2]).with_tag("highway", "path"));
        accumulator.add(Way::new(11, vec![1, 2, 3, 1]).with_tag("landuse", "grass"));

        let report = run(&mut fx, &mut accumulator, false);

        assert!(accumulator.is_empty());
        assert_eq!(report.ways, 2);
        assert_eq!(report.distinct_nodes, 3);
        assert_eq!(report.cache_hits, 3);
        assert_eq!(report.resolved_nodes, 3);
        assert_eq!(report.resolve.remote_requests, 0);
        assert_eq!(report.polylines_inserted, 2);
        assert_eq!(report.polygons_inserted, 1);
        assert_eq!(fx.sink.records().len(), 3);
        assert_eq!(fx.authority.node_requests(), 0);
    }

    #[test]
    fn unresolved_ways_never_reach_the_sink() {
        let mut fx = fixture();
        let mut accumulator = BatchAccumulator::new(10);
        accumulator.add(Way::new(10, vec![1, 2]));
        accumulator.add(Way::new(12, vec![1, 77]));

        let report = run(&mut fx, &mut accumulator, false);

        assert_eq!(report.unresolved_ways, 1);
        assert_eq!(report.distinct_nodes, 3);
        assert_eq!(report.resolved_nodes, 2);
        assert_eq!(fx.sink.records().len(), 1);
        assert_eq!(fx.sink.records()[0].id(), 10);
    }

    #[test]
    fn stored_records_are_skipped_when_asked() {
        let mut fx = fixture();
        let mut accumulator = BatchAccumulator::new(10);
        accumulator.add(Way::new(10, vec![1, 2]));
        run(&mut fx, &mut accumulator, true);

        accumulator.add(Way::new(10, vec![1, 2]));
        let report = run(&mut fx, &mut accumulator, true);

        assert_eq!(report.skipped_existing, 1);
        assert_eq!(report.polylines_inserted, 0);
        assert_eq!(fx.sink.records().len(), 1);
    }
}
