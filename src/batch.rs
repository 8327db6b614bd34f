use crate::data::osm::{OsmId, Way};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Ways handed over by [`BatchAccumulator::drain`].
#[derive(Debug, Default)]
pub struct Batch {
    pub ways: Vec<Way>,
    /// Every node reference of `ways`, repeats included.
    pub referenced_ids: Vec<OsmId>,
}

/// Buffers ways until the batch is resolved as a unit.
///
/// The cap is on ways, not on distinct nodes: that is what bounds memory.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_ways: usize,
    ways: Vec<Way>,
    referenced_ids: Vec<OsmId>,
}

impl BatchAccumulator {
    pub fn new(max_ways: usize) -> Self {
        let max_ways = max_ways.max(1);
        BatchAccumulator {
            max_ways,
            ways: Vec::with_capacity(max_ways),
            referenced_ids: Vec::new(),
        }
    }

    pub fn add(&mut self, way: Way) {
        self.referenced_ids.extend_from_slice(&way.node_ids);
        self.ways.push(way);
    }

    pub fn is_full(&self) -> bool {
        self.ways.len() >= self.max_ways
    }

    pub fn is_empty(&self) -> bool {
        self.ways.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ways.len()
    }

    pub fn max_ways(&self) -> usize {
        self.max_ways
    }

    pub fn drain(&mut self) -> Batch {
        Batch {
            ways: std::mem::replace(&mut self.ways, Vec::with_capacity(self.max_ways)),
            referenced_ids: std::mem::take(&mut self.referenced_ids),
        }
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        BatchAccumulator::new(DEFAULT_BATCH_SIZE)
    }
}
