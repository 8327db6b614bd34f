//! Sharded, append-only node coordinate cache.
//!
//! Each shard `<id mod N>.bin` is a flat run of 24 byte records,
//! `(id: i64, lon: f64, lat: f64)`, all big-endian, no header. Nothing is ever
//! rewritten: a lookup returns the first record for the id, scanning from the
//! start of the shard. Deleting the directory leaves a cold but valid cache.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{BufReader, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use log::{debug, warn};

use crate::data::osm::{Coord, Node, OsmId};
use crate::errors::{Error, Result};

pub const DEFAULT_SHARD_COUNT: u64 = 1000;
pub const RECORD_SIZE: usize = 24;
const SHARD_EXTENSION: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    AlreadyCached,
    Invalid,
}

pub struct CoordinateCache {
    dir: PathBuf,
    shard_count: u64,
    // One appending writer per shard at a time.
    write_locks: Vec<Mutex<()>>,
}

fn encode_record(id: OsmId, coord: Coord) -> [u8; RECORD_SIZE] {
    let mut record = [0u8; RECORD_SIZE];
    record[0..8].copy_from_slice(&id.to_be_bytes());
    record[8..16].copy_from_slice(&coord.lon.to_be_bytes());
    record[16..24].copy_from_slice(&coord.lat.to_be_bytes());
    record
}

fn decode_record(record: &[u8; RECORD_SIZE]) -> (OsmId, Coord) {
    let mut id = [0u8; 8];
    let mut lon = [0u8; 8];
    let mut lat = [0u8; 8];
    id.copy_from_slice(&record[0..8]);
    lon.copy_from_slice(&record[8..16]);
    lat.copy_from_slice(&record[16..24]);
    (
        OsmId::from_be_bytes(id),
        Coord::new(f64::from_be_bytes(lon), f64::from_be_bytes(lat)),
    )
}

/// Feeds every complete record of a shard to `visit` until it returns false.
/// A missing shard has no records; a truncated trailing record is ignored.
/// Records holding id 0 or the sentinel are skipped, so a later record for
/// the same id can still win.
fn scan_shard<F>(path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(OsmId, Coord) -> bool,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::cache_io(path, err)),
    };
    let mut reader = BufReader::new(file);
    let mut record = [0u8; RECORD_SIZE];
    loop {
        match reader.read_exact(&mut record) {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(Error::cache_io(path, err)),
        }
        let (id, coord) = decode_record(&record);
        if id == 0 || coord.is_unresolved() {
            continue;
        }
        if !visit(id, coord) {
            break;
        }
    }
    Ok(())
}

impl CoordinateCache {
    pub fn open(dir: impl AsRef<Path>, shard_count: u64) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Config("shard_count must be at least 1".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| Error::cache_io(&dir, err))?;
        let write_locks = (0..shard_count).map(|_| Mutex::new(())).collect();
        Ok(CoordinateCache {
            dir,
            shard_count,
            write_locks,
        })
    }

    /// Euclidean remainder, so negative ids still land in `0..shard_count`.
    pub fn shard_index(&self, id: OsmId) -> u64 {
        id.rem_euclid(self.shard_count as i64) as u64
    }

    pub fn shard_path(&self, shard: u64) -> PathBuf {
        self.dir.join(format!("{shard}.{SHARD_EXTENSION}"))
    }

    /// Appends a coordinate to the node's shard.
    ///
    /// The sentinel `(0, 0)` and the id `0` are rejected with `InvalidValue`.
    /// No check is made for an earlier record of the same id; callers that
    /// need idempotence go through [`CoordinateCache::store_node`].
    pub fn put(&self, id: OsmId, coord: Coord) -> Result<()> {
        if id == 0 || coord.is_unresolved() {
            return Err(Error::InvalidValue {
                id,
                lon: coord.lon,
                lat: coord.lat,
            });
        }
        let shard = self.shard_index(id);
        let path = self.shard_path(shard);
        let record = encode_record(id, coord);

        let _guard = self.write_locks[shard as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|err| Error::cache_io(&path, err))?;

        // A torn write leaves a partial record; appending after it would
        // shift every later record off the 24 byte grid.
        let len = file.metadata().map_err(|err| Error::cache_io(&path, err))?.len();
        let tail = len % RECORD_SIZE as u64;
        if tail != 0 {
            warn!(shard = shard, len = len; "Dropping partial record at end of shard");
            file.set_len(len - tail)
                .map_err(|err| Error::cache_io(&path, err))?;
        }

        file.write_all(&record)
            .map_err(|err| Error::cache_io(&path, err))
    }

    pub fn get(&self, id: OsmId) -> Result<Coord> {
        let path = self.shard_path(self.shard_index(id));
        let mut found = None;
        scan_shard(&path, |record_id, coord| {
            if record_id == id {
                found = Some(coord);
                false
            } else {
                true
            }
        })?;
        found.ok_or(Error::NotFound(id))
    }

    /// Like `get`, but a miss is `None` rather than an error.
    pub fn lookup(&self, id: OsmId) -> Result<Option<Coord>> {
        match self.get(id) {
            Ok(coord) => Ok(Some(coord)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Resolves many ids at once, reading each touched shard a single time.
    /// Ids the cache does not know are absent from the result.
    pub fn get_many(&self, ids: &[OsmId]) -> Result<HashMap<OsmId, Coord>> {
        let mut by_shard: BTreeMap<u64, HashSet<OsmId>> = BTreeMap::new();
        for &id in ids {
            by_shard.entry(self.shard_index(id)).or_default().insert(id);
        }

        let mut found = HashMap::with_capacity(ids.len());
        for (shard, wanted) in by_shard {
            let path = self.shard_path(shard);
            let mut remaining = wanted.len();
            scan_shard(&path, |record_id, coord| {
                if wanted.contains(&record_id) && !found.contains_key(&record_id) {
                    found.insert(record_id, coord);
                    remaining -= 1;
                }
                remaining > 0
            })?;
        }
        Ok(found)
    }

    /// Write-through for a node seen in the stream. Re-running over the same
    /// dump appends nothing new.
    pub fn store_node(&self, node: &Node) -> Result<StoreOutcome> {
        let coord = node.coord();
        if node.id == 0 || coord.is_unresolved() {
            warn!(id = node.id; "Skipping node with sentinel coordinate");
            return Ok(StoreOutcome::Invalid);
        }
        if self.lookup(node.id)?.is_some() {
            return Ok(StoreOutcome::AlreadyCached);
        }
        match self.put(node.id, coord) {
            Ok(()) => Ok(StoreOutcome::Stored),
            Err(Error::InvalidValue { id, .. }) => {
                warn!(id = id; "Cache rejected node coordinate");
                Ok(StoreOutcome::Invalid)
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes every shard file, leaving an empty (cold) cache.
    pub fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|err| Error::cache_io(&self.dir, err))?;
        let mut removed = 0usize;
        for entry in entries {
            let path = entry.map_err(|err| Error::cache_io(&self.dir, err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(SHARD_EXTENSION) {
                fs::remove_file(&path).map_err(|err| Error::cache_io(&path, err))?;
                removed += 1;
            }
        }
        debug!(removed = removed; "Cleared coordinate cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(tmp: &TempDir) -> CoordinateCache {
        CoordinateCache::open(tmp.path(), DEFAULT_SHARD_COUNT).unwrap()
    }

    #[test]
    fn put_then_get_returns_coordinate() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        for id in 1..=6 {
            cache.put(id, Coord::new(id as f64 + 0.1, id as f64 + 0.2)).unwrap();
        }
        for id in 1..=6 {
            let coord = cache.get(id).unwrap();
            assert_eq!(coord, Coord::new(id as f64 + 0.1, id as f64 + 0.2));
        }
        assert!(matches!(cache.get(7), Err(Error::NotFound(7))));
    }

    #[test]
    fn first_written_value_wins() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(42, Coord::new(1.5, 2.5)).unwrap();
        cache.put(42, Coord::new(9.0, 9.0)).unwrap();
        cache.put(1042, Coord::new(3.0, 4.0)).unwrap();
        assert_eq!(cache.get(42).unwrap(), Coord::new(1.5, 2.5));
        assert_eq!(cache.get(1042).unwrap(), Coord::new(3.0, 4.0));
    }

    #[test]
    fn sentinel_and_zero_id_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        assert!(matches!(
            cache.put(5, Coord::UNRESOLVED),
            Err(Error::InvalidValue { id: 5, .. })
        ));
        assert!(matches!(
            cache.put(0, Coord::new(1.0, 1.0)),
            Err(Error::InvalidValue { id: 0, .. })
        ));
        assert!(!cache.shard_path(cache.shard_index(5)).exists());
        assert!(matches!(cache.get(5), Err(Error::NotFound(5))));
    }

    #[test]
    fn one_axis_at_zero_is_a_real_coordinate() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(8, Coord::new(0.0, 51.5)).unwrap();
        assert_eq!(cache.get(8).unwrap(), Coord::new(0.0, 51.5));
    }

    #[test]
    fn records_are_big_endian_triplets() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(2001, Coord::new(10.0, 20.0)).unwrap();

        let bytes = fs::read(tmp.path().join("1.bin")).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(&bytes[0..8], &2001i64.to_be_bytes());
        assert_eq!(&bytes[8..16], &10.0f64.to_be_bytes());
        assert_eq!(&bytes[16..24], &20.0f64.to_be_bytes());
    }

    #[test]
    fn shard_assignment_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = cache(&tmp);
            cache.put(123_456_789, Coord::new(-0.1, 51.5)).unwrap();
            assert_eq!(cache.shard_index(123_456_789), 789);
        }
        let reopened = cache(&tmp);
        assert_eq!(reopened.shard_index(123_456_789), 789);
        assert_eq!(reopened.get(123_456_789).unwrap(), Coord::new(-0.1, 51.5));
    }

    #[test]
    fn negative_ids_map_into_range() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        assert_eq!(cache.shard_index(-1), 999);
        cache.put(-1, Coord::new(1.0, 2.0)).unwrap();
        assert_eq!(cache.get(-1).unwrap(), Coord::new(1.0, 2.0));
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(3, Coord::new(1.0, 2.0)).unwrap();
        let path = cache.shard_path(3);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        assert_eq!(cache.get(3).unwrap(), Coord::new(1.0, 2.0));
        assert!(matches!(cache.get(1003), Err(Error::NotFound(1003))));
    }

    #[test]
    fn append_after_truncated_tail_stays_readable() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(3, Coord::new(1.0, 2.0)).unwrap();
        let path = cache.shard_path(3);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let node = Node::new(1003, 7.0, 8.0);
        assert_eq!(cache.store_node(&node).unwrap(), StoreOutcome::Stored);
        assert_eq!(cache.get(1003).unwrap(), Coord::new(7.0, 8.0));
        assert_eq!(cache.get(3).unwrap(), Coord::new(1.0, 2.0));
        assert_eq!(cache.store_node(&node).unwrap(), StoreOutcome::AlreadyCached);
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * RECORD_SIZE as u64);
    }

    #[test]
    fn sentinel_record_on_disk_is_not_a_hit() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        fs::write(cache.shard_path(5), encode_record(5, Coord::UNRESOLVED)).unwrap();

        assert!(matches!(cache.get(5), Err(Error::NotFound(5))));
        assert!(cache.get_many(&[5]).unwrap().is_empty());

        let node = Node::new(5, 1.0, 2.0);
        assert_eq!(cache.store_node(&node).unwrap(), StoreOutcome::Stored);
        assert_eq!(cache.get(5).unwrap(), Coord::new(1.0, 2.0));
        assert_eq!(cache.get_many(&[5]).unwrap()[&5], Coord::new(1.0, 2.0));
    }

    #[test]
    fn get_many_matches_get() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(1, Coord::new(1.0, 1.0)).unwrap();
        cache.put(1001, Coord::new(2.0, 2.0)).unwrap();
        cache.put(1, Coord::new(5.0, 5.0)).unwrap();
        cache.put(2, Coord::new(3.0, 3.0)).unwrap();

        let found = cache.get_many(&[1, 1001, 2, 77, 1]).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[&1], Coord::new(1.0, 1.0));
        assert_eq!(found[&1001], Coord::new(2.0, 2.0));
        assert_eq!(found[&2], Coord::new(3.0, 3.0));
        assert!(!found.contains_key(&77));
    }

    #[test]
    fn store_node_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        let node = Node::new(10, 10.0, 20.0);
        assert_eq!(cache.store_node(&node).unwrap(), StoreOutcome::Stored);
        assert_eq!(cache.store_node(&node).unwrap(), StoreOutcome::AlreadyCached);
        assert_eq!(
            cache.store_node(&Node::new(11, 0.0, 0.0)).unwrap(),
            StoreOutcome::Invalid
        );
        let bytes = fs::read(cache.shard_path(10)).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
    }

    #[test]
    fn clear_makes_cache_cold() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp);
        cache.put(1, Coord::new(1.0, 1.0)).unwrap();
        cache.put(2, Coord::new(2.0, 2.0)).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.lookup(1).unwrap(), None);
        assert_eq!(cache.lookup(2).unwrap(), None);
    }

    #[test]
    fn zero_shards_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            CoordinateCache::open(tmp.path(), 0),
            Err(Error::Config(_))
        ));
    }
}
