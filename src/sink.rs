use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use crate::data::geometry::{Record, RecordKind};
use crate::data::osm::OsmId;
use crate::errors::{Error, Result};

/// Destination for finished records.
pub trait Sink {
    fn exists(&self, kind: RecordKind, id: OsmId) -> Result<bool>;
    fn insert(&mut self, record: &Record) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Record>,
    ids: HashSet<(RecordKind, OsmId)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn of_kind(&self, kind: RecordKind) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(move |record| record.kind() == kind)
    }
}

impl Sink for MemorySink {
    fn exists(&self, kind: RecordKind, id: OsmId) -> Result<bool> {
        Ok(self.ids.contains(&(kind, id)))
    }

    fn insert(&mut self, record: &Record) -> Result<()> {
        self.ids.insert((record.kind(), record.id()));
        self.records.push(record.clone());
        Ok(())
    }
}

#[derive(Deserialize)]
struct StoredId {
    id: OsmId,
}

/// Appends records as JSON lines, one `<kind>.jsonl` file per kind.
///
/// Ids already on disk are read back when the sink is opened, so `exists`
/// holds across runs.
pub struct JsonLinesSink {
    dir: PathBuf,
    writers: HashMap<RecordKind, BufWriter<File>>,
    ids: HashSet<(RecordKind, OsmId)>,
}

fn sink_io(path: &Path, err: std::io::Error) -> Error {
    Error::Sink(format!("{}: {err}", path.display()))
}

impl JsonLinesSink {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| sink_io(&dir, err))?;

        let mut ids = HashSet::new();
        for kind in RecordKind::ALL {
            let path = dir.join(format!("{kind}.jsonl"));
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(sink_io(&path, err)),
            };
            let mut loaded = 0usize;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|err| sink_io(&path, err))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredId>(&line) {
                    Ok(stored) => {
                        ids.insert((kind, stored.id));
                        loaded += 1;
                    }
                    Err(err) => {
                        let msg = err.to_string();
                        warn!(kind = kind.as_str(), err = msg.as_str(); "Skipping unreadable sink line");
                    }
                }
            }
            info!(kind = kind.as_str(), records = loaded; "Loaded existing sink records");
        }

        Ok(JsonLinesSink {
            dir,
            writers: HashMap::new(),
            ids,
        })
    }

    pub fn path(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(format!("{kind}.jsonl"))
    }

    fn writer(&mut self, kind: RecordKind) -> Result<&mut BufWriter<File>> {
        if !self.writers.contains_key(&kind) {
            let path = self.path(kind);
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|err| sink_io(&path, err))?;
            self.writers.insert(kind, BufWriter::new(file));
        }
        self.writers
            .get_mut(&kind)
            .ok_or_else(|| Error::Sink(format!("no writer for {kind}")))
    }
}

impl Sink for JsonLinesSink {
    fn exists(&self, kind: RecordKind, id: OsmId) -> Result<bool> {
        Ok(self.ids.contains(&(kind, id)))
    }

    fn insert(&mut self, record: &Record) -> Result<()> {
        let kind = record.kind();
        let path = self.path(kind);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer(kind)?
            .write_all(&line)
            .map_err(|err| sink_io(&path, err))?;
        self.ids.insert((kind, record.id()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for (kind, writer) in self.writers.iter_mut() {
            writer
                .flush()
                .map_err(|err| sink_io(&self.dir.join(format!("{kind}.jsonl")), err))?;
        }
        Ok(())
    }
}
