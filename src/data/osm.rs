use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type OsmId = i64;

/// Tags kept in key order so serialized records (and their hashes) are stable.
pub type Tags = BTreeMap<String, String>;

/// Longitude/latitude in degrees. `(0, 0)` means "not resolved yet".
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct Coord {
    pub lon: f64,
    pub lat: f64,
}

impl Coord {
    pub const UNRESOLVED: Coord = Coord { lon: 0.0, lat: 0.0 };

    pub fn new(lon: f64, lat: f64) -> Self {
        Coord { lon, lat }
    }

    pub fn is_unresolved(&self) -> bool {
        self.lon == 0.0 && self.lat == 0.0
    }

    pub fn to_radians(self) -> Coord {
        Coord {
            lon: self.lon.to_radians(),
            lat: self.lat.to_radians(),
        }
    }
}

/// Provenance attributes every OSM element carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Info {
    pub version: i64,
    pub changeset: i64,
    pub uid: i64,
    pub user: String,
    pub timestamp: String,
    pub visible: bool,
}

impl Default for Info {
    fn default() -> Self {
        Info {
            version: 0,
            changeset: 0,
            uid: 0,
            user: String::new(),
            timestamp: String::new(),
            visible: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Node {
    pub id: OsmId,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags,
    pub info: Info,
}

impl Node {
    pub fn new(id: OsmId, lon: f64, lat: f64) -> Self {
        Node {
            id,
            lon,
            lat,
            ..Default::default()
        }
    }

    pub fn coord(&self) -> Coord {
        Coord::new(self.lon, self.lat)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Way {
    pub id: OsmId,
    pub node_ids: Vec<OsmId>,
    pub tags: Tags,
    pub info: Info,
}

impl Way {
    pub fn new(id: OsmId, node_ids: Vec<OsmId>) -> Self {
        Way {
            id,
            node_ids,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Relations only mark a boundary in the stream; members are not kept.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Relation {
    pub id: OsmId,
    pub tags: Tags,
    pub info: Info,
}
