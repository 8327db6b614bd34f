//! Turns resolved ways and tagged nodes into sink records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::geometry::{PointRecord, PolygonRecord, PolylineRecord, Record, RecordKind};
use crate::data::osm::{Coord, Node, Tags, Way};
use crate::errors::{Error, Result};

/// Keys that only describe how the data was made. Always removed.
pub const DEFAULT_DENIED_KEYS: [&str; 5] = ["source", "history", "converted_by", "created_by", "wikipedia"];

/// One tag cleanup rule. In a config file a rule is `{"key": ..}` or
/// `{"key": .., "value": ..}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum DenyRule {
    DeleteKeyIfValue { key: String, value: String },
    DeleteKey { key: String },
}

impl DenyRule {
    pub fn delete_key(key: &str) -> Self {
        DenyRule::DeleteKey { key: key.to_string() }
    }

    pub fn delete_key_if_value(key: &str, value: &str) -> Self {
        DenyRule::DeleteKeyIfValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Returns true when a tag was removed.
    pub fn apply(&self, tags: &mut Tags) -> bool {
        match self {
            DenyRule::DeleteKey { key } => tags.remove(key).is_some(),
            DenyRule::DeleteKeyIfValue { key, value } => {
                if tags.get(key) == Some(value) {
                    tags.remove(key);
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Ordered deny-list; rules run one after the other on the current tag set.
#[derive(Debug, Clone, PartialEq)]
pub struct TagCleaner {
    rules: Vec<DenyRule>,
}

impl TagCleaner {
    pub fn new<I>(extra_rules: I) -> Self
    where
        I: IntoIterator<Item = DenyRule>,
    {
        let mut rules: Vec<DenyRule> = DEFAULT_DENIED_KEYS
            .iter()
            .map(|key| DenyRule::delete_key(key))
            .collect();
        rules.extend(extra_rules);
        TagCleaner { rules }
    }

    pub fn clean(&self, tags: &mut Tags) {
        for rule in &self.rules {
            rule.apply(tags);
        }
    }
}

impl Default for TagCleaner {
    fn default() -> Self {
        TagCleaner::new(Vec::new())
    }
}

/// SHA-256 over the JSON form of `content`, hex encoded.
pub fn content_hash<T: Serialize>(content: &T) -> Result<String> {
    let bytes = serde_json::to_vec(content)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn to_radians(coords: &[Coord]) -> Vec<Coord> {
    coords.iter().map(|coord| coord.to_radians()).collect()
}

/// A ring closes on itself, or the tags say it is part of an area.
pub fn is_closed(coords: &[Coord], tags: &Tags) -> bool {
    let ring = coords.len() >= 2 && coords.first() == coords.last();
    ring || tags.get("type").map(String::as_str) == Some("multipolygon")
}

/// Nodes with nothing left after cleanup, or only a `building` tag, are not
/// worth a point record.
pub fn keep_point(tags: &Tags) -> bool {
    !tags.is_empty() && tags.keys().any(|key| key != "building")
}

#[derive(Debug, Clone, Default)]
pub struct GeometryAssembler {
    cleaner: TagCleaner,
}

impl GeometryAssembler {
    pub fn new(cleaner: TagCleaner) -> Self {
        GeometryAssembler { cleaner }
    }

    /// Builds the polyline record for a way whose node coordinates are all
    /// known, plus a polygon record when the way is closed.
    pub fn assemble_way(&self, way: Way, coords: Vec<Coord>) -> Result<Vec<Record>> {
        if way.node_ids.is_empty()
            || coords.len() != way.node_ids.len()
            || coords.iter().any(Coord::is_unresolved)
        {
            return Err(Error::UnresolvedGeometry(way.id));
        }

        let mut tags = way.tags;
        self.cleaner.clean(&mut tags);
        let closed = is_closed(&coords, &tags);
        let coords_rad = to_radians(&coords);
        let hash = content_hash(&(RecordKind::Polyline, way.id, &coords, &tags, &way.info, closed))?;

        let polyline = PolylineRecord {
            id: way.id,
            coords_deg: coords,
            coords_rad,
            tags,
            info: way.info,
            hash,
            closed,
        };

        if !closed {
            return Ok(vec![Record::Polyline(polyline)]);
        }

        let mut polygon_tags = polyline.tags.clone();
        self.cleaner.clean(&mut polygon_tags);
        let polygon_hash = content_hash(&(
            RecordKind::Polygon,
            polyline.id,
            &polyline.coords_deg,
            &polygon_tags,
            &polyline.info,
        ))?;
        let polygon = PolygonRecord {
            id: polyline.id,
            coords_deg: polyline.coords_deg.clone(),
            coords_rad: polyline.coords_rad.clone(),
            tags: polygon_tags,
            info: polyline.info.clone(),
            hash: polygon_hash,
        };
        Ok(vec![Record::Polyline(polyline), Record::Polygon(polygon)])
    }

    /// Point record for a tagged node, or `None` when the node is only geometry.
    pub fn assemble_node(&self, node: Node) -> Result<Option<Record>> {
        let mut tags = node.tags;
        self.cleaner.clean(&mut tags);
        if !keep_point(&tags) {
            return Ok(None);
        }
        let coord = Coord::new(node.lon, node.lat);
        let hash = content_hash(&(RecordKind::Point, node.id, &coord, &tags, &node.info))?;
        Ok(Some(Record::Point(PointRecord {
            id: node.id,
            coord_deg: coord,
            coord_rad: coord.to_radians(),
            tags,
            info: node.info,
            hash,
        })))
    }
}
