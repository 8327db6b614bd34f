use std::fmt;

use serde::{Deserialize, Serialize};

use super::osm::{Coord, Info, OsmId, Tags};

/// Collections a record can be persisted into.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Point,
    Polyline,
    Polygon,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Point, RecordKind::Polyline, RecordKind::Polygon];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Point => "point",
            RecordKind::Polyline => "polyline",
            RecordKind::Polygon => "polygon",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub id: OsmId,
    pub coord_deg: Coord,
    pub coord_rad: Coord,
    pub tags: Tags,
    pub info: Info,
    pub hash: String,
}

/// A way with every node reference replaced by its coordinate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PolylineRecord {
    pub id: OsmId,
    pub coords_deg: Vec<Coord>,
    pub coords_rad: Vec<Coord>,
    pub tags: Tags,
    pub info: Info,
    pub hash: String,
    pub closed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PolygonRecord {
    pub id: OsmId,
    pub coords_deg: Vec<Coord>,
    pub coords_rad: Vec<Coord>,
    pub tags: Tags,
    pub info: Info,
    pub hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Record {
    Point(PointRecord),
    Polyline(PolylineRecord),
    Polygon(PolygonRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Point(_) => RecordKind::Point,
            Record::Polyline(_) => RecordKind::Polyline,
            Record::Polygon(_) => RecordKind::Polygon,
        }
    }

    pub fn id(&self) -> OsmId {
        match self {
            Record::Point(point) => point.id,
            Record::Polyline(polyline) => polyline.id,
            Record::Polygon(polygon) => polygon.id,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Record::Point(point) => &point.hash,
            Record::Polyline(polyline) => &polyline.hash,
            Record::Polygon(polygon) => &polygon.hash,
        }
    }
}
