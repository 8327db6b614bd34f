use std::{io, num::{ParseFloatError, ParseIntError}, path::PathBuf, str::Utf8Error};
use quick_xml::events::attributes::AttrError;
use thiserror::Error;

use crate::data::osm::OsmId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not decode element stream: {0}")]
    Decode(String),

    #[error("coordinate cache i/o failed on {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no cached coordinate for node {0}")]
    NotFound(OsmId),

    #[error("refusing to store node {id} at ({lon}, {lat})")]
    InvalidValue { id: OsmId, lon: f64, lat: f64 },

    #[error("remote authority: {0}")]
    Remote(String),

    #[error("way {0} still has unresolved coordinates")]
    UnresolvedGeometry(OsmId),

    #[error("sink: {0}")]
    Sink(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors that must stop the import. Everything else is recovered with a counter.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::CacheIo { .. } | Error::Io(_) | Error::Config(_))
    }

    pub fn cache_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::CacheIo { path: path.into(), source }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(value: quick_xml::Error) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<AttrError> for Error {
    fn from(value: AttrError) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<ParseFloatError> for Error {
    fn from(value: ParseFloatError) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<ParseIntError> for Error {
    fn from(value: ParseIntError) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Decode(value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Remote(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_and_cache_io_are_fatal() {
        assert!(Error::Decode("bad".into()).is_fatal());
        assert!(Error::cache_io("0.bin", io::Error::other("disk")).is_fatal());
        assert!(!Error::Remote("timeout".into()).is_fatal());
        assert!(!Error::NotFound(7).is_fatal());
        assert!(!Error::InvalidValue { id: 1, lon: 0.0, lat: 0.0 }.is_fatal());
        assert!(!Error::UnresolvedGeometry(9).is_fatal());
        assert!(!Error::Sink("down".into()).is_fatal());
    }

    #[test]
    fn number_parse_failures_are_decode_errors() {
        let err: Error = "x1".parse::<i64>().unwrap_err().into();
        assert!(matches!(err, Error::Decode(_)));
    }
}
