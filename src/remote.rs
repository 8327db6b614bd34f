//! Remote source of truth for nodes and ways missing from the cache.
//!
//! Every failure here is an [`Error::Remote`]: the import degrades, it never
//! stops because the API was unreachable or returned something unusable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;

use crate::config::RemoteConfig;
use crate::data::osm::{Node, OsmId, Way};
use crate::data::Element;
use crate::errors::{Error, Result};
use crate::etl::parse_osm::OsmXmlReader;

pub const DEFAULT_API_URL: &str = "https://www.openstreetmap.org/api/0.6";

/// Plain request/response lookups, one element per call.
pub trait RemoteAuthority: Send + Sync {
    fn fetch_node(&self, id: OsmId) -> Result<Node>;

    /// The way with its node references; coordinates come from `fetch_node`.
    fn fetch_way(&self, id: OsmId) -> Result<Way>;
}

impl<T: RemoteAuthority + ?Sized> RemoteAuthority for Box<T> {
    fn fetch_node(&self, id: OsmId) -> Result<Node> {
        (**self).fetch_node(id)
    }

    fn fetch_way(&self, id: OsmId) -> Result<Way> {
        (**self).fetch_way(id)
    }
}

fn as_remote(err: Error) -> Error {
    match err {
        Error::Remote(_) => err,
        other => Error::Remote(other.to_string()),
    }
}

fn find_element(body: &str, wanted: impl Fn(&Element) -> bool) -> Result<Option<Element>> {
    for element in OsmXmlReader::from_reader(body.as_bytes()) {
        let element = element.map_err(as_remote)?;
        if wanted(&element) {
            return Ok(Some(element));
        }
    }
    Ok(None)
}

/// Extracts node `id` from an API `/node/{id}` response.
pub fn parse_node_document(id: OsmId, body: &str) -> Result<Node> {
    match find_element(body, |el| matches!(el, Element::Node(node) if node.id == id))? {
        Some(Element::Node(node)) if node.coord().is_unresolved() => {
            Err(Error::Remote(format!("node {id} came back without a coordinate")))
        }
        Some(Element::Node(node)) => Ok(node),
        _ => Err(Error::Remote(format!("node {id} missing from response"))),
    }
}

/// Extracts way `id` from an API `/way/{id}` response.
pub fn parse_way_document(id: OsmId, body: &str) -> Result<Way> {
    match find_element(body, |el| matches!(el, Element::Way(way) if way.id == id))? {
        Some(Element::Way(way)) if way.node_ids.is_empty() => {
            Err(Error::Remote(format!("way {id} came back without nodes")))
        }
        Some(Element::Way(way)) => Ok(way),
        _ => Err(Error::Remote(format!("way {id} missing from response"))),
    }
}

/// Client for the OSM editing API (`/api/0.6`).
pub struct OsmApiClient {
    client: Client,
    base_url: String,
}

impl OsmApiClient {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|err| Error::Config(format!("could not build HTTP client: {err}")))?;
        Ok(OsmApiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        OsmApiClient::new(
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
            &config.user_agent,
        )
    }

    fn get_document(&self, kind: &str, id: OsmId) -> Result<String> {
        let url = format!("{}/{kind}/{id}", self.base_url);
        debug!(url = url.as_str(); "Requesting element from remote authority");
        let body = self
            .client
            .get(&url)
            .send()?
            .error_for_status()?
            .text()?;
        Ok(body)
    }
}

impl RemoteAuthority for OsmApiClient {
    fn fetch_node(&self, id: OsmId) -> Result<Node> {
        let body = self.get_document("node", id)?;
        parse_node_document(id, &body)
    }

    fn fetch_way(&self, id: OsmId) -> Result<Way> {
        let body = self.get_document("way", id)?;
        parse_way_document(id, &body)
    }
}

/// Used when remote lookups are switched off: every request fails.
pub struct OfflineAuthority;

impl RemoteAuthority for OfflineAuthority {
    fn fetch_node(&self, id: OsmId) -> Result<Node> {
        Err(Error::Remote(format!("remote lookups disabled, cannot fetch node {id}")))
    }

    fn fetch_way(&self, id: OsmId) -> Result<Way> {
        Err(Error::Remote(format!("remote lookups disabled, cannot fetch way {id}")))
    }
}

/// In-memory authority that counts the requests it serves.
#[derive(Default)]
pub struct MemoryAuthority {
    nodes: HashMap<OsmId, Node>,
    ways: HashMap<OsmId, Way>,
    node_requests: AtomicUsize,
    way_requests: AtomicUsize,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn insert_way(&mut self, way: Way) {
        self.ways.insert(way.id, way);
    }

    pub fn node_requests(&self) -> usize {
        self.node_requests.load(Ordering::SeqCst)
    }

    pub fn way_requests(&self) -> usize {
        self.way_requests.load(Ordering::SeqCst)
    }
}

impl RemoteAuthority for MemoryAuthority {
    fn fetch_node(&self, id: OsmId) -> Result<Node> {
        self.node_requests.fetch_add(1, Ordering::SeqCst);
        match self.nodes.get(&id) {
            Some(node) if !node.coord().is_unresolved() => Ok(node.clone()),
            Some(_) => Err(Error::Remote(format!("node {id} came back without a coordinate"))),
            None => Err(Error::Remote(format!("node {id} not found"))),
        }
    }

    fn fetch_way(&self, id: OsmId) -> Result<Way> {
        self.way_requests.fetch_add(1, Ordering::SeqCst);
        self.ways
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("way {id} not found")))
    }
}
