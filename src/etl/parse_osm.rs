use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use xz::bufread::XzDecoder;

use crate::data::osm::{Info, Node, OsmId, Relation, Tags, Way};
use crate::data::Element;
use crate::errors::{Error, Result};

/// Streams the elements of an OSM XML document in file order.
///
/// Nodes, ways (with their `nd` references) and relations are yielded with
/// their tags; everything else in the document (`bounds`, relation members,
/// changesets) is skipped. After the first error the reader is exhausted.
pub struct OsmXmlReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    current: Option<Element>,
    finished: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ElementCounts {
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
}

#[derive(Default)]
struct Attributes {
    id: Option<OsmId>,
    lat: Option<f64>,
    lon: Option<f64>,
    info: Info,
}

fn parse_number<T>(raw: &str) -> Result<T>
where
    T: str::FromStr,
    Error: From<T::Err>,
{
    Ok(raw.parse::<T>()?)
}

fn parse_attributes(el: &BytesStart) -> Result<Attributes> {
    let mut attrs = Attributes::default();
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        let value = attribute.unescape_value()?;
        match attribute.key.as_ref() {
            b"id" => attrs.id = Some(parse_number(&value)?),
            b"lat" => attrs.lat = Some(parse_number(&value)?),
            b"lon" => attrs.lon = Some(parse_number(&value)?),
            b"version" => attrs.info.version = parse_number(&value)?,
            b"changeset" => attrs.info.changeset = parse_number(&value)?,
            b"uid" => attrs.info.uid = parse_number(&value)?,
            b"user" => attrs.info.user = value.into_owned(),
            b"timestamp" => attrs.info.timestamp = value.into_owned(),
            b"visible" => attrs.info.visible = &*value != "false",
            _ => (),
        }
    }
    Ok(attrs)
}

fn element_name(el: &BytesStart) -> String {
    String::from_utf8_lossy(el.name().as_ref()).into_owned()
}

fn required<T>(value: Option<T>, what: &str, el: &BytesStart) -> Result<T> {
    value.ok_or_else(|| Error::Decode(format!("<{}> without {what}", element_name(el))))
}

fn parse_node(el: &BytesStart) -> Result<Node> {
    let attrs = parse_attributes(el)?;
    Ok(Node {
        id: required(attrs.id, "id", el)?,
        lat: required(attrs.lat, "lat", el)?,
        lon: required(attrs.lon, "lon", el)?,
        tags: Tags::new(),
        info: attrs.info,
    })
}

fn parse_way(el: &BytesStart) -> Result<Way> {
    let attrs = parse_attributes(el)?;
    Ok(Way {
        id: required(attrs.id, "id", el)?,
        node_ids: Vec::new(),
        tags: Tags::new(),
        info: attrs.info,
    })
}

fn parse_relation(el: &BytesStart) -> Result<Relation> {
    let attrs = parse_attributes(el)?;
    Ok(Relation {
        id: required(attrs.id, "id", el)?,
        tags: Tags::new(),
        info: attrs.info,
    })
}

fn parse_tag(el: &BytesStart) -> Result<(String, String)> {
    let mut key = None;
    let mut value = None;
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        match attribute.key.as_ref() {
            b"k" => key = Some(attribute.unescape_value()?.into_owned()),
            b"v" => value = Some(attribute.unescape_value()?.into_owned()),
            _ => (),
        }
    }
    Ok((required(key, "k", el)?, value.unwrap_or_default()))
}

fn parse_nd(el: &BytesStart) -> Result<OsmId> {
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        if attribute.key.as_ref() == b"ref" {
            return parse_number(str::from_utf8(&attribute.value)?);
        }
    }
    Err(Error::Decode("<nd> without ref".into()))
}

fn tags_mut(element: &mut Element) -> &mut Tags {
    match element {
        Element::Node(node) => &mut node.tags,
        Element::Way(way) => &mut way.tags,
        Element::Relation(relation) => &mut relation.tags,
    }
}

impl<R: BufRead> OsmXmlReader<R> {
    pub fn from_reader(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.trim_text(true);
        OsmXmlReader {
            reader,
            buf: Vec::new(),
            current: None,
            finished: false,
        }
    }

    fn begin(&mut self, element: Element, self_closing: bool) -> Result<Option<Element>> {
        if self_closing {
            return Ok(Some(element));
        }
        if let Some(open) = &self.current {
            return Err(Error::Decode(format!(
                "element {} opened inside element {}",
                element.id(),
                open.id()
            )));
        }
        self.current = Some(element);
        Ok(None)
    }

    fn open(&mut self, el: &BytesStart, self_closing: bool) -> Result<Option<Element>> {
        match el.name().as_ref() {
            b"node" => self.begin(Element::Node(parse_node(el)?), self_closing),
            b"way" => self.begin(Element::Way(parse_way(el)?), self_closing),
            b"relation" => self.begin(Element::Relation(parse_relation(el)?), self_closing),
            b"tag" => {
                if let Some(current) = self.current.as_mut() {
                    let (key, value) = parse_tag(el)?;
                    tags_mut(current).insert(key, value);
                }
                Ok(None)
            }
            b"nd" => {
                if let Some(Element::Way(way)) = self.current.as_mut() {
                    way.node_ids.push(parse_nd(el)?);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn close(&mut self, name: &[u8]) -> Option<Element> {
        match name {
            b"node" | b"way" | b"relation" => self.current.take(),
            _ => None,
        }
    }

    fn next_element(&mut self) -> Result<Option<Element>> {
        let mut buf = std::mem::take(&mut self.buf);
        loop {
            buf.clear();
            let emitted = match self.reader.read_event_into(&mut buf)? {
                Event::Eof => {
                    if let Some(open) = self.current.take() {
                        return Err(Error::Decode(format!(
                            "input ended inside element {}",
                            open.id()
                        )));
                    }
                    return Ok(None);
                }
                Event::Start(e) => self.open(&e, false)?,
                Event::Empty(e) => self.open(&e, true)?,
                Event::End(e) => self.close(e.name().as_ref()),
                Event::Text(_) => return Err("Didn't expect to see Text in OSM file.".into()),
                _ => None,
            };
            if emitted.is_some() {
                self.buf = buf;
                return Ok(emitted);
            }
        }
    }
}

impl<R: BufRead> Iterator for OsmXmlReader<R> {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_element() {
            Ok(Some(element)) => Some(Ok(element)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Opens a `.osm` file, decompressing on the fly when it ends in `.xz`.
pub fn open_osm_file(path: &Path) -> Result<OsmXmlReader<Box<dyn BufRead>>> {
    let file = fs::File::open(path)
        .map_err(|err| Error::Decode(format!("could not open {}: {err}", path.display())))?;
    let file_reader = BufReader::new(file);
    let inner: Box<dyn BufRead> = if path.extension().and_then(|ext| ext.to_str()) == Some("xz") {
        Box::new(BufReader::new(XzDecoder::new(file_reader)))
    } else {
        Box::new(file_reader)
    };
    Ok(OsmXmlReader::from_reader(inner))
}

pub fn count_elements<I>(elements: I) -> Result<ElementCounts>
where
    I: IntoIterator<Item = Result<Element>>,
{
    let mut counts = ElementCounts::default();
    for element in elements {
        match element? {
            Element::Node(_) => counts.nodes += 1,
            Element::Way(_) => counts.ways += 1,
            Element::Relation(_) => counts.relations += 1,
        }
    }
    Ok(counts)
}
