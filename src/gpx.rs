use crate::dlog;
use crate::types::Row;
use chrono::DateTime;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::Value as JsonValue;
use std::io::{BufRead, BufReader, Read};
use thiserror::Error;

/// Why a side-car track could not be turned into points.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error("no <gpx> root element")]
    NotGpx,

    #[error("track ends inside <{0}>")]
    Truncated(String),
}

/// Parsed GPX track: every `trkpt` of every `trkseg`, in document order.
///
/// The whole file is parsed up front, so a broken track fails before any of
/// its points reach the store.
#[derive(Debug, Clone, Default)]
pub struct Track {
    points: Vec<Row>,
}

impl Track {
    pub fn parse(text: &str) -> Result<Self, TrackError> {
        let mut xml = Reader::from_str(text);

        let mut st = GpxState::default();
        let mut out: Vec<Row> = Vec::new();
        let mut open: Vec<String> = Vec::new();
        let mut root_seen = false;

        loop {
            match xml.read_event()? {
                Event::Eof => break,
                Event::Start(e) => {
                    root_seen |= open.is_empty() && e.local_name().as_ref() == b"gpx";
                    open.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                    handle_gpx_start(&mut st, &e, &mut out);
                }
                Event::Empty(e) => {
                    root_seen |= open.is_empty() && e.local_name().as_ref() == b"gpx";
                    handle_gpx_start(&mut st, &e, &mut out);
                    handle_gpx_end(&mut st, e.local_name().as_ref(), &mut out);
                }
                Event::End(e) => {
                    open.pop();
                    handle_gpx_end(&mut st, e.local_name().as_ref(), &mut out);
                }
                Event::Text(e) => {
                    if st.leaf.is_some() {
                        st.text
                            .push_str(&e.decode().map_err(quick_xml::Error::from)?);
                    }
                }
                Event::CData(e) => {
                    if st.leaf.is_some() {
                        st.text
                            .push_str(&e.decode().map_err(quick_xml::Error::from)?);
                    }
                }
                Event::GeneralRef(e) => {
                    if st.leaf.is_some() {
                        if let Some(ch) = e.resolve_char_ref()? {
                            st.text.push(ch);
                        } else if let Some(s) = quick_xml::escape::resolve_predefined_entity(
                            &e.decode().map_err(quick_xml::Error::from)?,
                        ) {
                            st.text.push_str(s);
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(unclosed) = open.pop() {
            return Err(TrackError::Truncated(unclosed));
        }
        if !root_seen {
            return Err(TrackError::NotGpx);
        }
        Ok(Self { points: out })
    }

    /// Iterate the trackpoints; can be called any number of times.
    pub fn points(&self) -> impl Iterator<Item = &Row> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Read a side-car track: drop the first line (the XML declaration) and parse the rest.
pub fn read_track<R: Read>(input: R) -> std::io::Result<Result<Track, TrackError>> {
    let mut reader = BufReader::new(input);
    let mut header = String::new();
    reader.read_line(&mut header)?;

    let mut rest = String::new();
    reader.read_to_string(&mut rest)?;
    Ok(Track::parse(&rest))
}

#[derive(Default)]
struct GpxState {
    in_trkpt: bool,
    in_extensions: bool,
    leaf: Option<String>,
    text: String,
    cur: Row,
}

fn handle_gpx_start(st: &mut GpxState, e: &BytesStart<'_>, out: &mut Vec<Row>) {
    let local = e.local_name();
    match local.as_ref() {
        b"trkpt" => {
            if st.in_trkpt {
                // unclosed previous point; keep what we had
                flush_point(st, out);
            }
            st.in_trkpt = true;
            st.in_extensions = false;
            st.leaf = None;
            st.cur = parse_trkpt_lat_lon(e);
        }
        b"extensions" if st.in_trkpt => {
            st.in_extensions = true;
            st.leaf = None;
        }
        name if st.in_trkpt => {
            st.leaf = Some(String::from_utf8_lossy(name).into_owned());
            st.text.clear();
        }
        _ => {}
    }
}

fn handle_gpx_end(st: &mut GpxState, name: &[u8], out: &mut Vec<Row>) {
    match name {
        b"trkpt" if st.in_trkpt => flush_point(st, out),
        b"extensions" if st.in_trkpt => {
            st.in_extensions = false;
            st.leaf = None;
        }
        _ if st.in_trkpt => {
            if st
                .leaf
                .as_deref()
                .is_some_and(|leaf| leaf.as_bytes() == name)
                && let Some(leaf) = st.leaf.take()
            {
                let text = std::mem::take(&mut st.text);
                set_point_field(st, &leaf, text.trim());
            }
        }
        _ => {}
    }
}

fn flush_point(st: &mut GpxState, out: &mut Vec<Row>) {
    st.in_trkpt = false;
    st.in_extensions = false;
    st.leaf = None;
    let point = std::mem::take(&mut st.cur);

    if !(point.contains_key("latitude") && point.contains_key("longitude")) {
        dlog!("gpx_trkpt_without_position idx={}", out.len());
        return;
    }
    out.push(point);
}

fn set_point_field(st: &mut GpxState, tag: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    let (field, kind) = if st.in_extensions {
        extension_field(tag)
    } else {
        match trkpt_field(tag) {
            Some(f) => f,
            None => return,
        }
    };
    // Core fields win over same-named extensions.
    if st.in_extensions && st.cur.contains_key(field.as_str()) {
        return;
    }
    st.cur.insert(field, kind.convert(text));
}

#[derive(Clone, Copy)]
enum FieldKind {
    Float,
    Int,
    Text,
    Time,
    Guess,
}

impl FieldKind {
    fn convert(self, text: &str) -> JsonValue {
        match self {
            Self::Float => text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| JsonValue::String(text.to_string()), JsonValue::Number),
            Self::Int => text
                .parse::<i64>()
                .map_or_else(|_| JsonValue::String(text.to_string()), JsonValue::from),
            Self::Text => JsonValue::String(text.to_string()),
            Self::Time => DateTime::parse_from_rfc3339(text).map_or_else(
                |_| JsonValue::String(text.to_string()),
                |dt| JsonValue::String(dt.to_rfc3339()),
            ),
            Self::Guess => {
                if let Ok(i) = text.parse::<i64>() {
                    JsonValue::from(i)
                } else {
                    Self::Float.convert(text)
                }
            }
        }
    }
}

fn trkpt_field(tag: &str) -> Option<(String, FieldKind)> {
    let (field, kind) = match tag {
        "ele" => ("elevation", FieldKind::Float),
        "time" => ("time", FieldKind::Time),
        "course" => ("course", FieldKind::Float),
        "speed" => ("speed", FieldKind::Float),
        "magvar" => ("magnetic_variation", FieldKind::Float),
        "geoidheight" => ("geoid_height", FieldKind::Float),
        "hdop" => ("horizontal_dilution", FieldKind::Float),
        "vdop" => ("vertical_dilution", FieldKind::Float),
        "pdop" => ("position_dilution", FieldKind::Float),
        "ageofdgpsdata" => ("age_of_dgps_data", FieldKind::Float),
        "sat" => ("satellites", FieldKind::Int),
        "dgpsid" => ("dgps_id", FieldKind::Int),
        "name" => ("name", FieldKind::Text),
        "cmt" => ("comment", FieldKind::Text),
        "desc" => ("description", FieldKind::Text),
        "src" => ("source", FieldKind::Text),
        "sym" => ("symbol", FieldKind::Text),
        "type" => ("type", FieldKind::Text),
        "fix" => ("type_of_gpx_fix", FieldKind::Text),
        _ => return None,
    };
    Some((field.to_string(), kind))
}

fn extension_field(tag: &str) -> (String, FieldKind) {
    match tag {
        "speed" | "course" => (tag.to_string(), FieldKind::Float),
        _ => (tag.to_string(), FieldKind::Guess),
    }
}

fn parse_trkpt_lat_lon(e: &BytesStart<'_>) -> Row {
    let mut row = Row::new();

    for a in e.attributes().with_checks(false).flatten() {
        let field = match a.key.as_ref() {
            b"lat" => "latitude",
            b"lon" => "longitude",
            _ => continue,
        };
        if let Ok(v) = a.unescape_value()
            && let Ok(f) = v.trim().parse::<f64>()
            && let Some(n) = serde_json::Number::from_f64(f)
        {
            row.insert(field.to_string(), JsonValue::Number(n));
        }
    }

    row
}
