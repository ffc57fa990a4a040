//! Snapshots, fixture collections and snapshot matching

use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE, DATE};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Ordered response headers as persisted in a snapshot
pub type Headers = IndexMap<String, HeaderValues>;

/// Value(s) recorded for one header name
///
/// Most headers carry a single value and persist as a plain string; repeated
/// headers such as `set-cookie` persist as a list. Hand-edited fixtures may use
/// bare numbers or booleans, which load as their text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValues {
    /// A single value
    One(String),
    /// A header repeated by the upstream
    Many(Vec<String>),
}

/// Any scalar a header value may be written as
#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    Text(String),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Flag(bool),
}

impl From<ScalarValue> for String {
    fn from(value: ScalarValue) -> Self {
        match value {
            ScalarValue::Text(text) => text,
            ScalarValue::Signed(n) => n.to_string(),
            ScalarValue::Unsigned(n) => n.to_string(),
            ScalarValue::Float(n) => n.to_string(),
            ScalarValue::Flag(flag) => flag.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredHeaderValues {
    One(ScalarValue),
    Many(Vec<ScalarValue>),
}

impl<'de> Deserialize<'de> for HeaderValues {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match StoredHeaderValues::deserialize(deserializer)? {
            StoredHeaderValues::One(value) => Self::One(value.into()),
            StoredHeaderValues::Many(values) => {
                Self::Many(values.into_iter().map(String::from).collect())
            }
        })
    }
}

impl HeaderValues {
    /// Iterate over the individual values
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }

    fn push(&mut self, value: String) {
        match self {
            Self::One(first) => {
                let first = std::mem::take(first);
                *self = Self::Many(vec![first, value]);
            }
            Self::Many(values) => values.push(value),
        }
    }
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

/// Convert upstream response headers into snapshot headers
///
/// `content-encoding` is dropped because bodies are always stored decoded;
/// `date` is dropped so re-recordings produce stable fixtures.
#[must_use]
pub fn capture_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();

    for (name, value) in map {
        if name == CONTENT_ENCODING || name == DATE {
            continue;
        }

        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if let Some(existing) = headers.get_mut(name.as_str()) {
            existing.push(value);
        } else {
            headers.insert(name.as_str().to_string(), HeaderValues::One(value));
        }
    }

    headers
}

/// Look up a header by case-insensitive name, returning its first value
#[must_use]
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.iter().next())
}

/// A captured upstream response, ready to be stored or sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, without `content-encoding` and `date`
    pub headers: Headers,
    /// Decoded body; `None` when the response had no body at all
    pub body: Option<Vec<u8>>,
}

/// One recorded request fingerprint and its captured response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// HTTP method, upper-case
    pub method: String,
    /// Inbound scheme, `http:` or `https:`
    pub protocol: String,
    /// Raw query string, empty if none
    pub search: String,
    /// HTTP status code
    pub status_code: u16,
    /// Response headers
    pub headers: Headers,
    /// Response body; `None` means no body key at all
    pub body: Option<Vec<u8>>,
}

impl Snapshot {
    /// Build a snapshot from a fingerprint and a captured response
    #[must_use]
    pub fn new(fingerprint: Fingerprint, response: RecordedResponse) -> Self {
        Self {
            method: fingerprint.method,
            protocol: fingerprint.protocol,
            search: fingerprint.search,
            status_code: response.status,
            headers: response.headers,
            body: response.body,
        }
    }

    /// Check whether this snapshot was recorded for `fingerprint`
    #[must_use]
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.method == fingerprint.method
            && self.protocol == fingerprint.protocol
            && self.search == fingerprint.search
    }

    /// The captured response stored in this snapshot
    #[must_use]
    pub fn into_response(self) -> RecordedResponse {
        RecordedResponse {
            status: self.status_code,
            headers: self.headers,
            body: self.body,
        }
    }

    /// Recorded `content-type`, if any
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        header_value(&self.headers, CONTENT_TYPE.as_str())
    }

    /// Whether the recorded content type is HTML
    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type()
            .is_some_and(|content_type| content_type.contains("text/html"))
    }
}

/// Where an upserted snapshot landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// An existing snapshot was overwritten in place
    Updated(usize),
    /// A new snapshot was appended
    Appended(usize),
}

impl Slot {
    /// Index of the snapshot in the collection
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Updated(index) | Self::Appended(index) => index,
        }
    }
}

/// Ordered snapshots for one `(host, pathname)` fixture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureCollection {
    snapshots: Vec<Snapshot>,
}

impl FixtureCollection {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of the first snapshot matching `fingerprint`
    #[must_use]
    pub fn position(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.snapshots
            .iter()
            .position(|snapshot| snapshot.matches(fingerprint))
    }

    /// First snapshot matching `fingerprint`
    ///
    /// Later snapshots with the same fingerprint are never returned.
    #[must_use]
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<&Snapshot> {
        self.position(fingerprint).map(|index| &self.snapshots[index])
    }

    /// Store `response` for `fingerprint`, updating the first match in place
    /// or appending a new snapshot
    #[must_use]
    pub fn upsert(mut self, fingerprint: Fingerprint, response: RecordedResponse) -> (Self, Slot) {
        let slot = match self.position(&fingerprint) {
            Some(index) => {
                self.snapshots[index] = Snapshot::new(fingerprint, response);
                Slot::Updated(index)
            }
            None => {
                self.snapshots.push(Snapshot::new(fingerprint, response));
                Slot::Appended(self.snapshots.len() - 1)
            }
        };

        (self, slot)
    }

    /// Number of snapshots
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the collection holds no snapshots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Snapshots in insertion order
    #[must_use]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }
}

impl From<Vec<Snapshot>> for FixtureCollection {
    fn from(snapshots: Vec<Snapshot>) -> Self {
        Self { snapshots }
    }
}
