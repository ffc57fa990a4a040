//! Request fingerprinting for snapshot matching

use hyper::body::Bytes;
use hyper::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

/// The request fields a stored snapshot is matched on
///
/// Fingerprints compare by exact field equality. Query parameter order, path
/// case and headers are deliberately not normalized: `?a=1&b=2` and `?b=2&a=1`
/// are two different fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// HTTP method, upper-case
    pub method: String,
    /// Inbound scheme, `http:` or `https:`
    pub protocol: String,
    /// Raw query string without the leading `?`, empty if none
    pub search: String,
}

/// Compute the fingerprint of an inbound request
///
/// `target` is the request target as received (`/path?query`). `protocol`
/// may be given with or without the trailing colon.
#[must_use]
pub fn fingerprint_request(method: &str, protocol: &str, target: &str) -> Fingerprint {
    let (_, search) = split_target(target);

    Fingerprint {
        method: method.to_uppercase(),
        protocol: normalize_protocol(protocol),
        search: search.to_string(),
    }
}

/// An inbound request, fully buffered
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method
    pub method: Method,
    /// Scheme of the listener that accepted the request, e.g. `https:`
    pub protocol: String,
    /// Request target, `/path?query`
    pub target: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

impl InboundRequest {
    /// Fingerprint of this request
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_request(self.method.as_str(), &self.protocol, &self.target)
    }

    /// Path component, used to pick the fixture file
    #[must_use]
    pub fn pathname(&self) -> &str {
        split_target(&self.target).0
    }

    /// Raw query string without the leading `?`
    #[must_use]
    pub fn search(&self) -> &str {
        split_target(&self.target).1
    }
}

/// Split a request target into pathname and search at the first `?`
#[must_use]
pub fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((pathname, search)) => (pathname, search),
        None => (target, ""),
    }
}

/// Render a scheme the way snapshots store it (`https:`)
fn normalize_protocol(protocol: &str) -> String {
    let scheme = protocol.trim_end_matches("//").trim_end_matches(':');
    format!("{}:", scheme.to_ascii_lowercase())
}
