//! Recording engine: forward to the upstream, capture, persist

use std::path::PathBuf;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    ORIGIN, REFERER, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{HeaderMap, Method, StatusCode, Uri};
use tracing::{debug, info, warn};

use crate::config::{Config, MockConfig};
use crate::fingerprint::InboundRequest;
use crate::network::{UpstreamClient, UpstreamRequest};
use crate::snapshot::{capture_headers, FixtureCollection, HeaderValues, RecordedResponse, Slot};
use crate::storage::FixtureStore;
use crate::{Result, TapedeckError};

use super::decode::{read_decoded_body, ContentCoding};

/// Request headers that never travel to the upstream as received
const STRIPPED_REQUEST_HEADERS: [HeaderName; 6] =
    [CONNECTION, CONTENT_LENGTH, TE, TRAILER, TRANSFER_ENCODING, UPGRADE];

/// Outcome of a recorded exchange
#[derive(Debug, Clone)]
pub struct Recording {
    /// The captured response, as persisted
    pub response: RecordedResponse,
    /// The collection as it was written
    pub collection: FixtureCollection,
    /// Where the snapshot landed in its collection
    pub slot: Slot,
    /// Fixture file that was written
    pub path: PathBuf,
}

/// Recording engine for capturing upstream traffic
pub struct RecordingEngine {
    client: UpstreamClient,
    store: FixtureStore,
    mock: MockConfig,
    timeout: Duration,
    max_response_size: usize,
}

impl RecordingEngine {
    /// Create a new recording engine
    ///
    /// # Errors
    ///
    /// Returns error if the upstream client cannot be built
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: UpstreamClient::new(config.mock.verify_tls)?,
            store: FixtureStore::new(config.out.clone()),
            mock: config.mock.clone(),
            timeout: Duration::from_millis(config.limits.upstream_timeout_ms),
            max_response_size: config.limits.max_response_size,
        })
    }

    /// Forward `request` upstream, then upsert and persist the response
    ///
    /// The fixture is read and written only after the upstream exchange has
    /// completed, so a failed exchange leaves the fixture untouched. An
    /// unreadable fixture is replaced by a fresh collection.
    ///
    /// # Errors
    ///
    /// Returns error if the exchange fails, times out or the fixture cannot
    /// be written
    pub async fn record(&self, request: &InboundRequest) -> Result<Recording> {
        let response = self.capture(request).await?;

        let host = self.mock.host.as_str();
        let pathname = request.pathname();
        let collection = self.load_or_empty(pathname).await?;

        let (collection, slot) = collection.upsert(request.fingerprint(), response.clone());
        let path = self.store.save(host, pathname, &collection).await?;

        info!(
            "Recorded {} {} -> {} ({:?}, {} snapshot(s) in {})",
            request.method,
            request.target,
            response.status,
            slot,
            collection.len(),
            path.display()
        );

        Ok(Recording {
            response,
            collection,
            slot,
            path,
        })
    }

    /// Perform the upstream exchange and capture its response
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::Upstream`] if the exchange fails or exceeds
    /// the configured timeout
    pub async fn capture(&self, request: &InboundRequest) -> Result<RecordedResponse> {
        let upstream = self.upstream_request(request)?;

        tokio::time::timeout(self.timeout, self.exchange(upstream))
            .await
            .map_err(|_| {
                TapedeckError::Upstream(format!(
                    "{} {} timed out after {:?}",
                    request.method, request.target, self.timeout
                ))
            })?
    }

    async fn exchange(&self, upstream: UpstreamRequest) -> Result<RecordedResponse> {
        let is_head = upstream.method == Method::HEAD;
        let response = self.client.send(upstream).await?;
        let (parts, body) = response.into_parts();

        let coding = ContentCoding::from_headers(&parts.headers)?;
        let decoded = read_decoded_body(body, coding, self.max_response_size).await?;

        let mut headers = capture_headers(&parts.headers);
        let body = if carries_body(is_head, parts.status) {
            headers.insert(
                CONTENT_LENGTH.as_str().to_string(),
                HeaderValues::One(decoded.len().to_string()),
            );
            Some(decoded)
        } else {
            None
        };

        Ok(RecordedResponse {
            status: parts.status.as_u16(),
            headers,
            body,
        })
    }

    async fn load_or_empty(&self, pathname: &str) -> Result<FixtureCollection> {
        match self.store.load(&self.mock.host, pathname).await {
            Ok(Some(collection)) => Ok(collection),
            Ok(None) => Ok(FixtureCollection::new()),
            Err(TapedeckError::Parse { path, message }) => {
                warn!(
                    "Discarding unreadable fixture {}: {}",
                    path.display(),
                    message
                );
                Ok(FixtureCollection::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Build the upstream request for an inbound one
    fn upstream_request(&self, request: &InboundRequest) -> Result<UpstreamRequest> {
        let origin = self.mock.origin();
        let uri = format!("{origin}{}", request.target)
            .parse::<Uri>()
            .map_err(|e| TapedeckError::InvalidRequest(format!("Invalid target: {e}")))?;

        let headers = forwarded_headers(&request.headers, &self.mock.host, &origin)?;

        let body = if is_form(&request.headers) {
            reencode_form(&request.body).unwrap_or_else(|| {
                debug!("Form body is not valid UTF-8, forwarding as received");
                request.body.clone()
            })
        } else {
            request.body.clone()
        };

        Ok(UpstreamRequest {
            method: request.method.clone(),
            uri,
            headers,
            body,
        })
    }
}

/// Copy inbound headers, retargeting them at the upstream
fn forwarded_headers(inbound: &HeaderMap, host: &str, origin: &str) -> Result<HeaderMap> {
    let mut headers = inbound.clone();
    for name in &STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");

    headers.insert(HOST, header_value(host)?);
    headers.insert(ORIGIN, header_value(origin)?);
    headers.insert(REFERER, header_value(&format!("{origin}/"))?);

    if headers.contains_key(ACCEPT_ENCODING) {
        headers.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static(ContentCoding::ACCEPTED),
        );
    }

    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TapedeckError::ConfigError(format!("Invalid upstream header '{value}': {e}")))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        })
}

/// Normalize a urlencoded form body by decoding and re-encoding each pair
///
/// Returns `None` if a decoded key or value is not UTF-8.
fn reencode_form(body: &[u8]) -> Option<Bytes> {
    let body = std::str::from_utf8(body).ok()?;

    let mut pairs = Vec::new();
    for pair in body.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
        let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
        pairs.push(format!(
            "{}={}",
            urlencoding::encode(&key),
            urlencoding::encode(&value)
        ));
    }

    Some(Bytes::from(pairs.join("&")))
}

/// Whether a response to this exchange has a body at all
fn carries_body(is_head: bool, status: StatusCode) -> bool {
    !(is_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
