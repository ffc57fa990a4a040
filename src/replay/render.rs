//! Rendering captured responses back onto the wire

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Response, StatusCode};
use tracing::warn;

use crate::snapshot::RecordedResponse;
use crate::{Result, TapedeckError};

/// Headers that describe a single connection and are never replayed
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == CONNECTION
        || name == TE
        || name == TRAILER
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// Render a captured response as an HTTP response
///
/// The body is always sent decoded, so `content-encoding` is never set.
/// `content-length` follows the body when there is one; a bodyless response
/// keeps whatever length was recorded (useful for `HEAD`).
///
/// # Errors
///
/// Returns error if the recorded status code is not a valid HTTP status
pub fn render_response(recorded: &RecordedResponse) -> Result<Response<Full<Bytes>>> {
    let status = StatusCode::from_u16(recorded.status).map_err(|e| {
        TapedeckError::Other(format!("Invalid recorded status {}: {e}", recorded.status))
    })?;

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    let headers = response.headers_mut();

    for (name, values) in &recorded.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!("Skipping recorded header with invalid name '{}'", name);
            continue;
        };
        if name == CONTENT_ENCODING || is_hop_by_hop(&name) {
            continue;
        }
        if name == CONTENT_LENGTH && recorded.body.is_some() {
            continue;
        }

        for value in values.iter() {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!("Skipping invalid value for recorded header '{}'", name),
            }
        }
    }

    if let Some(body) = &recorded.body {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        *response.body_mut() = Full::new(Bytes::copy_from_slice(body));
    }

    Ok(response)
}
