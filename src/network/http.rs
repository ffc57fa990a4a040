//! HTTP request handling for both listeners

use std::sync::Arc;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::{debug, error};

use crate::fingerprint::{split_target, InboundRequest};
use crate::proxy::FixtureProxy;
use crate::{Result, TapedeckError};

use super::StaticRoutes;

/// Maximum number of request headers accepted
const MAX_HEADERS: usize = 128;

/// HTTP handler shared by every connection
pub struct HttpHandler {
    proxy: Arc<FixtureProxy>,
    statics: StaticRoutes,
    max_request_size: usize,
}

impl HttpHandler {
    /// Create a new handler
    #[must_use]
    pub fn new(proxy: Arc<FixtureProxy>, statics: StaticRoutes, max_request_size: usize) -> Self {
        Self {
            proxy,
            statics,
            max_request_size,
        }
    }

    /// Handle one request received on a listener speaking `protocol`
    ///
    /// Static routes are tried first; everything else goes to the proxy.
    /// Failures are turned into error responses here, so this never fails.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
        protocol: &'static str,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

        debug!("{} {} ({})", parts.method, target, protocol);

        let (pathname, _) = split_target(&target);
        if let Some(response) = self.statics.serve(&parts.method, pathname).await {
            return response;
        }

        if let Err(e) = Self::validate_request(&parts.headers, self.max_request_size) {
            return Self::error_response(&e);
        }
        let body = match Self::read_body(body, self.max_request_size).await {
            Ok(body) => body,
            Err(e) => return Self::error_response(&e),
        };

        let request = InboundRequest {
            method: parts.method,
            protocol: protocol.to_string(),
            target,
            headers: parts.headers,
            body,
        };

        match self.proxy.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                if !matches!(e, TapedeckError::FixtureNotFound(_)) {
                    error!("Request failed: {}", e);
                }
                Self::error_response(&e)
            }
        }
    }

    /// Create a simple text response
    #[must_use]
    pub fn create_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response
    }

    /// Create an error response
    #[must_use]
    pub fn error_response(error: &TapedeckError) -> Response<Full<Bytes>> {
        match error {
            TapedeckError::FixtureNotFound(_) => {
                Self::create_response(StatusCode::NOT_FOUND, &format!("{error}"))
            }
            TapedeckError::DataTooLarge { .. } => {
                Self::create_response(StatusCode::PAYLOAD_TOO_LARGE, &format!("{error}"))
            }
            TapedeckError::InvalidRequest(_) => {
                Self::create_response(StatusCode::BAD_REQUEST, &format!("{error}"))
            }
            _ => Self::create_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Internal server error\n\n{error}"),
            ),
        }
    }

    /// Validate request headers before the body is read
    ///
    /// # Errors
    ///
    /// Returns error if the declared body is too large or there are too many
    /// headers
    pub fn validate_request(headers: &HeaderMap, max_size: usize) -> Result<()> {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if let Some(length) = declared {
            if length > max_size {
                return Err(TapedeckError::DataTooLarge {
                    size: length,
                    limit: max_size,
                });
            }
        }

        if headers.len() > MAX_HEADERS {
            return Err(TapedeckError::InvalidRequest(format!(
                "Too many headers: {}",
                headers.len()
            )));
        }

        Ok(())
    }

    /// Read request body with size limit
    ///
    /// # Errors
    ///
    /// Returns error if body is too large or read fails
    pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
    where
        B: hyper::body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let collected = Limited::new(body, max_size).collect().await.map_err(|e| {
            if e.is::<http_body_util::LengthLimitError>() {
                TapedeckError::DataTooLarge {
                    size: max_size + 1,
                    limit: max_size,
                }
            } else {
                TapedeckError::InvalidRequest(format!("Failed to read body: {e}"))
            }
        })?;

        Ok(collected.to_bytes())
    }
}
