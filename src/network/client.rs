//! HTTP client for forwarding requests to the upstream

use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::{Result, TapedeckError};

type UpstreamConnector = HttpsConnector<HttpConnector>;

/// HTTP(S) client for the recording upstream
pub struct UpstreamClient {
    client: Client<UpstreamConnector, Full<Bytes>>,
}

impl UpstreamClient {
    /// Create a new upstream client
    ///
    /// With `verify_tls` off, the client's own TLS connector accepts any
    /// server certificate. Handshake signatures are still checked, and no
    /// other connection in the process is affected.
    ///
    /// # Errors
    ///
    /// Returns error if the TLS connector cannot be built
    pub fn new(verify_tls: bool) -> Result<Self> {
        let connector = build_connector(verify_tls)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Ok(Self { client })
    }

    /// Send a request, following redirects
    ///
    /// Redirects are only followed for `GET` and `HEAD`, without a hop limit;
    /// callers bound the exchange with a timeout. The returned response body
    /// has not been read yet.
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::Upstream`] if any hop fails
    pub async fn send(&self, request: UpstreamRequest) -> Result<Response<Incoming>> {
        let UpstreamRequest {
            method,
            mut uri,
            mut headers,
            body,
        } = request;

        loop {
            debug!("Forwarding {} to {}", method, uri);

            let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
            if let Some(request_headers) = builder.headers_mut() {
                *request_headers = headers.clone();
            }
            let http_request = builder
                .body(Full::new(body.clone()))
                .map_err(|e| {
                    TapedeckError::InvalidRequest(format!("Failed to build request: {e}"))
                })?;

            let response = self.client.request(http_request).await.map_err(|e| {
                warn!("Upstream request failed: {e}");
                TapedeckError::Upstream(format!("{method} {uri}: {e}"))
            })?;

            if !follows_redirects(&method) || !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(location) = response.headers().get(LOCATION) else {
                return Ok(response);
            };

            let next = resolve_location(&uri, location)?;
            debug!("Following {} redirect to {}", response.status(), next);

            if let Some(authority) = next.authority() {
                let host = HeaderValue::from_str(authority.as_str()).map_err(|e| {
                    TapedeckError::Upstream(format!("Invalid redirect host '{authority}': {e}"))
                })?;
                headers.insert(HOST, host);
            }
            uri = next;
        }
    }
}

/// Request to be forwarded upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute upstream URI
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

fn follows_redirects(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Resolve a `Location` header against the URI that produced it
fn resolve_location(base: &Uri, location: &HeaderValue) -> Result<Uri> {
    let location = location
        .to_str()
        .map_err(|e| TapedeckError::Upstream(format!("Invalid redirect location: {e}")))?;

    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().map_or("", |a| a.as_str());

    let absolute = if location.contains("://") {
        location.to_string()
    } else if location.starts_with("//") {
        format!("{scheme}:{location}")
    } else if location.starts_with('/') {
        format!("{scheme}://{authority}{location}")
    } else {
        let base_path = base.path();
        let dir = &base_path[..=base_path.rfind('/').unwrap_or(0)];
        format!("{scheme}://{authority}{dir}{location}")
    };

    absolute.parse::<Uri>().map_err(|e| {
        TapedeckError::Upstream(format!("Invalid redirect location '{absolute}': {e}"))
    })
}

fn build_connector(verify_tls: bool) -> Result<UpstreamConnector> {
    let provider = Arc::new(crypto::ring::default_provider());

    let builder = if verify_tls {
        HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(Arc::clone(&provider))
            .map_err(|e| {
                TapedeckError::Tls(format!("Failed to load native root certificates: {e}"))
            })?
    } else {
        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TapedeckError::Tls(format!("Failed to configure TLS client: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();
        HttpsConnectorBuilder::new().with_tls_config(config)
    };

    Ok(builder.https_or_http().enable_http1().build())
}

/// Certificate verifier used when upstream verification is switched off
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
