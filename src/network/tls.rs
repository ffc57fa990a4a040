//! TLS material for the HTTPS listener

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::SslConfig;
use crate::{Result, TapedeckError};

/// Names the generated development certificate is valid for
const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// Build the acceptor for the HTTPS listener
///
/// Uses the configured certificate and key when given, otherwise a freshly
/// generated self-signed certificate for `localhost`.
///
/// # Errors
///
/// Returns [`TapedeckError::Tls`] if the material cannot be read or used
pub fn build_acceptor(ssl: Option<&SslConfig>) -> Result<TlsAcceptor> {
    let (chain, key) = match ssl {
        Some(ssl) => {
            info!("Loading listener certificate from {}", ssl.cert.display());
            load_pem(&ssl.cert, &ssl.key)?
        }
        None => {
            info!("Generating self-signed listener certificate");
            self_signed()?
        }
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TapedeckError::Tls(format!("Failed to configure TLS server: {e}")))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| TapedeckError::Tls(format!("Invalid listener certificate: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_pem(
    cert: &Path,
    key: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = CertificateDer::pem_file_iter(cert)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| TapedeckError::Tls(format!("{}: {e}", cert.display())))?;
    if chain.is_empty() {
        return Err(TapedeckError::Tls(format!(
            "{}: no certificates found",
            cert.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key)
        .map_err(|e| TapedeckError::Tls(format!("{}: {e}", key.display())))?;

    Ok((chain, key))
}

fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let names = SELF_SIGNED_NAMES.iter().map(|name| (*name).to_string()).collect::<Vec<_>>();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TapedeckError::Tls(format!("Failed to generate certificate: {e}")))?;

    let chain = vec![certified.cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    Ok((chain, key))
}
