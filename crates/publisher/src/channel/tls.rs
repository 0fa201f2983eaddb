//! Mutual-TLS client configuration for the broker connection.
//!
//! The broker certificate is verified against the supplied CA bundle only (no
//! system roots), including the standard hostname check. The client presents
//! its own certificate chain and key. TLS 1.2 is the floor.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};

/// Accepted protocol versions, newest first.
pub const PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Read the three PEM files and build a [`ClientConfig`].
///
/// # Errors
///
/// Returns an error if any file cannot be read, or if [`build_client_config`]
/// rejects its contents.
pub fn load_client_config(
    ca_cert: &Path,
    client_cert: &Path,
    client_key: &Path,
) -> Result<Arc<ClientConfig>> {
    let ca_pem = std::fs::read(ca_cert)
        .with_context(|| format!("failed to read CA certificate {}", ca_cert.display()))?;
    let cert_pem = std::fs::read(client_cert)
        .with_context(|| format!("failed to read client certificate {}", client_cert.display()))?;
    let key_pem = std::fs::read(client_key)
        .with_context(|| format!("failed to read client private key {}", client_key.display()))?;

    build_client_config(&ca_pem, &cert_pem, &key_pem)
}

/// Build a [`rustls::ClientConfig`] from PEM-encoded CA bundle, client
/// certificate chain and client private key.
///
/// # Errors
///
/// Returns an error if any PEM input is empty or unparseable, or if rustls
/// rejects the key for the certificate.
pub fn build_client_config(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca_pem)) {
        let cert = cert.context("failed to parse CA certificate bundle")?;
        roots.add(cert).context("CA certificate rejected")?;
    }
    if roots.is_empty() {
        anyhow::bail!("no CA certificates found in PEM data");
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse client certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("no client certificate found in PEM data");
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .context("failed to read client private key")?
        .context("no private key found in PEM data")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .context("failed to select TLS protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("failed to build rustls ClientConfig")?;

    Ok(Arc::new(config))
}
