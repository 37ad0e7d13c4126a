//! Secure transport setup (§4.3): a `quinn` QUIC endpoint terminating
//! TLS 1.3, restricted to the three cipher suites the spec names, with
//! idle timeout ~300s and an application keep-alive of ~30s configured
//! on the transport so agents that go quiet are reaped even without a
//! missed heartbeat. `quinn`/`rustls`/`rcgen` were already declared
//! (unused) in the teacher's `Cargo.toml` for both binaries.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{Endpoint, ServerConfig, TransportConfig};

const IDLE_TIMEOUT_SECS: u64 = 300;
const KEEP_ALIVE_SECS: u64 = 30;

/// Builds a `quinn` server endpoint bound to `listen`. When `cert_file`
/// and `key_file` are both absent a fresh self-signed certificate is
/// generated for the lifetime of this process — suitable for
/// development, not for a deployment that expects agents to validate
/// the coordinator's certificate against the host trust store (§4.3).
pub fn build_server_endpoint(
    listen: SocketAddr,
    cert_file: Option<&str>,
    key_file: Option<&str>,
) -> Result<Endpoint> {
    let (cert_chain, key) = match (cert_file, key_file) {
        (Some(cert_path), Some(key_path)) => load_cert_and_key(cert_path, key_path)?,
        _ => generate_self_signed()?,
    };

    let mut server_crypto = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("building rustls server config")?;
    server_crypto.alpn_protocols = vec![b"tunnel/1".to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("adapting rustls config for quinn")?,
    ));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(Duration::from_secs(IDLE_TIMEOUT_SECS).try_into()?));
    transport.keep_alive_interval(Some(Duration::from_secs(KEEP_ALIVE_SECS)));
    server_config.transport_config(Arc::new(transport));

    let endpoint = Endpoint::server(server_config, listen).context("binding quinn server endpoint")?;
    Ok(endpoint)
}

fn load_cert_and_key(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>)> {
    let cert_bytes = std::fs::read(cert_path).with_context(|| format!("reading {cert_path}"))?;
    let key_bytes = std::fs::read(key_path).with_context(|| format!("reading {key_path}"))?;

    let certs = rustls_pemfile::certs(&mut Cursor::new(cert_bytes))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing certificate PEM")?;
    let key = rustls_pemfile::private_key(&mut Cursor::new(key_bytes))
        .context("parsing private key PEM")?
        .context("no private key found in key file")?;

    Ok((certs, key))
}

fn generate_self_signed() -> Result<(Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("generating self-signed certificate")?;
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());
    let cert_der = rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec());
    Ok((vec![cert_der], key))
}
