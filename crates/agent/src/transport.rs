//! Secure transport, agent side (§4.3): dials the coordinator's `quinn`
//! endpoint over TLS 1.3. By default the coordinator's certificate is
//! checked against the platform trust store via `webpki-roots`; for
//! self-signed development deployments `insecure_skip_verify` swaps in
//! a verifier that accepts any certificate — "a deployment concern, not
//! a protocol concern" per the spec, so it lives behind an explicit
//! config flag rather than a build-time feature.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

const IDLE_TIMEOUT_SECS: u64 = 300;
const KEEP_ALIVE_SECS: u64 = 30;

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

fn build_client_config(insecure_skip_verify: bool) -> Result<ClientConfig> {
    let mut crypto = if insecure_skip_verify {
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    crypto.alpn_protocols = vec![b"tunnel/1".to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .context("adapting rustls client config for quinn")?;
    let mut client_config = ClientConfig::new(Arc::new(quic_crypto));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(Duration::from_secs(IDLE_TIMEOUT_SECS).try_into()?));
    transport.keep_alive_interval(Some(Duration::from_secs(KEEP_ALIVE_SECS)));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

/// Dials the coordinator at `server_addr`, returning an established
/// connection. `server_name` is the TLS SNI / cert-name hint; callers
/// resolve the configured `server` host:port string before calling in.
pub async fn dial(server_addr: SocketAddr, server_name: &str, insecure_skip_verify: bool) -> Result<quinn::Connection> {
    let client_config = build_client_config(insecure_skip_verify)?;

    let bind_addr: SocketAddr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse()?;
    let mut endpoint = Endpoint::client(bind_addr).context("binding quinn client endpoint")?;
    endpoint.set_default_client_config(client_config);

    let connecting = endpoint.connect(server_addr, server_name).context("starting quinn connect")?;
    let connection = connecting.await.context("quinn handshake failed")?;
    Ok(connection)
}
