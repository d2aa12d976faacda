//! # podnet-quic
//!
//! QUIC endpoint construction for the pod control plane.
//!
//! Both sides of the fleet speak the same application protocol over QUIC:
//! the fleet manager dials out from an ephemeral UDP4 socket, hostd listens
//! on a fixed port with a self-signed certificate minted at startup. Host
//! identity is handled elsewhere (registration), so the client deliberately
//! skips certificate verification; the ALPN identifier is what keeps foreign
//! traffic out.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Once};
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use thiserror::Error;
use tracing::debug;

/// Application protocol identifier negotiated during the handshake.
pub const ALPN: &[u8] = b"podnet-rpc";

/// SNI name for dialing; never verified against the certificate.
pub const SERVER_NAME: &str = "podnet";

/// Bound on the handshake when dialing a host.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Idle keep-alive interval, to detect dead peers.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Errors from endpoint construction and dialing.
#[derive(Debug, Error)]
pub enum QuicError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to generate self-signed certificate: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("invalid dial target: {0}")]
    Dial(#[from] quinn::ConnectError),

    #[error("connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("handshake timed out after {}ms", HANDSHAKE_TIMEOUT.as_millis())]
    HandshakeTimeout,

    #[error("quic crypto configuration rejected: {0}")]
    CryptoConfig(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
}

/// Build a client endpoint on an ephemeral UDP4 socket.
///
/// Each host connection gets its own endpoint, so tearing one down on
/// reconnect cannot disturb any other host.
pub fn client_endpoint() -> Result<Endpoint, QuicError> {
    init_crypto_provider();

    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(client_config()?);
    Ok(endpoint)
}

/// Dial a host with a bounded handshake.
pub async fn connect(endpoint: &Endpoint, addr: SocketAddr) -> Result<Connection, QuicError> {
    let connecting = endpoint.connect(addr, SERVER_NAME)?;

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting).await {
        Ok(Ok(conn)) => {
            debug!(remote = %conn.remote_address(), "quic connection established");
            Ok(conn)
        }
        Ok(Err(e)) => Err(QuicError::Connection(e)),
        Err(_) => Err(QuicError::HandshakeTimeout),
    }
}

/// Build a server endpoint on the given UDP4 port with a fresh self-signed
/// certificate.
pub fn server_endpoint(bind: SocketAddr) -> Result<Endpoint, QuicError> {
    init_crypto_provider();

    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto)?));
    config.transport_config(transport_config());

    Ok(Endpoint::server(config, bind)?)
}

fn client_config() -> Result<ClientConfig, QuicError> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification::default()))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto)?));
    config.transport_config(transport_config());
    Ok(config)
}

fn transport_config() -> Arc<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Arc::new(transport)
}

/// Certificate verifier that accepts everything.
///
/// Hosts authenticate by being registered with the fleet manager, not by
/// certificate identity; the handshake only provides transport encryption.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl Default for SkipServerVerification {
    fn default() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
