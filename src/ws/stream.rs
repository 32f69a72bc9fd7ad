//! Raw stream setup: TCP connect and optional TLS for `wss://`
//!
//! Trust policy is strict (webpki roots) unless `accept_invalid_certs` is set
//! in the transport config, which installs a verifier that accepts any
//! certificate.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;

use crate::ws::connection::WebSocketConfig;
use crate::ws::error::{Result, WebSocketError};

/// Any bidirectional byte stream the transport can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream (plain TCP, TLS, or a caller-supplied stream)
pub type BoxedStream = Box<dyn AsyncStream>;

/// Connect TCP (and TLS for `wss`) to the URL's host.
///
/// Only `ws` and `wss` schemes are accepted.
pub async fn connect(url: &Url, config: &WebSocketConfig) -> Result<BoxedStream> {
    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        other => {
            return Err(WebSocketError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| WebSocketError::InvalidUrl(format!("{url}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| WebSocketError::InvalidUrl(format!("{url}: missing port")))?;

    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let tcp = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| WebSocketError::Timeout)??;
    optimize_tcp_stream(&tcp, config)?;

    if !secure {
        return Ok(Box::new(tcp));
    }

    let connector = tls_connector(config.accept_invalid_certs)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| WebSocketError::InvalidUrl(format!("{host}: {e}")))?;
    let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| WebSocketError::Timeout)?
        .map_err(|e| WebSocketError::Tls(e.to_string()))?;

    Ok(Box::new(tls))
}

/// Apply TCP options from config
fn optimize_tcp_stream(stream: &TcpStream, config: &WebSocketConfig) -> Result<()> {
    // Nagle off: frames go out as soon as they are flushed
    stream.set_nodelay(config.tcp_nodelay)?;
    Ok(())
}

/// Build a rustls connector on the ring provider
pub fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| WebSocketError::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts every server certificate
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
