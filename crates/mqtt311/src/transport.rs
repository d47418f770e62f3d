//! Byte-stream transport: TCP with optional rustls TLS.
//!
//! The session layer only sees [`Stream`], a unified duplex stream that
//! it splits into reader/writer halves; everything TLS-specific
//! (including the permissive trust mode used against self-signed test
//! brokers) is confined to this module.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use mqtt311_protocol::{MqttError, Result};

use crate::options::{ConnectOptions, TrustPolicy};

/// A connected duplex byte stream, plain or TLS-wrapped.
#[derive(Debug)]
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Open a transport to the configured broker, applying the connect
/// timeout to both the TCP dial and the TLS handshake.
pub async fn open(options: &ConnectOptions) -> Result<Stream> {
    let address = format!("{}:{}", options.host, options.port);
    debug!(address = %address, tls = options.tls.is_some(), "opening transport");

    let tcp = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| MqttError::ConnectTimeout)??;
    tcp.set_nodelay(true)?;

    let Some(tls) = &options.tls else {
        return Ok(Stream::Plain(tcp));
    };

    let config = build_tls_config(tls.trust)?;
    let connector = TlsConnector::from(Arc::new(config));
    let name = tls.server_name.clone().unwrap_or_else(|| options.host.clone());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|_| MqttError::Tls(format!("invalid server name: {name}")))?;

    let stream = tokio::time::timeout(options.connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| MqttError::ConnectTimeout)?
        .map_err(|e| MqttError::Tls(e.to_string()))?;

    Ok(Stream::Tls(Box::new(stream)))
}

fn build_tls_config(trust: TrustPolicy) -> Result<ClientConfig> {
    match trust {
        TrustPolicy::Strict => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Ok(ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
        TrustPolicy::AcceptInvalidCertificates => Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
            .with_no_client_auth()),
    }
}

/// A certificate verifier that accepts any chain. Only reachable through
/// [`TrustPolicy::AcceptInvalidCertificates`].
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
