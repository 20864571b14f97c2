//! Upstream dialing.
//!
//! `http` upstreams get a plain TCP connection; every other scheme is dialed
//! over TLS. Certificates are verified against the Mozilla root set plus an
//! optional extra CA bundle unless verification is explicitly turned off.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use crate::error::TunnelError;

/// `host:port` to dial for an upstream URL.
///
/// The port defaults to 80 for `http` and 443 for any other scheme.
pub fn dial_address(url: &Url) -> Result<String, TunnelError> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TunnelError::InvalidUrl(format!("{} has no host", url)))?;

    let port = url
        .port()
        .unwrap_or(if url.scheme() == "http" { 80 } else { 443 });

    Ok(format!("{}:{}", host, port))
}

/// TLS options for upstream dials.
#[derive(Debug, Clone, Default)]
pub struct UpstreamTlsOptions {
    /// Extra PEM CA certificates trusted in addition to the public roots.
    pub ca_pem: Option<Vec<u8>>,
    /// Accept any upstream certificate.
    pub insecure_skip_verify: bool,
}

/// Dials one configured upstream.
#[derive(Clone)]
pub struct UpstreamConnector {
    url: Url,
    address: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("url", &self.url.as_str())
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl UpstreamConnector {
    /// Prepare a connector for `upstream_url`.
    pub fn new(upstream_url: &str, options: &UpstreamTlsOptions) -> Result<Self, TunnelError> {
        let url = Url::parse(upstream_url)
            .map_err(|e| TunnelError::InvalidUrl(format!("{}: {}", upstream_url, e)))?;
        let address = dial_address(&url)?;

        let tls = if url.scheme() == "http" {
            None
        } else {
            let server_name = server_name(&url)?;
            let config = client_config(options)?;
            Some((TlsConnector::from(config), server_name))
        };

        Ok(Self { url, address, tls })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The `host:port` this connector dials.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a fresh connection to the upstream. No retry.
    pub async fn dial(&self) -> Result<UpstreamStream, TunnelError> {
        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|source| TunnelError::Dial {
                address: self.address.clone(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            None => Ok(UpstreamStream::Plain(tcp)),
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|source| TunnelError::Tls {
                        address: self.address.clone(),
                        source,
                    })?;
                Ok(UpstreamStream::Tls(Box::new(stream)))
            }
        }
    }
}

fn server_name(url: &Url) -> Result<ServerName<'static>, TunnelError> {
    match url.host() {
        Some(Host::Domain(domain)) => ServerName::try_from(domain.to_string())
            .map_err(|e| TunnelError::InvalidUrl(format!("{}: {}", domain, e))),
        Some(Host::Ipv4(ip)) => Ok(ServerName::IpAddress(IpAddr::V4(ip).into())),
        Some(Host::Ipv6(ip)) => Ok(ServerName::IpAddress(IpAddr::V6(ip).into())),
        None => Err(TunnelError::InvalidUrl(format!("{} has no host", url))),
    }
}

fn client_config(options: &UpstreamTlsOptions) -> Result<Arc<ClientConfig>, TunnelError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(TunnelError::TlsConfig)?;

    let mut config = if options.insecure_skip_verify {
        tracing::warn!("Upstream TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(options.ca_pem.as_deref())?)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn root_store(ca_pem: Option<&[u8]>) -> Result<RootCertStore, TunnelError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = ca_pem {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TunnelError::CaBundle(e.to_string()))?;
        if certs.is_empty() {
            return Err(TunnelError::CaBundle("no certificates found".to_string()));
        }
        for cert in certs {
            roots.add(cert).map_err(TunnelError::TlsConfig)?;
        }
    }

    Ok(roots)
}

/// Verifier that trusts any certificate but still checks handshake
/// signatures, so the peer must hold the key it presents.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
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

/// A dialed upstream connection.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamStream::Plain(s) => f.debug_tuple("Plain").field(&s.peer_addr().ok()).finish(),
            UpstreamStream::Tls(s) => f
                .debug_tuple("Tls")
                .field(&s.get_ref().0.peer_addr().ok())
                .finish(),
        }
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            UpstreamStream::Plain(s) => s.is_write_vectored(),
            UpstreamStream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
