//! Connection handling for `portcullis serve`.
//!
//! Each accepted connection has its request head sniffed off the raw
//! socket. Upgrade requests carrying a valid session are tunneled to the
//! upstream; everything else is replayed into hyper, which serves the
//! health endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE, COOKIE, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use portcullis_oidc::IdentityClient;
use portcullis_session::{SessionCodec, SessionError, SessionState};
use portcullis_telemetry::{log_connection_error, log_session_rejected};
use portcullis_tunnel::{
    find_cookie, tunnel, Hijack, ManagedConnection, Prefixed, RawConnection, RequestHead,
    TunnelError, UpstreamConnector, DEFAULT_MAX_HEADER_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

/// Path of the built-in health endpoint.
pub const HEALTH_PATH: &str = "/__portcullis/health";

/// Bytes drained from a rejected connection before it is closed.
const DRAIN_LIMIT: u64 = 64 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why an upgrade request was refused.
#[derive(Debug)]
pub enum SessionRejection {
    /// No session cookie on the request.
    Missing,
    /// The cookie did not open, or its session has expired.
    Invalid(SessionError),
}

impl std::fmt::Display for SessionRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRejection::Missing => f.write_str("missing session cookie"),
            SessionRejection::Invalid(e) => write!(f, "{}", e),
        }
    }
}

/// Shared gateway state.
pub struct Gateway {
    codec: SessionCodec,
    cookie_name: String,
    connector: UpstreamConnector,
    identity: Option<IdentityClient>,
    max_header_size: usize,
}

impl Gateway {
    /// Create a gateway tunneling to `connector`, authorizing with `codec`.
    pub fn new(codec: SessionCodec, connector: UpstreamConnector) -> Self {
        Self {
            codec,
            cookie_name: "_portcullis_session".to_string(),
            connector,
            identity: None,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }

    /// Set the session cookie name.
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Set the request head size limit.
    pub fn with_max_header_size(mut self, max: usize) -> Self {
        self.max_header_size = max;
        self
    }

    /// Attach the identity client; its provider is reported by the health
    /// endpoint and it stays alive as long as the gateway.
    pub fn with_identity(mut self, identity: IdentityClient) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Accept connections until `shutdown_rx` observes `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log_connection_error!(error = %e, "Accept failed");
                        continue;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let _ = stream.set_nodelay(true);
            let gateway = Arc::clone(&self);
            let tls = tls.clone();

            tokio::spawn(async move {
                match tls {
                    None => gateway.handle_connection(stream, peer).await,
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => gateway.handle_connection(stream, peer).await,
                        Err(e) => {
                            log_connection_error!(peer = %peer, error = %e, "TLS handshake failed")
                        }
                    },
                }
            });
        }
    }

    /// Serve one client connection.
    pub async fn handle_connection<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (head, rest) = match RequestHead::read_from(&mut stream, self.max_header_size).await {
            Ok(sniffed) => sniffed,
            Err(TunnelError::ConnectionClosed) => return,
            Err(TunnelError::HeaderTooLarge(limit)) => {
                log_connection_error!(peer = %peer, limit, "Request head too large");
                write_rejection(&mut stream, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE).await;
                discard_unread(&mut stream).await;
                return;
            }
            Err(e) => {
                log_connection_error!(peer = %peer, error = %e, "Unreadable request");
                write_rejection(&mut stream, StatusCode::BAD_REQUEST).await;
                return;
            }
        };

        if head.is_upgrade() {
            if let Err(rejection) = self.authorize(head.cookie(&self.cookie_name)) {
                log_session_rejected!(
                    peer = %peer,
                    path = %head.path(),
                    reason = %rejection,
                    "Upgrade request without a valid session"
                );
                write_rejection(&mut stream, StatusCode::UNAUTHORIZED).await;
                return;
            }

            tracing::debug!(peer = %peer, path = %head.path(), "Tunneling upgrade request");
            let handshake = head.replay(&rest);
            let connection = RawConnection::new(stream).with_peer(peer);
            // Failures are logged by the tunnel; the client is already closed.
            let _ = tunnel(connection, &handshake, &self.connector).await;
            return;
        }

        let io = TokioIo::new(Prefixed::new(head.replay(&rest), stream));
        let gateway = Arc::clone(&self);
        let service = service_fn(move |req| {
            let gateway = Arc::clone(&gateway);
            async move { Ok::<_, Infallible>(gateway.handle_request(req, peer).await) }
        });

        if let Err(e) = http1::Builder::new()
            .max_buf_size(self.max_header_size.max(8192))
            .serve_connection(io, service)
            .await
        {
            log_connection_error!(peer = %peer, error = %e, "Connection error");
        }
    }

    /// Requests that reach hyper: the health endpoint, or upgrade attempts
    /// on a connection hyper already owns.
    async fn handle_request(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        if req.headers().contains_key(UPGRADE) {
            let cookie = find_cookie(
                req.headers()
                    .get_all(COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok()),
                &self.cookie_name,
            );
            if let Err(rejection) = self.authorize(cookie) {
                log_session_rejected!(
                    peer = %peer,
                    path = %req.uri().path(),
                    reason = %rejection,
                    "Upgrade request without a valid session"
                );
                return error_response(StatusCode::UNAUTHORIZED);
            }

            // hyper owns this connection, so the tunnel is never reached.
            return match ManagedConnection::new(Some(peer)).hijack().await {
                Err(TunnelError::HijackUnsupported) => {
                    tracing::warn!(
                        peer = %peer,
                        path = %req.uri().path(),
                        "Upgrade requested on a connection that cannot be taken over"
                    );
                    error_response(StatusCode::NOT_IMPLEMENTED)
                }
                Err(e) => {
                    log_connection_error!(peer = %peer, error = %e, "Connection takeover failed");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
                Ok(_) => {
                    tracing::warn!(
                        peer = %peer,
                        "Server-managed connection unexpectedly handed over; refusing upgrade"
                    );
                    error_response(StatusCode::NOT_IMPLEMENTED)
                }
            };
        }

        if req.uri().path() == HEALTH_PATH {
            return self.health_response();
        }

        error_response(StatusCode::NOT_FOUND)
    }

    /// A request is authorized when its cookie opens to an unexpired session.
    pub fn authorize(&self, cookie: Option<&str>) -> Result<SessionState, SessionRejection> {
        let value = cookie.ok_or(SessionRejection::Missing)?;
        self.codec.open_state(value).map_err(SessionRejection::Invalid)
    }

    fn health_response(&self) -> Response<Full<Bytes>> {
        let provider = self.identity.as_ref().map(|client| client.provider_config());

        let body = serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "upstream": self.connector.address(),
            "issuer": provider.as_ref().map(|p| p.issuer().to_string()),
            "signing_keys": provider.as_ref().map(|p| p.keys.len()),
        });

        json_response(StatusCode::OK, body.to_string())
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = json_response(status, error_body(status));
    if status != StatusCode::NOT_FOUND {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

fn error_body(status: StatusCode) -> String {
    serde_json::json!({
        "error": status
            .canonical_reason()
            .unwrap_or("error")
            .to_ascii_lowercase(),
    })
    .to_string()
}

/// Write a complete response on a raw stream and close it.
async fn write_rejection<S>(stream: &mut S, status: StatusCode)
where
    S: AsyncWrite + Unpin,
{
    let body = error_body(status);
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Read and drop what the client already sent, so closing after a
/// rejection does not reset the connection before the response is read.
async fn discard_unread<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    let mut limited = stream.take(DRAIN_LIMIT);
    let drain = tokio::io::copy(&mut limited, &mut sink);
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}
