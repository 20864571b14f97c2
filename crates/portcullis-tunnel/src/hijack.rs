//! Connection takeover.
//!
//! Only transports that hand out their raw byte stream can be tunneled.
//! Taking over consumes the connection, so it happens at most once.

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TunnelError;

/// A client connection that may surrender its underlying stream.
pub trait Hijack: Send {
    /// The raw stream handed over on success.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Take ownership of the raw stream.
    fn hijack(self) -> impl Future<Output = Result<Self::Io, TunnelError>> + Send;
}

/// A connection accepted directly from a listener; always hands over.
#[derive(Debug)]
pub struct RawConnection<S> {
    stream: S,
    peer: Option<SocketAddr>,
}

impl<S> RawConnection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, peer: None }
    }

    /// Attach the remote address for logging.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl<S> Hijack for RawConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = S;

    async fn hijack(self) -> Result<S, TunnelError> {
        if let Some(peer) = self.peer {
            tracing::debug!(peer = %peer, "Client connection taken over");
        }
        Ok(self.stream)
    }
}

/// A connection whose lifecycle belongs to the HTTP server.
///
/// Requests served through hyper's connection driver land here; the
/// stream is not ours to take.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManagedConnection {
    peer: Option<SocketAddr>,
}

impl ManagedConnection {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self { peer }
    }
}

impl Hijack for ManagedConnection {
    type Io = tokio::net::TcpStream;

    async fn hijack(self) -> Result<Self::Io, TunnelError> {
        tracing::debug!(
            peer = ?self.peer,
            "Refusing takeover of a server-managed connection"
        );
        Err(TunnelError::HijackUnsupported)
    }
}
