//! HTTP/1.x request head sniffing.
//!
//! The gateway reads the request head off the raw socket before deciding
//! whether to tunnel it or hand the connection to the HTTP server. The
//! exact bytes are kept so they can be forwarded or replayed unchanged.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::TunnelError;

/// Default limit on the size of a request head.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 4096;

/// A parsed request head and the raw bytes it came from.
#[derive(Debug, Clone)]
pub struct RequestHead {
    raw: Bytes,
    method: String,
    path: String,
    version: u8,
    headers: Vec<(String, Bytes)>,
}

impl RequestHead {
    /// Parse a complete head from the start of `buf`.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, TunnelError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let len = match request.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(TunnelError::MalformedRequest(e.to_string())),
        };

        let method = request.method.unwrap_or_default().to_string();
        let path = request.path.unwrap_or_default().to_string();
        let version = request.version.unwrap_or(1);
        let headers = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    Bytes::copy_from_slice(h.value),
                )
            })
            .collect();

        Ok(Some(Self {
            raw: Bytes::copy_from_slice(&buf[..len]),
            method,
            path,
            version,
            headers,
        }))
    }

    /// Read a request head from `reader`.
    ///
    /// Returns the head and any bytes read past its end.
    pub async fn read_from<R>(reader: &mut R, max_size: usize) -> Result<(Self, Bytes), TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK.min(max_size.max(1)));

        loop {
            if let Some(head) = Self::parse(&buf)? {
                if head.raw.len() > max_size {
                    return Err(TunnelError::HeaderTooLarge(max_size));
                }
                let rest = buf.split_off(head.raw.len()).freeze();
                return Ok((head, rest));
            }

            let remaining = max_size.saturating_sub(buf.len());
            if remaining == 0 {
                return Err(TunnelError::HeaderTooLarge(max_size));
            }

            buf.reserve(READ_CHUNK.min(remaining));
            let read = (&mut *reader)
                .take(remaining as u64)
                .read_buf(&mut buf)
                .await?;
            if read == 0 {
                return Err(if buf.is_empty() {
                    TunnelError::ConnectionClosed
                } else {
                    TunnelError::MalformedRequest("connection closed mid-header".to_string())
                });
            }
        }
    }

    /// The head exactly as received, terminating blank line included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Minor HTTP version (0 or 1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// First value of a header, case-insensitive.
    ///
    /// `None` when the header is absent or its value is not UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// True when the client asks to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|value| !value.trim().is_empty())
    }

    /// Value of a cookie from any `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        find_cookie(
            self.headers
                .iter()
                .filter(|(n, _)| n == "cookie")
                .filter_map(|(_, v)| std::str::from_utf8(v).ok()),
            name,
        )
    }

    /// Bytes to feed back to a consumer that expects to read the request
    /// itself: the head followed by whatever was read past it.
    pub fn replay(&self, rest: &[u8]) -> Bytes {
        if rest.is_empty() {
            return self.raw.clone();
        }
        let mut out = BytesMut::with_capacity(self.raw.len() + rest.len());
        out.extend_from_slice(&self.raw);
        out.extend_from_slice(rest);
        out.freeze()
    }
}

/// Find a cookie value among `Cookie` header values.
pub fn find_cookie<'a, I>(header_values: I, name: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    header_values
        .into_iter()
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}

/// A stream that yields `prefix` before reading from the inner stream.
///
/// Writes go straight to the inner stream.
#[derive(Debug)]
pub struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Unread prefix bytes and the inner stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const UPGRADE: &[u8] = b"GET /socket HTTP/1.1\r\n\
Host: app.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Cookie: theme=dark; _portcullis_session=abcdef; lang=en\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
\r\n";

    #[test]
    fn parses_upgrade_request() {
        let head = RequestHead::parse(UPGRADE).unwrap().unwrap();

        assert_eq!(head.method(), "GET");
        assert_eq!(head.path(), "/socket");
        assert_eq!(head.version(), 1);
        assert!(head.is_upgrade());
        assert_eq!(head.header("UPGRADE"), Some("websocket"));
        assert_eq!(head.cookie("_portcullis_session"), Some("abcdef"));
        assert_eq!(head.cookie("lang"), Some("en"));
        assert_eq!(head.cookie("missing"), None);
        assert_eq!(head.raw(), UPGRADE);
    }

    #[test]
    fn plain_request_is_not_upgrade() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.is_upgrade());

        let blank = RequestHead::parse(b"GET / HTTP/1.1\r\nUpgrade: \r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!blank.is_upgrade());
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nHost:").unwrap().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = RequestHead::parse(b"\x00\x01\x02 nonsense\r\n\r\n").unwrap_err();
        assert!(matches!(err, TunnelError::MalformedRequest(_)));
    }

    #[test]
    fn cookie_from_second_header() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nCookie: a=1\r\nCookie: b=\"2\"\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.cookie("b"), Some("2"));
    }

    #[tokio::test]
    async fn read_from_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut payload = UPGRADE.to_vec();
        payload.extend_from_slice(b"early");
        client.write_all(&payload).await.unwrap();

        let (head, rest) = RequestHead::read_from(&mut server, DEFAULT_MAX_HEADER_SIZE)
            .await
            .unwrap();
        assert_eq!(head.raw(), UPGRADE);
        assert_eq!(&rest[..], b"early");
        assert_eq!(&head.replay(&rest)[..], &payload[..]);
    }

    #[tokio::test]
    async fn read_from_assembles_split_head() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move {
            RequestHead::read_from(&mut server, DEFAULT_MAX_HEADER_SIZE).await
        });

        client.write_all(&UPGRADE[..10]).await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(&UPGRADE[10..]).await.unwrap();

        let (head, rest) = reader.await.unwrap().unwrap();
        assert!(head.is_upgrade());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn read_from_enforces_limit() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nX-Padding: ")
            .await
            .unwrap();
        client.write_all(&[b'a'; 512]).await.unwrap();

        let err = RequestHead::read_from(&mut server, 256).await.unwrap_err();
        assert!(matches!(err, TunnelError::HeaderTooLarge(256)));
    }

    #[tokio::test]
    async fn read_from_rejects_complete_head_over_limit() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let mut head = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        head.resize(3000, b'a');
        head.extend_from_slice(b"\r\n\r\n");
        client.write_all(&head).await.unwrap();

        let err = RequestHead::read_from(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, TunnelError::HeaderTooLarge(1024)));
    }

    #[tokio::test]
    async fn read_from_accepts_head_of_exactly_the_limit() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut head = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        head.resize(1024 - 4, b'a');
        head.extend_from_slice(b"\r\n\r\n");
        client.write_all(&head).await.unwrap();
        client.write_all(b"body").await.unwrap();

        let (parsed, _) = RequestHead::read_from(&mut server, 1024).await.unwrap();
        assert_eq!(parsed.raw().len(), 1024);
    }

    #[tokio::test]
    async fn read_from_reports_closed_connection() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = RequestHead::read_from(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionClosed));
    }

    #[tokio::test]
    async fn prefixed_replays_then_reads_inner() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut stream = Prefixed::new(Bytes::from_static(b"hello"), server);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }
}
