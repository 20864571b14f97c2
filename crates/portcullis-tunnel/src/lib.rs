//! Upgrade tunneling for the Portcullis proxy.
//!
//! Once a request asking to switch protocols has been authorized, the
//! client connection is taken over ([`Hijack`]), a fresh upstream
//! connection is dialed ([`UpstreamConnector`]), the original request head
//! is forwarded unchanged and bytes are relayed both ways ([`tunnel`]).

pub mod dial;
pub mod error;
pub mod handshake;
pub mod hijack;
pub mod relay;

pub use dial::{dial_address, UpstreamConnector, UpstreamStream, UpstreamTlsOptions};
pub use error::TunnelError;
pub use handshake::{find_cookie, Prefixed, RequestHead, DEFAULT_MAX_HEADER_SIZE};
pub use hijack::{Hijack, ManagedConnection, RawConnection};
pub use relay::{tunnel, tunnel_to_url, TunnelStats};
