//! Bidirectional relay between a taken-over client and the upstream.

use portcullis_telemetry::{log_tunnel_closed, log_tunnel_failed, log_tunnel_opened};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::dial::{UpstreamConnector, UpstreamTlsOptions};
use crate::error::TunnelError;
use crate::hijack::Hijack;

/// Bytes relayed in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Bytes copied from the client to the upstream, handshake excluded.
    pub client_to_upstream: u64,
    /// Bytes copied from the upstream to the client.
    pub upstream_to_client: u64,
}

/// Take over `connection`, dial the upstream, forward `handshake` verbatim
/// and relay bytes both ways until both directions finish or one fails.
///
/// Both connections are shut down before returning, on every path.
pub async fn tunnel<C: Hijack>(
    connection: C,
    handshake: &[u8],
    connector: &UpstreamConnector,
) -> Result<TunnelStats, TunnelError> {
    let tunnel_id = Uuid::new_v4();

    let mut client = connection.hijack().await?;

    let mut upstream = match connector.dial().await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = client.shutdown().await;
            log_tunnel_failed!(
                tunnel_id = %tunnel_id,
                upstream = %connector.address(),
                error = %e,
                "Failed to reach upstream"
            );
            return Err(e);
        }
    };

    log_tunnel_opened!(
        tunnel_id = %tunnel_id,
        upstream = %connector.address(),
        tls = connector.is_tls(),
        "Upgrade tunnel established"
    );

    let result = relay(&mut client, &mut upstream, handshake).await;

    let _ = upstream.shutdown().await;
    let _ = client.shutdown().await;

    match &result {
        Ok(stats) => log_tunnel_closed!(
            tunnel_id = %tunnel_id,
            client_to_upstream = stats.client_to_upstream,
            upstream_to_client = stats.upstream_to_client,
            "Upgrade tunnel closed"
        ),
        Err(e) => log_tunnel_failed!(
            tunnel_id = %tunnel_id,
            upstream = %connector.address(),
            error = %e,
            "Upgrade tunnel broke"
        ),
    }

    result
}

/// [`tunnel`] to an upstream URL with default TLS options.
pub async fn tunnel_to_url<C: Hijack>(
    connection: C,
    handshake: &[u8],
    upstream_url: &str,
) -> Result<TunnelStats, TunnelError> {
    let connector = UpstreamConnector::new(upstream_url, &UpstreamTlsOptions::default())?;
    tunnel(connection, handshake, &connector).await
}

async fn relay<A, B>(client: &mut A, upstream: &mut B, handshake: &[u8]) -> Result<TunnelStats, TunnelError>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    upstream.write_all(handshake).await?;
    upstream.flush().await?;

    let (client_to_upstream, upstream_to_client) =
        tokio::io::copy_bidirectional(client, upstream).await?;

    Ok(TunnelStats {
        client_to_upstream,
        upstream_to_client,
    })
}
