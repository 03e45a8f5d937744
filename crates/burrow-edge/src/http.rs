//! HTTP ingress: Host-based routing onto tunnel stream channels
//!
//! No HTTP processing happens beyond locating the Host header. The peeked
//! bytes are replayed in front of the rest of the stream, so the local side
//! sees the request byte-identical from the request line on.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use burrow_router::{peek_host, splice, tunnel_label, TunnelRegistry};

use crate::ssh::ControlConn;

/// Serve one inbound HTTP connection: peek the Host header, resolve the
/// tunnel, open a stream channel on its control connection, relay.
///
/// Failures drop the connection without writing a response; the router
/// never retries.
pub(crate) async fn handle_outbound(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<TunnelRegistry<ControlConn>>,
    http_port: u16,
) {
    let (host, peeked) = match peek_host(stream).await {
        Ok(peeked) => peeked,
        Err(error) => {
            debug!(%peer, %error, "dropping connection without usable host header");
            return;
        }
    };

    let name = tunnel_label(&host);
    let Some(binding) = registry.get(&name) else {
        info!(%name, %host, %peer, "no tunnel bound for host");
        return;
    };

    let channel = match binding
        .conn
        .handle
        .channel_open_forwarded_tcpip(
            name.clone(),
            u32::from(http_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(error) => {
            warn!(%name, conn = binding.conn.id, %error, "failed to open tunnel channel");
            return;
        }
    };

    debug!(%name, conn = binding.conn.id, %peer, "relaying request over tunnel channel");
    splice(peeked, channel.into_stream()).await;
    debug!(%name, %peer, "request relay finished");
}
