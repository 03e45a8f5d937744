//! Local client: control connection, bind API, tunnel channel dispatch
//!
//! A `Local` dials the edge over SSH, binds tunnel names with
//! `tcpip-forward` requests, and services the `forwarded-tcpip` channels the
//! edge opens back by dialing the configured local port and relaying bytes.

use std::sync::Arc;

use russh::client::{self, Msg, Session};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_router::splice;

mod table;

use table::TunnelTable;

/// Username presented on the control connection. The edge authenticates the
/// key, not the user.
const CONTROL_USER: &str = "tunnel";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] russh::Error),

    #[error("edge rejected public key authentication")]
    AuthRejected,

    #[error("tunnel name must not be empty")]
    EmptyTunnelName,

    #[error("bind refused for tunnel {name}: {source}")]
    BindRefused {
        name: String,
        source: russh::Error,
    },

    #[error("no bound tunnel named {0}")]
    UnknownTunnel(String),
}

/// The local end of a control connection.
pub struct Local {
    handle: client::Handle<TunnelHandler>,
    table: Arc<TunnelTable>,
    closed: CancellationToken,
}

impl Local {
    /// Dial the edge and authenticate. The edge's host key must equal
    /// `host_key` byte for byte; `key` is the local's identity.
    pub async fn open(
        addr: impl ToSocketAddrs + Send,
        host_key: PublicKey,
        key: PrivateKey,
    ) -> Result<Local, ClientError> {
        let config = Arc::new(client::Config::default());
        let table = Arc::new(TunnelTable::new());
        let closed = CancellationToken::new();
        let handler = TunnelHandler {
            host_key: Arc::new(host_key),
            table: Arc::clone(&table),
            closed: closed.clone(),
        };

        let mut handle = client::connect(config, addr, handler).await?;
        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(
                CONTROL_USER,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?;
        if !auth.success() {
            return Err(ClientError::AuthRejected);
        }

        info!("control connection established");
        Ok(Local {
            handle,
            table,
            closed,
        })
    }

    /// Bind `name` to a local TCP port. On a positive reply the name starts
    /// routing; on refusal or transport error nothing changes locally.
    pub async fn bind(&mut self, name: &str, port: u16) -> Result<(), ClientError> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(ClientError::EmptyTunnelName);
        }

        self.handle
            .tcpip_forward(name.clone(), u32::from(port))
            .await
            .map(|_| ())
            .map_err(|source| ClientError::BindRefused {
                name: name.clone(),
                source,
            })?;

        self.table.set(&name, port);
        info!(%name, port, "tunnel bound");
        Ok(())
    }

    /// Release a bound name. Channels already relaying are unaffected.
    pub async fn unbind(&mut self, name: &str) -> Result<(), ClientError> {
        let name = name.trim().to_ascii_lowercase();
        let port = self
            .table
            .get(&name)
            .ok_or_else(|| ClientError::UnknownTunnel(name.clone()))?;

        self.handle
            .cancel_tcpip_forward(name.clone(), u32::from(port))
            .await?;
        self.table.delete(&name);
        info!(%name, "tunnel unbound");
        Ok(())
    }

    /// Terminate the control connection.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "".into(), "English".into())
            .await?;
        Ok(())
    }

    /// Wait until the control connection has terminated, for any reason.
    pub async fn wait(&self) {
        self.closed.cancelled().await;
    }
}

struct TunnelHandler {
    host_key: Arc<PublicKey>,
    table: Arc<TunnelTable>,
    closed: CancellationToken,
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        // The handler lives inside the connection task; its drop is the
        // connection's end.
        self.closed.cancel();
    }
}

impl client::Handler for TunnelHandler {
    type Error = ClientError;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        if server_key.key_data() == self.host_key.key_data() {
            return Ok(true);
        }
        warn!("edge host key does not match the configured key");
        Ok(false)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let name = connected_address.to_ascii_lowercase();
        let origin = format!("{originator_address}:{originator_port}");
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            match table.get(&name) {
                Some(port) => serve_tunnel(channel, &name, port, &origin).await,
                None => {
                    warn!(%name, %origin, "rejecting tunnel channel for unbound name");
                    let _ = channel.close().await;
                }
            }
        });
        Ok(())
    }
}

/// Serve one tunnel channel: dial the local service, relay, close.
async fn serve_tunnel(channel: Channel<Msg>, name: &str, port: u16, origin: &str) {
    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%name, port, %error, "local dial failed, dropping tunnel channel");
            let _ = channel.close().await;
            return;
        }
    };

    debug!(%name, port, %origin, "tunnel channel relaying");
    splice(channel.into_stream(), stream).await;
    debug!(%name, port, "tunnel channel finished");
}
