//! Edge server: SSH control plane plus plain-HTTP ingress
//!
//! The edge runs two listeners. The inbound (SSH) listener authenticates
//! locals by a single configured public key and serves their bind requests;
//! the outbound (HTTP) listener routes connections by Host header onto
//! stream channels multiplexed inside those control connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use burrow_router::TunnelRegistry;

mod http;
mod ssh;

use ssh::{ControlConn, ControlHandler};

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("ssh transport error: {0}")]
    Ssh(#[from] russh::Error),
}

#[derive(Debug)]
pub struct EdgeConfig {
    /// Control (SSH) listener address.
    pub ssh_addr: SocketAddr,
    /// Public HTTP ingress address.
    pub http_addr: SocketAddr,
    /// The edge's signing key, presented as SSH host key.
    pub host_key: PrivateKey,
    /// The only public key allowed to open control connections.
    pub client_key: PublicKey,
}

pub struct EdgeServer {
    ssh_listener: TcpListener,
    http_listener: TcpListener,
    ssh_addr: SocketAddr,
    http_addr: SocketAddr,
    ssh_config: Arc<russh::server::Config>,
    client_key: Arc<PublicKey>,
    registry: Arc<TunnelRegistry<ControlConn>>,
    next_conn: AtomicU64,
}

impl EdgeServer {
    /// Bind both listeners. The actual addresses are observable afterwards,
    /// so callers may ask for port 0.
    pub async fn bind(config: EdgeConfig) -> Result<Self, EdgeError> {
        let ssh_listener =
            TcpListener::bind(config.ssh_addr)
                .await
                .map_err(|source| EdgeError::Bind {
                    addr: config.ssh_addr,
                    source,
                })?;
        let http_listener =
            TcpListener::bind(config.http_addr)
                .await
                .map_err(|source| EdgeError::Bind {
                    addr: config.http_addr,
                    source,
                })?;
        let ssh_addr = ssh_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let ssh_config = Arc::new(russh::server::Config {
            keys: vec![config.host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        Ok(Self {
            ssh_listener,
            http_listener,
            ssh_addr,
            http_addr,
            ssh_config,
            client_key: Arc::new(config.client_key),
            registry: Arc::new(TunnelRegistry::new()),
            next_conn: AtomicU64::new(0),
        })
    }

    pub fn ssh_addr(&self) -> SocketAddr {
        self.ssh_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Drive both accept loops. Per-client errors are logged and never
    /// terminate the loops, so this only returns if the task is dropped.
    pub async fn run(self) {
        info!(ssh = %self.ssh_addr, http = %self.http_addr, "edge running");
        tokio::join!(self.run_inbound(), self.run_outbound());
    }

    async fn run_inbound(&self) {
        loop {
            let (stream, peer) = match self.ssh_listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "control listener accept failed");
                    continue;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                debug!(%peer, %error, "failed to set nodelay");
            }

            let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, conn = id, "control connection accepted");
            let handler = ControlHandler::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.client_key),
                id,
                peer,
            );
            let config = Arc::clone(&self.ssh_config);
            tokio::spawn(async move {
                let session = match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => session,
                    Err(error) => {
                        debug!(%peer, conn = id, %error, "control handshake failed");
                        return;
                    }
                };
                if let Err(error) = session.await {
                    debug!(%peer, conn = id, %error, "control connection closed with error");
                }
            });
        }
    }

    async fn run_outbound(&self) {
        let http_port = self.http_addr.port();
        loop {
            let (stream, peer) = match self.http_listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "http listener accept failed");
                    continue;
                }
            };

            let registry = Arc::clone(&self.registry);
            tokio::spawn(http::handle_outbound(stream, peer, registry, http_port));
        }
    }
}
