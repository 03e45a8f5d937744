//! SSH control plane: authentication, bind handling, diagnostic shell
//!
//! Each control connection gets one `ControlHandler`. Binds arrive as
//! `tcpip-forward` global requests whose address field carries the tunnel
//! name; the registry entry holds a session handle the HTTP ingress uses to
//! open `forwarded-tcpip` channels back through the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::ssh_key::{Fingerprint, HashAlg};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tracing::{debug, info, warn};

use burrow_router::{ConnId, TunnelRegistry};

use crate::EdgeError;

const PROMPT: &[u8] = b"> ";

/// What the registry stores per bound name: enough to open stream channels
/// through the owning control connection.
#[derive(Clone)]
pub(crate) struct ControlConn {
    pub(crate) id: ConnId,
    pub(crate) handle: Handle,
}

pub(crate) struct ControlHandler {
    registry: Arc<TunnelRegistry<ControlConn>>,
    client_key: Arc<PublicKey>,
    id: ConnId,
    peer: SocketAddr,
    fingerprint: Option<Fingerprint>,
    /// Names this connection successfully bound. Refused binds are never
    /// tracked, so teardown cannot delete another connection's entry.
    owned: Vec<String>,
    /// Line buffers of the diagnostic shells, by session channel.
    shells: HashMap<ChannelId, Vec<u8>>,
}

impl ControlHandler {
    pub(crate) fn new(
        registry: Arc<TunnelRegistry<ControlConn>>,
        client_key: Arc<PublicKey>,
        id: ConnId,
        peer: SocketAddr,
    ) -> Self {
        Self {
            registry,
            client_key,
            id,
            peer,
            fingerprint: None,
            owned: Vec::new(),
            shells: HashMap::new(),
        }
    }
}

impl Drop for ControlHandler {
    fn drop(&mut self) {
        debug!(
            peer = %self.peer,
            conn = self.id,
            fingerprint = ?self.fingerprint,
            "control connection torn down"
        );
        if !self.owned.is_empty() {
            info!(
                conn = self.id,
                tunnels = self.owned.len(),
                "releasing tunnels with their connection"
            );
        }
        self.registry.purge(self.id);
    }
}

impl russh::server::Handler for ControlHandler {
    type Error = EdgeError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if key.key_data() != self.client_key.key_data() {
            warn!(peer = %self.peer, user, "rejecting unknown public key");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }

        let fingerprint = key.fingerprint(HashAlg::Sha256);
        info!(peer = %self.peer, conn = self.id, %fingerprint, "control connection authenticated");
        self.fingerprint = Some(fingerprint);
        Ok(Auth::Accept)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let name = address.trim().to_ascii_lowercase();
        if name.is_empty() {
            warn!(peer = %self.peer, conn = self.id, "refusing bind with empty tunnel name");
            return Ok(false);
        }

        let conn = ControlConn {
            id: self.id,
            handle: session.handle(),
        };
        if !self.registry.set(&name, self.id, conn) {
            warn!(%name, peer = %self.peer, conn = self.id, "refusing bind, name already taken");
            return Ok(false);
        }

        debug!(%name, port = *port, conn = self.id, "bind accepted");
        self.owned.push(name);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let name = address.trim().to_ascii_lowercase();
        let Some(index) = self.owned.iter().position(|owned| *owned == name) else {
            warn!(%name, conn = self.id, "refusing unbind of a name this connection does not own");
            return Ok(false);
        };

        self.owned.swap_remove(index);
        self.registry.delete(&name);
        debug!(%name, conn = self.id, "unbind accepted");
        Ok(true)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(conn = self.id, channel = %channel.id(), "diagnostic session opened");
        self.shells.insert(channel.id(), Vec::new());
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.shells.contains_key(&channel) {
            session.channel_success(channel)?;
            session.data(channel, CryptoVec::from_slice(PROMPT))?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    /// Line echo for the diagnostic shell. Data on channels that are not
    /// shells (stream channels opened by the ingress) is not ours to touch.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(mut line) = self.shells.remove(&channel) else {
            return Ok(());
        };

        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    let mut echo = Vec::with_capacity(line.len() + PROMPT.len() + 4);
                    echo.extend_from_slice(b"\r\n");
                    echo.extend_from_slice(&line);
                    echo.extend_from_slice(b"\r\n");
                    echo.extend_from_slice(PROMPT);
                    line.clear();
                    session.data(channel, CryptoVec::from_slice(&echo))?;
                }
                // ^C / ^D end the session.
                0x03 | 0x04 => {
                    session.close(channel)?;
                    return Ok(());
                }
                _ => {
                    line.push(byte);
                    session.data(channel, CryptoVec::from_slice(&[byte]))?;
                }
            }
        }

        self.shells.insert(channel, line);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shells.remove(&channel);
        Ok(())
    }
}
