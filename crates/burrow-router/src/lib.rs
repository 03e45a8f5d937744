//! Core routing pieces shared by the edge and the local client
//!
//! Holds the tunnel registry keyed by name, the Host-header peek used by the
//! HTTP ingress, and the full-duplex splice both sides relay bytes with.

pub mod host;
pub mod registry;
pub mod relay;

pub use host::{peek_host, tunnel_label, PeekError, PeekedStream, MAX_HEADER_LINE};
pub use registry::{Binding, ConnId, TunnelRegistry};
pub use relay::splice;
