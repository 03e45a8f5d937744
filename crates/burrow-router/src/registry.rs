//! Tunnel registry mapping names to live control connections
//!
//! Names are stored lowercase; callers on the lookup path pass names they
//! have already normalized (the HTTP router lowercases the label it
//! extracts), so `get` stays a plain map read.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

/// Identifier of one control connection, unique for the life of the edge.
pub type ConnId = u64;

/// A registry entry: the connection that bound the name.
#[derive(Debug, Clone)]
pub struct Binding<C> {
    pub owner: ConnId,
    pub conn: C,
}

/// Live tunnel-name registry.
///
/// All operations are total. Concurrent readers on the ingress path share
/// the map with the infrequent bind/teardown writers.
pub struct TunnelRegistry<C> {
    tunnels: DashMap<String, Binding<C>>,
}

impl<C: Clone> TunnelRegistry<C> {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Look up a tunnel by its (lowercase) name. Non-blocking, no mutation.
    pub fn get(&self, name: &str) -> Option<Binding<C>> {
        self.tunnels.get(name).map(|entry| entry.value().clone())
    }

    /// Insert a tunnel if the name is free. Returns `false` when the name is
    /// already bound; the existing entry is left untouched.
    pub fn set(&self, name: &str, owner: ConnId, conn: C) -> bool {
        let name = name.to_ascii_lowercase();
        match self.tunnels.entry(name) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                info!(name = %entry.key(), conn = owner, "tunnel registered");
                entry.insert(Binding { owner, conn });
                true
            }
        }
    }

    /// Remove a tunnel by name. Idempotent.
    pub fn delete(&self, name: &str) {
        if let Some((name, binding)) = self.tunnels.remove(name) {
            info!(%name, conn = binding.owner, "tunnel removed");
        }
    }

    /// Remove every tunnel bound through `owner`. Called once per control
    /// connection when it tears down.
    pub fn purge(&self, owner: ConnId) {
        self.tunnels.retain(|name, binding| {
            if binding.owner == owner {
                debug!(%name, conn = owner, "tunnel purged with its connection");
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl<C: Clone> Default for TunnelRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
