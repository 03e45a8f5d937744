//! Local tunnel table: bound name to local TCP port

use dashmap::DashMap;

/// Names are stored lowercase, matching what arrives in channel extra data.
pub(crate) struct TunnelTable {
    tunnels: DashMap<String, u16>,
}

impl TunnelTable {
    pub(crate) fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<u16> {
        self.tunnels.get(name).map(|entry| *entry.value())
    }

    pub(crate) fn set(&self, name: &str, port: u16) {
        self.tunnels.insert(name.to_ascii_lowercase(), port);
    }

    pub(crate) fn delete(&self, name: &str) {
        self.tunnels.remove(name);
    }
}
