//! Peer registry: concurrent peer table with the direct-over-relay merge rule.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use parking_lot::RwLock;

/// Generate a fresh peer identity for this process instance.
pub fn generate_peer_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("Peer-{}", &uuid[..8])
}

/// A known peer. `relay` set means direct delivery to `address:command_port`
/// was not observed; the peer must be reached through that intermediary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub address: Ipv4Addr,
    pub command_port: u16,
    pub relay: Option<Ipv4Addr>,
}

impl PeerRecord {
    pub fn direct(id: impl Into<String>, address: Ipv4Addr, command_port: u16) -> Self {
        Self {
            id: id.into(),
            address,
            command_port,
            relay: None,
        }
    }

    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::from((self.address, self.command_port))
    }

    pub fn is_direct(&self) -> bool {
        self.relay.is_none()
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.address, self.command_port)?;
        if let Some(relay) = self.relay {
            write!(f, " (via {relay})")?;
        }
        Ok(())
    }
}

/// Concurrent map of peer id to record. Safe under unbounded concurrent
/// callers; the discovery listener writes, everything else reads.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. Returns true when the peer was not known
    /// before. A peer last seen as directly reachable is never downgraded
    /// to relayed: such an update is rejected and the registry is left
    /// unchanged.
    pub fn upsert(&self, record: PeerRecord) -> bool {
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(&record.id) {
            if existing.relay.is_none() && record.relay.is_some() {
                return false;
            }
        }
        peers.insert(record.id.clone(), record).is_none()
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.peers.read().get(id).cloned()
    }

    /// Find a peer by its network address. Used to resolve a relay address
    /// to the relay's own command port.
    pub fn get_by_address(&self, address: Ipv4Addr) -> Option<PeerRecord> {
        self.peers
            .read()
            .values()
            .find(|p| p.address == address)
            .cloned()
    }

    pub fn all(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn remove(&self, id: &str) -> Option<PeerRecord> {
        self.peers.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
