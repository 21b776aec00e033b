//! Broadcast discovery: periodic per-interface announcements, hop-limited
//! flood forwarding, relay detection feeding the peer registry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{PeerRecord, PeerRegistry};
use crate::wire::DiscoveryPacket;

/// Well-known UDP port all peers announce on.
pub const DISCOVERY_PORT: u16 = 50000;

/// Hop budget for a fresh announcement.
pub const INITIAL_TTL: u8 = 3;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const RECV_BUF_LEN: usize = 1024;

/// An IPv4 interface address eligible for broadcast announcements.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastTarget {
    pub local: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

/// Enumerate up, non-loopback IPv4 interfaces that carry a broadcast
/// address. Each target gets its own announcement because each carries a
/// different true origin address.
pub fn broadcast_targets() -> Vec<BroadcastTarget> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => v4.broadcast.map(|broadcast| BroadcastTarget {
                local: v4.ip,
                broadcast,
            }),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect()
}

fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect()
}

/// Apply the listener rules to one received datagram: parse, drop
/// self-announcements and locally originated packets, detect relaying,
/// record the peer, and hand back the payload to re-flood (TTL already
/// decremented on a copy) when the hop budget allows.
pub fn handle_packet(
    registry: &PeerRegistry,
    self_id: &str,
    data: &[u8],
    sender: Ipv4Addr,
    local_addrs: &[Ipv4Addr],
) -> Option<Vec<u8>> {
    let packet = DiscoveryPacket::decode(data).ok()?;
    if packet.peer_id == self_id {
        return None;
    }
    // A node must not treat its own forwarded flood packet as a discovery.
    if sender.is_loopback() || sender.is_unspecified() || local_addrs.contains(&sender) {
        return None;
    }
    let relay = (sender != packet.origin).then_some(sender);
    let record = PeerRecord {
        id: packet.peer_id.clone(),
        address: packet.origin,
        command_port: packet.command_port,
        relay,
    };
    if registry.upsert(record.clone()) {
        info!(peer = %record, "discovered peer");
    }
    if packet.ttl > 0 {
        // Forward unchanged except the TTL byte, on a copy of the receive
        // buffer so the original bytes are never mutated in place.
        let mut forward = data.to_vec();
        forward[1] = packet.ttl - 1;
        Some(forward)
    } else {
        None
    }
}

/// UDP discovery engine: `start` launches the announcer and listener tasks,
/// `stop` aborts them and releases the socket. Both are idempotent.
pub struct DiscoveryService {
    peer_id: String,
    command_port: u16,
    discovery_port: u16,
    registry: Arc<PeerRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(peer_id: String, command_port: u16, registry: Arc<PeerRegistry>) -> Self {
        Self::with_port(peer_id, command_port, DISCOVERY_PORT, registry)
    }

    /// Use a non-default discovery port (tests run several engines side by side).
    pub fn with_port(
        peer_id: String,
        command_port: u16,
        discovery_port: u16,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            peer_id,
            command_port,
            discovery_port,
            registry,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the listener socket and launch both activities. A second call
    /// while running is a no-op. Failing to bind is fatal to discovery and
    /// surfaced to the caller; nothing is retried.
    pub async fn start(&self) -> std::io::Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        let listen_socket = bind_reuse(self.discovery_port)?;
        listen_socket.set_broadcast(true)?;
        info!(id = %self.peer_id, port = self.discovery_port, "discovery started");

        let announce = AnnounceLoop {
            peer_id: self.peer_id.clone(),
            command_port: self.command_port,
            discovery_port: self.discovery_port,
        };
        tasks.push(tokio::spawn(announce.run()));

        let listen = ListenLoop {
            socket: listen_socket,
            self_id: self.peer_id.clone(),
            discovery_port: self.discovery_port,
            registry: self.registry.clone(),
        };
        tasks.push(tokio::spawn(listen.run()));
        Ok(())
    }

    /// Abort both activities. In-flight sends and receives are abandoned,
    /// not drained; subsequent packets are not processed.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

struct AnnounceLoop {
    peer_id: String,
    command_port: u16,
    discovery_port: u16,
}

impl AnnounceLoop {
    async fn run(self) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "announcer socket unavailable");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!(error = %e, "cannot enable broadcast");
            return;
        }
        loop {
            for target in broadcast_targets() {
                let packet = DiscoveryPacket::announce(
                    INITIAL_TTL,
                    self.command_port,
                    target.local,
                    &self.peer_id,
                );
                let dest = SocketAddr::from((target.broadcast, self.discovery_port));
                if let Err(e) = socket.send_to(&packet.encode(), dest).await {
                    debug!(dest = %dest, error = %e, "announce send failed");
                }
            }
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }
}

struct ListenLoop {
    socket: UdpSocket,
    self_id: String,
    discovery_port: u16,
    registry: Arc<PeerRegistry>,
}

impl ListenLoop {
    async fn run(self) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "discovery receive failed");
                    return;
                }
            };
            let IpAddr::V4(sender) = from.ip() else {
                continue;
            };
            let local = local_ipv4_addrs();
            if let Some(forward) =
                handle_packet(&self.registry, &self.self_id, &buf[..n], sender, &local)
            {
                for target in broadcast_targets() {
                    let dest = SocketAddr::from((target.broadcast, self.discovery_port));
                    if let Err(e) = self.socket.send_to(&forward, dest).await {
                        debug!(dest = %dest, error = %e, "flood forward failed");
                    }
                }
            }
        }
    }
}

/// Bind a UDP socket on the discovery port with `SO_REUSEADDR`, so a
/// restarting peer does not trip over the old socket in TIME_WAIT.
fn bind_reuse(port: u16) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FLAG_ANNOUNCE;

    const SELF_ID: &str = "Peer-self0000";

    fn announce_from(id: &str, ttl: u8, origin: Ipv4Addr) -> Vec<u8> {
        DiscoveryPacket::announce(ttl, 6100, origin, id).encode()
    }

    #[test]
    fn direct_sender_has_no_relay() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(192, 168, 1, 20);
        handle_packet(&reg, SELF_ID, &announce_from("Peer-a", 3, origin), origin, &[]);
        let peer = reg.get("Peer-a").unwrap();
        assert!(peer.is_direct());
        assert_eq!(peer.address, origin);
        assert_eq!(peer.command_port, 6100);
    }

    #[test]
    fn mismatched_sender_marks_relay() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(10, 0, 0, 5);
        let relay = Ipv4Addr::new(192, 168, 1, 9);
        handle_packet(&reg, SELF_ID, &announce_from("Peer-a", 3, origin), relay, &[]);
        let peer = reg.get("Peer-a").unwrap();
        assert_eq!(peer.relay, Some(relay));
        assert_eq!(peer.address, origin);
    }

    #[test]
    fn ttl_decremented_on_forward() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(10, 0, 0, 5);
        let data = announce_from("Peer-a", 2, origin);
        let forward = handle_packet(&reg, SELF_ID, &data, origin, &[]).unwrap();
        let pkt = DiscoveryPacket::decode(&forward).unwrap();
        assert_eq!(pkt.ttl, 1);
        assert_eq!(pkt.flags, FLAG_ANNOUNCE);
        assert_eq!(pkt.peer_id, "Peer-a");
        // Original bytes untouched.
        assert_eq!(data[1], 2);
    }

    #[test]
    fn exhausted_ttl_not_forwarded() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(10, 0, 0, 5);
        let forward = handle_packet(&reg, SELF_ID, &announce_from("Peer-a", 0, origin), origin, &[]);
        assert!(forward.is_none());
        // The peer is still recorded even when the flood stops here.
        assert!(reg.get("Peer-a").is_some());
    }

    #[test]
    fn own_announcement_ignored() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(10, 0, 0, 5);
        let forward = handle_packet(&reg, SELF_ID, &announce_from(SELF_ID, 3, origin), origin, &[]);
        assert!(forward.is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn locally_sent_packet_ignored() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(10, 0, 0, 5);
        let local = Ipv4Addr::new(192, 168, 1, 2);
        let data = announce_from("Peer-a", 3, origin);
        assert!(handle_packet(&reg, SELF_ID, &data, local, &[local]).is_none());
        assert!(handle_packet(&reg, SELF_ID, &data, Ipv4Addr::LOCALHOST, &[]).is_none());
        assert!(handle_packet(&reg, SELF_ID, &data, Ipv4Addr::UNSPECIFIED, &[]).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn malformed_packet_dropped() {
        let reg = PeerRegistry::new();
        let sender = Ipv4Addr::new(10, 0, 0, 5);
        assert!(handle_packet(&reg, SELF_ID, &[0x01, 0x03], sender, &[]).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn direct_discovery_survives_relayed_duplicate() {
        let reg = PeerRegistry::new();
        let origin = Ipv4Addr::new(10, 0, 0, 5);
        let relay = Ipv4Addr::new(10, 0, 0, 9);
        let data = announce_from("Peer-a", 3, origin);
        handle_packet(&reg, SELF_ID, &data, origin, &[]);
        // The same announcement arriving again through a relay must not
        // downgrade the direct record.
        handle_packet(&reg, SELF_ID, &data, relay, &[]);
        assert!(reg.get("Peer-a").unwrap().is_direct());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears() {
        let reg = Arc::new(PeerRegistry::new());
        // High throwaway port so parallel test runs do not collide.
        let svc = DiscoveryService::with_port(SELF_ID.into(), 6100, 58431, reg);
        svc.start().await.unwrap();
        svc.start().await.unwrap();
        assert_eq!(svc.tasks.lock().await.len(), 2);
        svc.stop().await;
        assert!(svc.tasks.lock().await.is_empty());
        // Restart after stop works.
        svc.start().await.unwrap();
        svc.stop().await;
    }
}
