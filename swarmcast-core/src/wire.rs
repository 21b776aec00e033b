//! Wire codec: discovery packet layout and transfer protocol framing.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Flags byte for a standard announce packet.
pub const FLAG_ANNOUNCE: u8 = 0x01;

/// Fixed header: flags(1) + ttl(1) + port(2) + origin IPv4(4).
pub const DISCOVERY_HEADER_LEN: usize = 8;

/// Transfer protocol command bytes.
pub const CMD_GET_FILE_LIST: u8 = 0x01;
pub const CMD_GET_CHUNK: u8 = 0x02;
pub const CMD_RELAY_REQUEST: u8 = 0x03;

/// Relay handshake status bytes.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_FAIL: u8 = 0xFF;

/// UDP discovery payload. Layout:
/// `[flags(1)] [ttl(1)] [command port(2, BE)] [origin IPv4(4)] [peer id, UTF-8, rest]`.
/// The origin address is carried in the payload so a receiver can tell a
/// packet sent by its origin apart from one forwarded by a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub flags: u8,
    pub ttl: u8,
    pub command_port: u16,
    pub origin: Ipv4Addr,
    pub peer_id: String,
}

impl DiscoveryPacket {
    pub fn announce(ttl: u8, command_port: u16, origin: Ipv4Addr, peer_id: &str) -> Self {
        Self {
            flags: FLAG_ANNOUNCE,
            ttl,
            command_port,
            origin,
            peer_id: peer_id.to_owned(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let id = self.peer_id.as_bytes();
        let mut out = Vec::with_capacity(DISCOVERY_HEADER_LEN + id.len());
        out.push(self.flags);
        out.push(self.ttl);
        out.extend_from_slice(&self.command_port.to_be_bytes());
        out.extend_from_slice(&self.origin.octets());
        out.extend_from_slice(id);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketDecodeError> {
        if bytes.len() < DISCOVERY_HEADER_LEN {
            return Err(PacketDecodeError::Truncated);
        }
        let command_port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let origin = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
        let peer_id = std::str::from_utf8(&bytes[DISCOVERY_HEADER_LEN..])
            .map_err(|_| PacketDecodeError::BadPeerId)?
            .to_owned();
        Ok(Self {
            flags: bytes[0],
            ttl: bytes[1],
            command_port,
            origin,
            peer_id,
        })
    }
}

/// Error decoding a discovery packet. Receivers drop these silently.
#[derive(Debug, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("packet shorter than {DISCOVERY_HEADER_LEN} bytes")]
    Truncated,
    #[error("peer id is not valid UTF-8")]
    BadPeerId,
}

/// Write a length-prefixed UTF-8 string (u16 BE length + bytes).
pub async fn write_utf<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> std::io::Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "string too long for u16 prefix",
        ));
    }
    w.write_u16(bytes.len() as u16).await?;
    w.write_all(bytes).await
}

/// Read a length-prefixed UTF-8 string (u16 BE length + bytes).
pub async fn read_utf<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DiscoveryPacket {
        DiscoveryPacket::announce(3, 6234, Ipv4Addr::new(192, 168, 1, 10), "Peer-a1b2c3d4")
    }

    #[test]
    fn roundtrip_announce() {
        let pkt = sample();
        let bytes = pkt.encode();
        let decoded = DiscoveryPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn roundtrip_empty_peer_id() {
        let pkt = DiscoveryPacket::announce(0, 1, Ipv4Addr::new(10, 0, 0, 1), "");
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), DISCOVERY_HEADER_LEN);
        assert_eq!(DiscoveryPacket::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn short_packet_rejected() {
        for n in 0..DISCOVERY_HEADER_LEN {
            let bytes = vec![0u8; n];
            assert!(matches!(
                DiscoveryPacket::decode(&bytes),
                Err(PacketDecodeError::Truncated)
            ));
        }
    }

    #[test]
    fn bad_utf8_peer_id_rejected() {
        let mut bytes = sample().encode();
        bytes.truncate(DISCOVERY_HEADER_LEN);
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            DiscoveryPacket::decode(&bytes),
            Err(PacketDecodeError::BadPeerId)
        ));
    }

    #[test]
    fn port_is_big_endian() {
        let pkt = DiscoveryPacket::announce(1, 0x1234, Ipv4Addr::new(1, 2, 3, 4), "x");
        let bytes = pkt.encode();
        assert_eq!(bytes[2], 0x12);
        assert_eq!(bytes[3], 0x34);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn utf_string_roundtrip() {
        let mut buf = Vec::new();
        write_utf(&mut buf, "x.mp4").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_utf(&mut cursor).await.unwrap(), "x.mp4");
    }

    #[tokio::test]
    async fn utf_string_rejects_bad_bytes() {
        let mut buf = vec![0u8, 2, 0xFF, 0xFE];
        let mut cursor = std::io::Cursor::new(&mut buf);
        assert!(read_utf(&mut cursor).await.is_err());
    }
}
