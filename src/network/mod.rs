//! Cluster Transport
//!
//! TCP links between brokers. Each broker dials one outbound link per peer
//! and accepts inbound links on its cluster port; a link carries framed
//! control packets in order, with no retransmission. A packet on a dead
//! link is simply gone, and a re-established link starts with a fresh
//! identity exchange.

mod client;
mod server;

pub use client::ClusterClient;
pub use server::{ClusterServer, LinkEvent};

use crate::packet::{ControlPacket, MAX_PACKET_SIZE};
use crate::{Error, Result};

/// Frame header in front of every packet on the wire
pub struct FrameHeader {
    /// Encoded packet length
    pub length: u32,
    /// CRC32 over the encoded packet
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Frame a packet body
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Read one framed packet from a link
pub async fn read_packet<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<ControlPacket> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    // Bound the allocation before trusting the peer's length
    if header.length as usize > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(header.length as usize));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    let computed = crc32fast::hash(&body);
    if computed != header.checksum {
        return Err(Error::Network("packet checksum mismatch".into()));
    }

    ControlPacket::decode(&body)
}

/// Write one framed packet to a link
pub async fn write_packet<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &ControlPacket,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = packet.encode()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let mut packet = ControlPacket::new(PacketType::Announce, 31);
        packet.put_str("senderName", "broker-1");
        packet.put_long("senderSession", 10);

        write_packet(&mut a, &packet).await.unwrap();
        let received = read_packet(&mut b).await.unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        for xid in 0..5u64 {
            let packet = ControlPacket::new(PacketType::Goodbye, xid);
            write_packet(&mut a, &packet).await.unwrap();
        }
        for xid in 0..5u64 {
            let received = read_packet(&mut b).await.unwrap();
            assert_eq!(received.xid, xid);
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(4096);

        let packet = ControlPacket::new(PacketType::Announce, 1);
        let body = packet.encode().unwrap();
        let header = FrameHeader::new(&body);

        let mut corrupted = body.clone();
        corrupted[4] ^= 0xFF;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&corrupted).await.unwrap();

        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_read() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(64);

        let header = FrameHeader {
            length: (MAX_PACKET_SIZE + 1) as u32,
            checksum: 0,
        };
        a.write_all(&header.to_bytes()).await.unwrap();

        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge(_)));
    }
}
