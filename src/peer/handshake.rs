//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! `info_hash`) and establishes basic protocol compatibility.
use super::{PeerProtocolError, PeerResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

/// A BitTorrent handshake message.
///
/// Handshake parsing tolerates any `pstrlen` in `[1, 255]` rather than
/// requiring the literal `pstrlen == 19`. Some clients advertise
/// non-standard protocol strings for extension negotiation; rejecting them
/// outright would drop otherwise-compatible peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: Vec<u8>,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

impl Handshake {
    /// Creates a new handshake carrying the literal `BitTorrent protocol`
    /// identifier and all-zero reserved bytes (no extension bits are set or
    /// honored).
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol: b"BitTorrent protocol".to_vec(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form: 1-byte
    /// `pstrlen`, the protocol string, 8 reserved bytes, 20-byte
    /// `info_hash`, 20-byte `peer_id`.
    #[instrument(level = "trace", skip(self))]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + self.protocol.len());
        buf.push(self.protocol.len() as u8);
        buf.extend_from_slice(&self.protocol);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Reads a handshake from `stream`. Bytes read beyond the 68-byte
    /// handshake boundary are never consumed here — framed-message parsing
    /// begins from a clean socket position.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut pstrlen_buf = [0u8; 1];
        stream.read_exact(&mut pstrlen_buf).await?;
        let pstrlen = pstrlen_buf[0];
        if pstrlen == 0 {
            return Err(PeerProtocolError::InvalidProtocolLength(pstrlen));
        }

        let mut rest = vec![0u8; pstrlen as usize + 48];
        stream.read_exact(&mut rest).await?;

        let protocol = rest[..pstrlen as usize].to_vec();
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&rest[pstrlen as usize..pstrlen as usize + 8]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[pstrlen as usize + 8..pstrlen as usize + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[pstrlen as usize + 28..pstrlen as usize + 48]);

        Ok(Self {
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validates that this handshake's info hash matches the torrent we are
    /// downloading.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerProtocolError::InfoHashMismatch);
        }
        Ok(())
    }

    /// Connects to `addr`, exchanges handshakes, and validates the remote
    /// peer's info hash. Returns the remote handshake (which carries its
    /// `peer_id`) on success.
    #[instrument(level = "debug", skip(info_hash, peer_id))]
    pub async fn connect_and_handshake(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<(TcpStream, Handshake)> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerProtocolError::ConnectTimeout)??;

        let ours = Handshake::new(info_hash, peer_id);
        stream.write_all(&ours.serialize()).await?;

        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate(info_hash)?;

        Ok((stream, theirs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_68_bytes_for_standard_protocol_string() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn validate_rejects_mismatched_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate([9u8; 20]).is_err());
    }

    #[test]
    fn validate_accepts_matching_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate([1u8; 20]).is_ok());
    }
}
