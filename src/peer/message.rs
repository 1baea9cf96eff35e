//! Peer wire messages: the length-prefixed messages exchanged after the
//! handshake (message ids 0-8; `KeepAlive` has no id byte at all).
use super::{PeerProtocolError, PeerResult};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Frames larger than this are rejected outright. A `Piece` message never
/// legitimately carries more than a handful of requested blocks worth of
/// payload; this bound exists to stop a misbehaving peer from making us
/// allocate an unbounded buffer.
pub const MAX_FRAME_LENGTH: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message whose id this client does not recognize. The spec requires
    /// these to be skipped rather than treated as a protocol error, since a
    /// peer may speak extensions we don't implement.
    Unknown(u8),
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Unknown(id) => Some(*id),
        }
    }

    /// Serializes this message into its wire form: a 4-byte big-endian
    /// length prefix (counting the id byte and payload, not itself)
    /// followed by the id byte and payload.
    pub fn serialize(&self) -> Vec<u8> {
        let id = match self.id() {
            None => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(0);
                return buf.to_vec();
            }
            Some(id) => id,
        };

        let mut payload = BytesMut::new();
        match self {
            Message::Have(index) => payload.put_u32(*index),
            Message::Bitfield(bits) => payload.put_slice(bits),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_slice(block);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Unknown(_) => {}
            Message::KeepAlive => unreachable!(),
        }

        let length = 1 + payload.len() as u32;
        let mut buf = BytesMut::with_capacity(4 + length as usize);
        buf.put_u32(length);
        buf.put_u8(id);
        buf.put_slice(&payload);
        buf.to_vec()
    }

    /// Parses a message from its id byte and payload (the length prefix
    /// has already been consumed by the caller).
    fn from_id_and_payload(id: u8, payload: &[u8]) -> PeerResult<Self> {
        let mut cursor = std::io::Cursor::new(payload);
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if payload.len() != 4 {
                    return Err(PeerProtocolError::TruncatedFrame);
                }
                Ok(Message::Have(cursor.read_u32::<BigEndian>()?))
            }
            5 => Ok(Message::Bitfield(payload.to_vec())),
            6 | 8 => {
                if payload.len() != 12 {
                    return Err(PeerProtocolError::TruncatedFrame);
                }
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let length = cursor.read_u32::<BigEndian>()?;
                if id == 6 {
                    Ok(Message::Request { index, begin, length })
                } else {
                    Ok(Message::Cancel { index, begin, length })
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerProtocolError::TruncatedFrame);
                }
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let start = cursor.position() as usize;
                Ok(Message::Piece {
                    index,
                    begin,
                    block: payload[start..].to_vec(),
                })
            }
            // Unrecognized message ids are not protocol errors: the spec
            // requires skipping them (the length prefix already told us how
            // many payload bytes to consume) rather than dropping the
            // connection.
            other => Ok(Message::Unknown(other)),
        }
    }

    /// Reads one framed message from `stream`, blocking until either a
    /// full frame arrives or the connection errors.
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let length = std::io::Cursor::new(len_buf).read_u32::<BigEndian>()?;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_FRAME_LENGTH {
            return Err(PeerProtocolError::OversizedFrame);
        }

        let mut rest = BytesMut::zeroed(length as usize);
        stream.read_exact(&mut rest).await?;
        let id = rest.get_u8();
        Self::from_id_and_payload(id, &rest[..])
    }

    pub async fn write(&self, stream: &mut TcpStream) -> PeerResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn interested_matches_known_vector() {
        assert_eq!(Message::Interested.serialize(), vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn request_matches_known_vector() {
        let msg = Message::Request {
            index: 0,
            begin: 1,
            length: 16384,
        };
        let bytes = msg.serialize();
        let mut expected = vec![0, 0, 0, 13, 6];
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&16384u32.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn have_round_trips() {
        let msg = Message::Have(42);
        let bytes = msg.serialize();
        let parsed = Message::from_id_and_payload(bytes[4], &bytes[5..]).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn piece_round_trips_with_payload() {
        let msg = Message::Piece {
            index: 3,
            begin: 16384,
            block: vec![0xAB; 256],
        };
        let bytes = msg.serialize();
        let parsed = Message::from_id_and_payload(bytes[4], &bytes[5..]).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_truncated_have() {
        assert!(Message::from_id_and_payload(4, &[0, 0, 0]).is_err());
    }

    #[test]
    fn unknown_message_id_is_not_a_protocol_error() {
        let parsed = Message::from_id_and_payload(200, &[1, 2, 3]).unwrap();
        assert_eq!(parsed, Message::Unknown(200));
    }
}
