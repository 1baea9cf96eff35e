//! Peer wire-protocol engine: handshake, framed messages, and the
//! per-peer session state machine.
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::Message;
pub use session::{PeerHandle, PeerState, Session};

/// BitTorrent request block size. Peers may request less at the tail of a
/// piece but never more.
pub const BLOCK_LENGTH: u32 = 16384;

/// Errors fatal to a single peer connection. These never abort the run —
/// the orchestrator drops the connection and continues with the rest of
/// the peer set.
#[derive(Debug, Error)]
pub enum PeerProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid protocol length: {0}")]
    InvalidProtocolLength(u8),

    #[error("invalid protocol identifier")]
    InvalidProtocol,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("message frame truncated")]
    TruncatedFrame,

    #[error("message frame exceeds maximum size")]
    OversizedFrame,

    #[error("connect timed out")]
    ConnectTimeout,

    /// Not actually specific to this peer — a completed piece's write to
    /// storage failed, which spec.md §7 says is fatal to the whole run. The
    /// piece manager also records this for the orchestrator to notice and
    /// abort; surfacing it here just ends this session's loop promptly too.
    #[error("fatal error: {0}")]
    Fatal(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerProtocolError>;
