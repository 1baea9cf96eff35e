//! Per-peer connection state machine and I/O loops.
//!
//! A `Session` owns the TCP stream for one peer past the handshake and
//! drives two cooperative loops: a receive loop that decodes incoming
//! messages and applies them to local state (and the shared piece
//! manager), and a send loop that asks the piece manager for the next
//! block to request and issues it once the peer has unchoked us. Both
//! loops run concurrently via `tokio::select!` inside `Session::run`.
use super::bitfield::Bitfield;
use super::{Message, PeerProtocolError, PeerResult, BLOCK_LENGTH};
use crate::piece::Manager as PieceManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

pub const CHUNK_SIZE: usize = 10240;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const REQUEST_DELAY_AFTER_BLOCK: Duration = Duration::from_millis(100);
pub const REQUEST_DELAY_NO_BLOCK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// A handle callers use to address a connected peer: its advertised
/// endpoint and learned peer id. Cheap to clone; used as the map key and
/// scheduler token the piece manager stores in `requested_from` sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub addr: SocketAddr,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

/// Connection and interest/choke state for one peer, plus its advertised
/// piece bitfield. `am_choking` is always `true`: this client never
/// uploads, so it never has a reason to unchoke a remote peer.
pub struct Session {
    pub handle: PeerHandle,
    pub state: PeerState,
    pub am_interested: bool,
    pub am_choking: bool,
    pub peer_interested: bool,
    pub peer_choking: bool,
    pub bitfield: Bitfield,
    stream: TcpStream,
}

impl Session {
    pub fn new(handle: PeerHandle, stream: TcpStream, num_pieces: usize) -> Self {
        Self {
            handle,
            state: PeerState::Connected,
            am_interested: false,
            am_choking: true,
            peer_interested: false,
            peer_choking: true,
            bitfield: Bitfield::empty(num_pieces),
            stream,
        }
    }

    fn apply_bitfield(&mut self, bytes: &[u8]) {
        self.bitfield = Bitfield::from_bytes(bytes, self.bitfield.len());
    }

    fn set_have(&mut self, index: u32) {
        if (index as usize) < self.bitfield.len() {
            self.bitfield.set(index as usize, true);
        }
    }

    /// Runs this session to completion: sends the initial `interested`
    /// message, then drives the receive and send loops until the
    /// connection closes, `shutdown` fires, or an unrecoverable protocol
    /// error occurs.
    #[instrument(level = "debug", skip(self, piece_manager, shutdown))]
    pub async fn run(
        mut self,
        piece_manager: Arc<PieceManager>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> PeerResult<()> {
        Message::Interested.write(&mut self.stream).await?;
        self.am_interested = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(peer = ?self.handle.addr, "session shutting down");
                    return Ok(());
                }
                result = Message::read(&mut self.stream) => {
                    match result {
                        Ok(message) => self.consume(message, &piece_manager).await?,
                        Err(PeerProtocolError::Io(e)) => {
                            warn!(peer = ?self.handle.addr, error = %e, "peer connection dropped");
                            return Err(PeerProtocolError::Io(e));
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = self.maybe_request(&piece_manager) => {}
            }
        }
    }

    async fn consume(&mut self, message: Message, piece_manager: &PieceManager) -> PeerResult<()> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                piece_manager.release_peer(self.handle).await;
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => self.set_have(index),
            Message::Bitfield(bytes) => self.apply_bitfield(&bytes),
            Message::Piece { index, begin, block } => {
                piece_manager
                    .on_block(self.handle, index, begin, block)
                    .await
                    .map_err(|e| PeerProtocolError::Fatal(e.to_string()))?;
                sleep(REQUEST_DELAY_AFTER_BLOCK).await;
                self.send_next_request(piece_manager).await?;
            }
            Message::Request { .. } | Message::Cancel { .. } => {
                // Uploading is unimplemented: a conformant leech client never
                // sends data in response, so these are observed and dropped.
            }
            Message::Unknown(id) => {
                debug!(peer = ?self.handle.addr, id, "ignoring unrecognized message id");
            }
        }
        Ok(())
    }

    /// Waits out the fixed delay between request attempts and then issues
    /// one. Used as the send-side arm of the `select!` loop so requesting
    /// never blocks message receipt.
    async fn maybe_request(&mut self, piece_manager: &PieceManager) -> PeerResult<()> {
        sleep(REQUEST_DELAY_NO_BLOCK).await;
        self.send_next_request(piece_manager).await
    }

    async fn send_next_request(&mut self, piece_manager: &PieceManager) -> PeerResult<()> {
        if self.peer_choking {
            return Ok(());
        }
        if let Some(request) = piece_manager.next_request(self.handle, &self.bitfield).await {
            request.write(&mut self.stream).await?;
        }
        Ok(())
    }
}

pub fn block_length(piece_len: u64, begin: u32) -> u32 {
    BLOCK_LENGTH.min((piece_len as u32).saturating_sub(begin))
}
