//! Piece/block scheduling and completion tracking.
//!
//! A `Manager` owns the full piece set for one torrent behind a single
//! `tokio::sync::Mutex`: block assembly, SHA-1 verification, and handing
//! completed pieces to the storage writer all happen under that one lock,
//! so a completed piece's bytes move from the network buffer into the
//! writer without any peer observing a half-updated piece.
mod error;

pub use error::{PieceError, PieceResult};

use crate::peer::{Bitfield, Message, PeerHandle, BLOCK_LENGTH};
use crate::storage::Writer;
use crate::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Size of the rolling window used to estimate download speed and ETA.
const RATE_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub total: u64,
    pub rate_bps: f64,
    pub eta: Option<Duration>,
}

struct Block {
    begin: u32,
    length: u32,
    data: Option<Vec<u8>>,
    requested_from: HashSet<PeerHandle>,
}

impl Block {
    fn is_complete(&self) -> bool {
        self.data.is_some()
    }
}

struct Piece {
    index: u32,
    hash: [u8; 20],
    blocks: Vec<Block>,
    complete: bool,
    requested_from: HashSet<PeerHandle>,
}

impl Piece {
    fn new(index: u32, length: u32, hash: [u8; 20]) -> Self {
        let num_blocks = length.div_ceil(BLOCK_LENGTH);
        let blocks = (0..num_blocks)
            .map(|b| {
                let begin = b * BLOCK_LENGTH;
                let block_len = BLOCK_LENGTH.min(length - begin);
                Block {
                    begin,
                    length: block_len,
                    data: None,
                    requested_from: HashSet::new(),
                }
            })
            .collect();
        Self {
            index,
            hash,
            blocks,
            complete: false,
            requested_from: HashSet::new(),
        }
    }

    fn next_request(&mut self, peer: PeerHandle) -> Option<Message> {
        if self.complete || self.requested_from.contains(&peer) {
            return None;
        }
        for block in &mut self.blocks {
            if !block.is_complete() && !block.requested_from.contains(&peer) {
                block.requested_from.insert(peer);
                if self.blocks.iter().all(|b| b.requested_from.contains(&peer)) {
                    self.requested_from.insert(peer);
                }
                return Some(Message::Request {
                    index: self.index,
                    begin: block.begin,
                    length: block.length,
                });
            }
        }
        None
    }

    fn release_peer(&mut self, peer: PeerHandle) {
        self.requested_from.remove(&peer);
        for block in &mut self.blocks {
            block.requested_from.remove(&peer);
        }
    }

    fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for block in &self.blocks {
            data.extend_from_slice(block.data.as_deref().unwrap_or(&[]));
        }
        data
    }

    fn verify(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(self.assemble());
        hasher.finalize().as_slice() == self.hash
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.data = None;
            block.requested_from.clear();
        }
        self.requested_from.clear();
        self.complete = false;
    }
}

struct State {
    pieces: Vec<Piece>,
    writer: Writer,
    downloaded: u64,
    uploaded: u64,
    num_complete: usize,
    rate_samples: Vec<(Instant, u64)>,
    /// Set when a piece write fails. Storage I/O failures are fatal to the
    /// whole run (spec.md §7), not just the peer that happened to deliver
    /// the last block — the orchestrator polls `take_fatal_error` to notice
    /// and abort.
    fatal_error: Option<String>,
}

pub struct Manager {
    total_length: u64,
    state: Mutex<State>,
}

impl Manager {
    pub fn new(metainfo: &Metainfo, writer: Writer) -> Self {
        let num_pieces = metainfo.num_pieces();
        let pieces = (0..num_pieces)
            .map(|index| {
                let hash = *metainfo.piece_hash(index).expect("index within num_pieces");
                Piece::new(index as u32, metainfo.piece_size(index) as u32, hash)
            })
            .collect();

        Self {
            total_length: metainfo.total_length(),
            state: Mutex::new(State {
                pieces,
                writer,
                downloaded: 0,
                uploaded: 0,
                num_complete: 0,
                rate_samples: Vec::new(),
                fatal_error: None,
            }),
        }
    }

    /// Returns the next block request to issue to `peer`, scanning pieces
    /// in ascending index order then blocks in ascending index order.
    /// Returns `None` when `peer`'s bitfield has nothing left to offer.
    #[instrument(level = "trace", skip(self, peer_bitfield))]
    pub async fn next_request(&self, peer: PeerHandle, peer_bitfield: &Bitfield) -> Option<Message> {
        let mut state = self.state.lock().await;
        for piece in &mut state.pieces {
            if piece.complete {
                continue;
            }
            if !peer_bitfield.has(piece.index as usize) {
                continue;
            }
            if let Some(request) = piece.next_request(peer) {
                return Some(request);
            }
        }
        None
    }

    /// Applies an incoming `piece` message: stores the block, and — once
    /// every block in the piece has arrived — verifies the SHA-1 digest
    /// and either writes the piece to storage or resets it for re-download
    /// on mismatch. Returns `Err` only when the completed piece's write to
    /// storage fails, which is fatal to the whole run (spec.md §7) — the
    /// piece is left incomplete in that case so it is never counted twice.
    #[instrument(level = "debug", skip(self, data))]
    pub async fn on_block(
        &self,
        _peer: PeerHandle,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> PieceResult<()> {
        let mut state = self.state.lock().await;
        let block_len = data.len() as u64;

        let piece_complete = {
            let Some(piece) = state.pieces.get_mut(index as usize) else {
                warn!(index, "received block for unknown piece index");
                return Ok(());
            };
            if piece.complete {
                return Ok(());
            }
            let Some(block) = piece.blocks.iter_mut().find(|b| b.begin == begin) else {
                warn!(index, begin, "received block at unknown offset");
                return Ok(());
            };
            if block.is_complete() {
                return Ok(());
            }
            block.data = Some(data);
            piece.blocks.iter().all(|b| b.is_complete())
        };

        // An accepted (stored, non-duplicate) block counts toward
        // `downloaded` regardless of whether its piece ultimately verifies
        // (spec.md §4.E, §8 scenario 2: "downloaded counter reflects the
        // duplicated bytes").
        state.downloaded += block_len;
        record_rate_sample(&mut state.rate_samples, block_len);

        if !piece_complete {
            return Ok(());
        }

        let (verified, assembled) = {
            let piece = &state.pieces[index as usize];
            let verified = piece.verify();
            let assembled = if verified { Some(piece.assemble()) } else { None };
            (verified, assembled)
        };

        if verified {
            let assembled = assembled.expect("assembled is Some when verified");
            if let Err(e) = state.writer.write_piece(index, &assembled) {
                warn!(index, error = %e, "fatal I/O error writing piece, aborting run");
                let err = PieceError::from(e);
                state.fatal_error = Some(err.to_string());
                return Err(err);
            }
            state.pieces[index as usize].complete = true;
            state.num_complete += 1;
            debug!(index, "piece verified and written");
        } else {
            warn!(index, "piece failed SHA-1 verification, resetting");
            state.pieces[index as usize].reset();
        }
        Ok(())
    }

    /// Returns and clears a pending fatal storage error, if one occurred.
    /// The orchestrator polls this to abort the run per spec.md §7's "IOError
    /// ... Fatal to the run" — a write failure is not just that peer's
    /// problem.
    pub async fn take_fatal_error(&self) -> Option<String> {
        self.state.lock().await.fatal_error.take()
    }

    /// Releases `peer` from every block/piece `requested_from` set. Called
    /// when a peer chokes us or disconnects, so the scheduler can offer
    /// those blocks to other peers immediately.
    pub async fn release_peer(&self, peer: PeerHandle) {
        let mut state = self.state.lock().await;
        for piece in &mut state.pieces {
            piece.release_peer(peer);
        }
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        state.num_complete == state.pieces.len()
    }

    pub async fn stats(&self) -> Stats {
        let state = self.state.lock().await;
        let rate_bps = compute_rate(&state.rate_samples);
        let remaining = self.total_length.saturating_sub(state.downloaded);
        let eta = if rate_bps > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate_bps))
        } else {
            None
        };
        Stats {
            downloaded: state.downloaded,
            uploaded: state.uploaded,
            total: self.total_length,
            rate_bps,
            eta,
        }
    }
}

fn record_rate_sample(samples: &mut Vec<(Instant, u64)>, size: u64) {
    samples.push((Instant::now(), size));
    if samples.len() > RATE_WINDOW {
        samples.remove(0);
    }
}

fn compute_rate(samples: &[(Instant, u64)]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let total: u64 = samples.iter().map(|(_, size)| size).sum();
    let elapsed = samples
        .last()
        .unwrap()
        .0
        .duration_since(samples.first().unwrap().0)
        .as_secs_f64();
    if elapsed <= 0.0 {
        0.0
    } else {
        total as f64 / elapsed
    }
}
