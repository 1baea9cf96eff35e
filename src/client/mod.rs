//! Client orchestrator: owns the peer registry, piece manager, and
//! tracker client, and drives the tracker loop and per-peer tasks.
use crate::peer::{Handshake, PeerHandle, Session};
use crate::piece;
use crate::storage;
use crate::torrent::Metainfo;
use crate::tracker::{self, Event};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Delay before retrying an announce after a tracker failure.
const TRACKER_BACKOFF: Duration = Duration::from_secs(15);

struct PeerConnection {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Drives a single torrent's download from tracker announce through
/// peer-set reconciliation to shutdown. Exclusively owns the metainfo,
/// piece manager, data writer (via the piece manager), tracker client,
/// and the live peer registry, matching the single-owner design spelled
/// out for this component.
pub struct Orchestrator {
    metainfo: Metainfo,
    tracker: tracker::Client,
    piece_manager: Arc<piece::Manager>,
    peers: HashMap<PeerHandle, PeerConnection>,
}

impl Orchestrator {
    pub fn new(metainfo: Metainfo, output_dir: impl Into<PathBuf>, listen_port: u16) -> Result<Self> {
        let writer = storage::Writer::new(&metainfo, output_dir)?;
        let piece_manager = Arc::new(piece::Manager::new(&metainfo, writer));
        let tracker = tracker::Client::new(listen_port);
        Ok(Self {
            metainfo,
            tracker,
            piece_manager,
            peers: HashMap::new(),
        })
    }

    /// Runs the tracker loop until every piece is complete: announce,
    /// reconcile the peer set against the response, sleep for the
    /// announced interval, repeat. Tracker failures are logged and
    /// retried after a fixed back-off rather than aborting the run. A
    /// fatal storage I/O error (spec.md §7) aborts the run as soon as the
    /// next poll notices it, regardless of which peer session hit it.
    #[instrument(level = "info", skip(self))]
    pub async fn run(&mut self) -> Result<()> {
        let mut event = Event::Started;

        loop {
            if self.piece_manager.is_complete().await {
                info!("download complete");
                return Ok(());
            }
            if let Some(reason) = self.piece_manager.take_fatal_error().await {
                anyhow::bail!("fatal storage error, aborting download: {reason}");
            }

            let downloaded = self.piece_manager.stats().await.downloaded;
            match self
                .tracker
                .announce(&self.metainfo, 0, downloaded, event)
                .await
            {
                Ok(response) => {
                    info!(peers = response.peers.len(), interval = response.interval, "tracker announce succeeded");
                    self.reconcile_peers(response.peers).await;
                    event = Event::None;
                    let interval = response.interval.max(1) as u64;
                    self.wait_or_abort_on_fatal_error(Duration::from_secs(interval)).await?;
                }
                Err(e) => {
                    warn!(error = %e, "tracker announce failed, retrying after back-off");
                    self.wait_or_abort_on_fatal_error(TRACKER_BACKOFF).await?;
                }
            }
        }
    }

    /// Sleeps out `duration` in short increments so a fatal storage error or
    /// run completion arising mid-wait (spec.md §7) is noticed promptly
    /// rather than only at the next scheduled announce, which may be
    /// minutes away.
    async fn wait_or_abort_on_fatal_error(&self, duration: Duration) -> Result<()> {
        const POLL_INTERVAL: Duration = Duration::from_millis(500);
        let mut waited = Duration::ZERO;
        while waited < duration {
            if self.piece_manager.is_complete().await {
                return Ok(());
            }
            if let Some(reason) = self.piece_manager.take_fatal_error().await {
                anyhow::bail!("fatal storage error, aborting download: {reason}");
            }
            let step = POLL_INTERVAL.min(duration - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
        Ok(())
    }

    /// Disconnects peers no longer present in the tracker's list, connects
    /// peers newly offered, and leaves already-connected peers untouched.
    async fn reconcile_peers(&mut self, tracker_peers: Vec<tracker::Peer>) {
        self.reap_finished_peers();

        let wanted: HashSet<SocketAddr> = tracker_peers
            .iter()
            .map(|p| SocketAddr::new(p.ip, p.port))
            .collect();

        let stale: Vec<PeerHandle> = self
            .peers
            .keys()
            .filter(|handle| !wanted.contains(&handle.addr))
            .copied()
            .collect();
        for handle in stale {
            self.disconnect_peer(handle).await;
        }

        for addr in wanted {
            let handle = PeerHandle::new(addr);
            if self.peers.contains_key(&handle) {
                continue;
            }
            self.spawn_peer(handle);
        }
    }

    fn reap_finished_peers(&mut self) {
        self.peers.retain(|_, conn| !conn.task.is_finished());
    }

    fn spawn_peer(&mut self, handle: PeerHandle) {
        let info_hash = self.metainfo.info_hash();
        let peer_id = self.tracker.peer_id();
        let piece_manager = Arc::clone(&self.piece_manager);
        let num_pieces = self.metainfo.num_pieces();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(async move {
            match Handshake::connect_and_handshake(handle.addr, info_hash, peer_id).await {
                Ok((stream, _their_handshake)) => {
                    let session = Session::new(handle, stream, num_pieces);
                    if let Err(e) = session.run(piece_manager, shutdown_rx).await {
                        warn!(peer = ?handle.addr, error = %e, "peer session ended");
                    }
                }
                Err(e) => {
                    warn!(peer = ?handle.addr, error = %e, "failed to connect to peer");
                }
            }
        });

        self.peers.insert(handle, PeerConnection { shutdown: shutdown_tx, task });
    }

    async fn disconnect_peer(&mut self, handle: PeerHandle) {
        if let Some(conn) = self.peers.remove(&handle) {
            let _ = conn.shutdown.send(()).await;
            let _ = conn.task.await;
        }
    }

    /// Disconnects every peer, sends a best-effort `stopped` announce, and
    /// tears down the tracker session. Guaranteed to run to completion
    /// regardless of whether `run` exited normally or via cancellation.
    #[instrument(level = "info", skip(self))]
    pub async fn shutdown(&mut self) {
        let handles: Vec<PeerHandle> = self.peers.keys().copied().collect();
        for handle in handles {
            self.disconnect_peer(handle).await;
        }

        let downloaded = self.piece_manager.stats().await.downloaded;
        if let Err(e) = self
            .tracker
            .announce(&self.metainfo, 0, downloaded, Event::Stopped)
            .await
        {
            warn!(error = %e, "best-effort stopped announce failed");
        }
        self.tracker.close().await;
    }
}

/// The process surface: downloads `metainfo_path`'s torrent into
/// `output_directory`, advertising `listen_port` to the tracker. Runs
/// until complete or until a `ctrl_c` signal requests graceful shutdown.
pub async fn download(
    metainfo_path: impl AsRef<Path>,
    output_directory: impl Into<PathBuf>,
    listen_port: u16,
) -> Result<()> {
    let data = std::fs::read(metainfo_path)?;
    let metainfo = Metainfo::parse(&data)?;
    let mut orchestrator = Orchestrator::new(metainfo, output_directory, listen_port)?;

    let result = tokio::select! {
        result = orchestrator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    orchestrator.shutdown().await;
    result
}
