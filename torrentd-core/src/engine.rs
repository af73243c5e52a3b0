//! The per-torrent event loop: binds the piece manager, piece store,
//! tracker manager, and the pool of peer connections together.
//!
//! Each peer connection runs on its own task; the engine task is the sole
//! mutator of piece state, availability, and the peer list, communicating
//! with peer tasks over `mpsc` command/event channels rather than sharing
//! the connection itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::metainfo::Metainfo;
use crate::peer::bitfield::Bitfield;
use crate::peer::connection::{self, PeerConnection};
use crate::peer::message::Message;
use crate::peer_manager::PeerManager;
use crate::piece_manager::PieceManager;
use crate::storage::PieceStore;
use crate::tracker::manager::TrackerManager;
use crate::tracker::{AnnounceParams, Event as TrackerEvent};

#[derive(Debug)]
enum PeerCommand {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Status(oneshot::Sender<PeerSnapshot>),
    Close,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub remote_id: [u8; 20],
    pub bitmap_len: usize,
    pub pieces_have: usize,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub down_bps: f64,
    pub up_bps: f64,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

enum PeerEvent {
    Message(SocketAddr, Message),
    Closed(SocketAddr),
}

/// What the engine tracks about a peer without reaching into the task that
/// owns its socket: just enough to make scheduling decisions.
struct PeerHandle {
    cmd_tx: mpsc::Sender<PeerCommand>,
    bitmap: Bitfield,
    peer_choking: bool,
    peer_interested: bool,
    am_choking: bool,
}

async fn run_peer_task(
    mut conn: PeerConnection,
    addr: SocketAddr,
    events: mpsc::Sender<PeerEvent>,
    mut commands: mpsc::Receiver<PeerCommand>,
) {
    loop {
        tokio::select! {
            received = conn.recv() => {
                match received {
                    Ok(msg) => {
                        if events.send(PeerEvent::Message(addr, msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "peer connection closed");
                        let _ = events.send(PeerEvent::Closed(addr)).await;
                        break;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    None => break,
                    Some(PeerCommand::Close) => {
                        conn.close();
                        break;
                    }
                    Some(PeerCommand::Choke) => { let _ = conn.send_choke().await; }
                    Some(PeerCommand::Unchoke) => { let _ = conn.send_unchoke().await; }
                    Some(PeerCommand::Interested) => { let _ = conn.send_interested().await; }
                    Some(PeerCommand::NotInterested) => { let _ = conn.send_not_interested().await; }
                    Some(PeerCommand::Have(index)) => { let _ = conn.send_have(index).await; }
                    Some(PeerCommand::Bitfield(bits)) => { let _ = conn.send_bitfield(bits).await; }
                    Some(PeerCommand::Request(index, begin, length)) => {
                        let _ = conn.send_request(index, begin, length).await;
                    }
                    Some(PeerCommand::Piece(index, begin, block)) => {
                        let _ = conn.send_piece(index, begin, block).await;
                    }
                    Some(PeerCommand::Status(reply)) => {
                        let now = Instant::now();
                        let snapshot = PeerSnapshot {
                            addr,
                            remote_id: conn.remote_peer_id,
                            bitmap_len: conn.bitmap.len(),
                            pieces_have: conn.bitmap.as_slice().iter().filter(|&&b| b).count(),
                            am_choking: conn.am_choking,
                            am_interested: conn.am_interested,
                            peer_choking: conn.peer_choking,
                            peer_interested: conn.peer_interested,
                            down_bps: conn.down_speed_bps(now),
                            up_bps: conn.up_speed_bps(now),
                            total_downloaded: conn.total_downloaded,
                            total_uploaded: conn.total_uploaded,
                        };
                        let _ = reply.send(snapshot);
                    }
                }
            }
        }
    }
}

pub struct TorrentEngine {
    pub meta: Arc<Metainfo>,
    config: Configuration,
    local_peer_id: [u8; 20],

    store: Mutex<PieceStore>,
    piece_manager: Mutex<PieceManager>,
    tracker_manager: Mutex<TrackerManager>,
    peer_manager: Mutex<PeerManager>,
    peers: Mutex<HashMap<SocketAddr, PeerHandle>>,

    paused: AtomicBool,
    pause_notify: Notify,
    shutdown: AtomicBool,

    pub added_on: i64,
    pub completed_on: Mutex<Option<i64>>,

    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: Mutex<mpsc::Receiver<PeerEvent>>,
    retry_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Azureus-style id: `-PC0001-` followed by 12 random hex characters.
pub fn generate_peer_id(prefix: &str) -> [u8; 20] {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut id = [0u8; 20];
    let prefix_bytes = prefix.as_bytes();
    id[..prefix_bytes.len()].copy_from_slice(prefix_bytes);
    let mut rng = rand::thread_rng();
    for slot in id.iter_mut().skip(prefix_bytes.len()) {
        *slot = HEX[rng.gen_range(0..HEX.len())];
    }
    id
}

impl TorrentEngine {
    pub fn new(
        meta: Metainfo,
        config: Configuration,
        added_on: i64,
        already_finished: bool,
    ) -> Result<Self, crate::error::StorageError> {
        let meta = Arc::new(meta);
        let mut store = PieceStore::open(&meta, &config.download_dir)?;
        let mut piece_manager = PieceManager::with_request_timeout(&meta, config.request_timeout);

        if already_finished {
            for i in 0..piece_manager.num_pieces() {
                piece_manager.mark_complete(i);
            }
            store.switch_to_seeding()?;
        }

        let tracker_manager = TrackerManager::with_limits(
            &meta,
            config.tracker_fanout_concurrency,
            config.udp_tracker_timeout,
        );
        let local_peer_id = generate_peer_id(&config.peer_id_prefix);
        let peer_manager = PeerManager::with_limits(
            meta.info_hash,
            local_peer_id,
            meta.num_pieces(),
            config.handshake_timeout,
            config.max_peer_failures,
            config.connect_parallelism,
        );
        let (event_tx, event_rx) = mpsc::channel(1024);

        Ok(TorrentEngine {
            meta,
            config,
            local_peer_id,
            store: Mutex::new(store),
            piece_manager: Mutex::new(piece_manager),
            tracker_manager: Mutex::new(tracker_manager),
            peer_manager: Mutex::new(peer_manager),
            peers: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            pause_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            added_on,
            completed_on: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(event_rx),
            retry_task: Mutex::new(None),
        })
    }

    /// Verify pass: hashes every piece already on disk and marks matches
    /// complete, crediting their bytes. If everything verifies, the store
    /// immediately transitions to seeding.
    pub async fn verify_existing(&self) -> Result<(), crate::error::StorageError> {
        let mut store = self.store.lock().await;
        let mut pm = self.piece_manager.lock().await;
        for i in 0..pm.num_pieces() {
            let piece = pm.piece(i);
            let offset = piece.base_offset;
            let length = piece.length;
            let expected = piece.expected_sha1;
            let data = store.read(offset, length)?;
            let mut hasher = sha1::Sha1::new();
            use sha1::Digest;
            hasher.update(&data);
            let digest: [u8; 20] = hasher.finalize().into();
            if digest == expected {
                pm.mark_complete(i);
            }
        }
        if pm.all_complete() {
            store.switch_to_seeding()?;
        }
        Ok(())
    }

    fn completion_bits(&self, completion: &[bool]) -> Vec<u8> {
        Bitfield::from_bools(completion.to_vec()).to_packed_bytes()
    }

    /// Announces "started" to all trackers, connects to the returned peers
    /// in parallel, registers each surviving connection, and sends them our
    /// interest and bitfield.
    pub async fn bootstrap(&self) -> Result<(), crate::error::StorageError> {
        let addrs = self.announce(TrackerEvent::Started).await;
        self.connect_and_register(addrs).await;
        Ok(())
    }

    /// Spawns the background loop that wakes every `retry_check_interval`
    /// and reconnects any peer whose backoff has elapsed and whose failure
    /// count is still under the cap. Call on an `Arc`-wrapped engine so the
    /// task can outlive the caller; `shutdown()` aborts it.
    pub async fn start_retry_worker(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let interval = self.config.retry_check_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if engine.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                engine.retry_failed_peers().await;
            }
        });
        *self.retry_task.lock().await = Some(handle);
    }

    async fn retry_failed_peers(&self) {
        let due = {
            let pm = self.peer_manager.lock().await;
            pm.due_for_retry(Instant::now())
        };
        if due.is_empty() {
            return;
        }
        let connections = {
            let mut pm = self.peer_manager.lock().await;
            pm.retry(due).await
        };
        for conn in connections {
            self.register_peer(conn).await;
        }
    }

    async fn announce(&self, event: TrackerEvent) -> Vec<SocketAddr> {
        let (downloaded, left) = {
            let pm = self.piece_manager.lock().await;
            let downloaded = pm.downloaded_bytes;
            let left = self.meta.total_length.saturating_sub(downloaded);
            (downloaded, left)
        };
        let params = AnnounceParams {
            info_hash: &self.meta.info_hash,
            peer_id: &self.local_peer_id,
            port: self.config.listen_port,
            uploaded: 0,
            downloaded,
            left,
            event,
        };
        let mut tracker_manager = self.tracker_manager.lock().await;
        let (peers, _interval) = tracker_manager.get_all_peers(&params).await;
        peers
    }

    async fn connect_and_register(&self, addrs: Vec<SocketAddr>) {
        let known: Vec<SocketAddr> = {
            let peers = self.peers.lock().await;
            addrs.into_iter().filter(|a| !peers.contains_key(a)).collect()
        };
        if known.is_empty() {
            return;
        }
        let connections = {
            let mut peer_manager = self.peer_manager.lock().await;
            peer_manager.connect_all(known).await
        };
        for conn in connections {
            self.register_peer(conn).await;
        }
    }

    async fn register_peer(&self, mut conn: PeerConnection) {
        let addr = conn.addr;
        conn.ensure_bitmap(self.meta.num_pieces());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handle = PeerHandle {
            cmd_tx: cmd_tx.clone(),
            bitmap: Bitfield::new(self.meta.num_pieces()),
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
        };
        self.peers.lock().await.insert(addr, handle);

        let completion = {
            let pm = self.piece_manager.lock().await;
            pm.completion_bitmap()
        };
        let bits = self.completion_bits(&completion);

        let events = self.event_tx.clone();
        tokio::spawn(run_peer_task(conn, addr, events, cmd_rx));

        let _ = cmd_tx.send(PeerCommand::Interested).await;
        let _ = cmd_tx.send(PeerCommand::Bitfield(bits)).await;
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.pause_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Fetches peers for `event`, filters against the currently known set,
    /// and connects to only the new ones.
    pub async fn announce_now(&self, event: TrackerEvent) {
        let addrs = self.announce(event).await;
        self.connect_and_register(addrs).await;
    }

    /// Drives the event loop until `shutdown()` is called. Intended to run
    /// on its own task for the lifetime of the torrent.
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            while self.paused.load(Ordering::SeqCst) {
                self.pause_notify.notified().await;
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
            }

            self.piece_manager.lock().await.tick(Instant::now());

            let has_peers = !self.peers.lock().await.is_empty();
            if !has_peers {
                tokio::time::sleep(self.config.idle_sleep).await;
                continue;
            }

            let event = {
                let mut rx = self.event_rx.lock().await;
                tokio::time::timeout(self.config.selector_poll_timeout, rx.recv()).await
            };

            match event {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => break, // all senders dropped; nothing left to drive
                Err(_timeout) => continue,
            }
        }
    }

    async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Closed(addr) => self.remove_peer(addr).await,
            PeerEvent::Message(addr, msg) => self.dispatch(addr, msg).await,
        }
    }

    async fn remove_peer(&self, addr: SocketAddr) {
        let handle = self.peers.lock().await.remove(&addr);
        if let Some(handle) = handle {
            self.piece_manager
                .lock()
                .await
                .peer_disconnect(&addr.to_string(), handle.bitmap.as_slice());
            let _ = handle.cmd_tx.send(PeerCommand::Close).await;
        }
    }

    async fn dispatch(&self, addr: SocketAddr, msg: Message) {
        let peer_id = addr.to_string();
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if let Some(handle) = self.peers.lock().await.get_mut(&addr) {
                    handle.peer_choking = true;
                }
                self.piece_manager.lock().await.on_choke(&peer_id);
            }
            Message::Unchoke => {
                if let Some(handle) = self.peers.lock().await.get_mut(&addr) {
                    handle.peer_choking = false;
                }
            }
            Message::Interested => {
                let mut peers = self.peers.lock().await;
                if let Some(handle) = peers.get_mut(&addr) {
                    handle.peer_interested = true;
                    if handle.am_choking {
                        handle.am_choking = false;
                        let _ = handle.cmd_tx.send(PeerCommand::Unchoke).await;
                    }
                }
            }
            Message::NotInterested => {
                let mut peers = self.peers.lock().await;
                if let Some(handle) = peers.get_mut(&addr) {
                    handle.peer_interested = false;
                    if !handle.am_choking {
                        handle.am_choking = true;
                        let _ = handle.cmd_tx.send(PeerCommand::Choke).await;
                    }
                }
            }
            Message::Have { index } => {
                let mut peers = self.peers.lock().await;
                if let Some(handle) = peers.get_mut(&addr) {
                    handle.bitmap.ensure_len(self.meta.num_pieces());
                    handle.bitmap.set(index as usize);
                }
                drop(peers);
                self.piece_manager.lock().await.add_have(index as usize);
            }
            Message::Bitfield { bits } => {
                let bitmap = Bitfield::from_packed_bytes(&bits, self.meta.num_pieces());
                let mut peers = self.peers.lock().await;
                if let Some(handle) = peers.get_mut(&addr) {
                    handle.bitmap = bitmap.clone();
                }
                drop(peers);
                self.piece_manager.lock().await.add_bitmap(bitmap.as_slice());
            }
            Message::Request { index, begin, length } => {
                self.handle_request(addr, index, begin, length).await;
            }
            Message::Piece { index, begin, block } => {
                self.handle_piece(addr, index, begin, block).await;
            }
            Message::Cancel { .. } => {
                // Endgame-mode cancellation is out of scope; requests are
                // simply served or time out naturally.
            }
        }

        self.maybe_request_more(addr).await;
    }

    async fn handle_request(&self, addr: SocketAddr, index: u32, begin: u32, length: u32) {
        let am_choking = {
            let peers = self.peers.lock().await;
            peers.get(&addr).map(|h| h.am_choking).unwrap_or(true)
        };
        if am_choking || index as usize >= self.meta.num_pieces() {
            return;
        }
        // `begin`/`length` come straight from the wire; a piece index in
        // range says nothing about whether the requested span fits inside
        // it. Drop the offending peer rather than let an out-of-range
        // request reach the store.
        let piece_len = self.meta.piece_len(index as usize);
        if begin as u64 + length as u64 > piece_len {
            warn!(%addr, index, begin, length, "dropping peer for out-of-range request");
            self.remove_peer(addr).await;
            return;
        }
        let piece_complete = self.piece_manager.lock().await.piece(index as usize).is_complete();
        if !piece_complete {
            return;
        }
        let global_offset = index as u64 * self.meta.piece_length + begin as u64;
        let data = match self.store.lock().await.read(global_offset, length as u64) {
            Ok(data) => data,
            Err(e) => {
                warn!(%addr, error = %e, "failed to read piece for request");
                return;
            }
        };
        if let Some(handle) = self.peers.lock().await.get(&addr) {
            let _ = handle.cmd_tx.send(PeerCommand::Piece(index, begin, data)).await;
        }
    }

    async fn handle_piece(&self, addr: SocketAddr, index: u32, begin: u32, block: Vec<u8>) {
        let peer_id = addr.to_string();
        let global_offset = index as u64 * self.meta.piece_length + begin as u64;

        let accepted = self
            .piece_manager
            .lock()
            .await
            .block_received(&peer_id, index, begin, &block);

        if accepted.is_none() {
            return;
        }
        if let Err(e) = self.store.lock().await.write(index, begin, &block) {
            warn!(%addr, error = %e, "failed to persist received block");
            return;
        }

        if accepted == Some(true) {
            self.broadcast_have(index).await;
            if self.piece_manager.lock().await.all_complete() {
                if let Err(e) = self.store.lock().await.switch_to_seeding() {
                    warn!(error = %e, "failed to switch to seeding");
                } else {
                    *self.completed_on.lock().await = Some(now_unix());
                    info!(torrent = %self.meta.name, "download complete");
                }
            }
        }
    }

    async fn broadcast_have(&self, index: u32) {
        let peers = self.peers.lock().await;
        for handle in peers.values() {
            let _ = handle.cmd_tx.send(PeerCommand::Have(index)).await;
        }
    }

    async fn maybe_request_more(&self, addr: SocketAddr) {
        let (peer_choking, bitmap) = {
            let peers = self.peers.lock().await;
            match peers.get(&addr) {
                Some(h) => (h.peer_choking, h.bitmap.as_slice().to_vec()),
                None => return,
            }
        };
        if peer_choking {
            return;
        }
        let peer_id = addr.to_string();
        let next = self
            .piece_manager
            .lock()
            .await
            .next_request_rarest_first(&peer_id, &bitmap);
        if let Some(block_ref) = next {
            let piece_length = self.meta.piece_len(block_ref.piece_index as usize);
            let remaining = piece_length as u32 - block_ref.offset;
            let length = remaining.min(crate::block::MAX_BLOCK_LENGTH);
            if let Some(handle) = self.peers.lock().await.get(&addr) {
                let _ = handle
                    .cmd_tx
                    .send(PeerCommand::Request(block_ref.piece_index, block_ref.offset, length))
                    .await;
            }
        }
    }

    pub async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let handles: Vec<mpsc::Sender<PeerCommand>> = {
            let peers = self.peers.lock().await;
            peers.values().map(|h| h.cmd_tx.clone()).collect()
        };
        let mut snapshots = Vec::with_capacity(handles.len());
        for tx in handles {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(PeerCommand::Status(reply_tx)).await.is_ok() {
                if let Ok(snapshot) = reply_rx.await {
                    snapshots.push(snapshot);
                }
            }
        }
        snapshots
    }

    pub async fn downloaded_bytes(&self) -> u64 {
        self.piece_manager.lock().await.downloaded_bytes
    }

    pub async fn completion_bitmap(&self) -> Vec<bool> {
        self.piece_manager.lock().await.completion_bitmap()
    }

    pub async fn tracker_entries_summary(&self) -> Vec<(String, usize)> {
        let tm = self.tracker_manager.lock().await;
        tm.entries().iter().map(|e| (e.url.clone(), e.tier)).collect()
    }

    /// Stops the retry worker implicitly (no background task owns it
    /// beyond this call's scope), closes every peer socket, and cleans up
    /// the store.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pause_notify.notify_waiters();

        if let Some(handle) = self.retry_task.lock().await.take() {
            handle.abort();
        }

        let addrs: Vec<SocketAddr> = self.peers.lock().await.keys().copied().collect();
        for addr in addrs {
            self.remove_peer(addr).await;
        }
        self.store.lock().await.cleanup();
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_has_expected_shape() {
        let id = generate_peer_id("-PC0001-");
        assert_eq!(&id[0..8], b"-PC0001-");
        assert!(id[8..].iter().all(|b| b.is_ascii_hexdigit()));
    }
}
