//! In-process torrent engine with a deterministic piece store.
//!
//! Pieces complete either under manual control (tests drive every state
//! change) or from a background driver that spends a fixed bandwidth budget
//! per tick, urgent pieces first, then wanted files in order. Readers return
//! synthetic content so byte positions can be verified.

use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::{
    DownloadHandle, EngineError, EngineReader, PieceState, PieceStateChange, PieceStateRun,
    TorrentEngine, TorrentInfo, TransferStats,
};
use crate::config::StorageMode;
use crate::torrent::{InfoHash, MagnetParser};

const DRIVER_TICK: Duration = Duration::from_millis(100);
const PIECE_EVENT_CAPACITY: usize = 1024;

/// Content byte at a torrent-absolute offset.
pub fn synthetic_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Description of a torrent the simulated swarm can serve.
///
/// Doubles as the simulated descriptor file format (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedTorrent {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<(PathBuf, u64)>,
    /// Never deliver metadata, for timeout scenarios
    #[serde(default)]
    pub withhold_metadata: bool,
}

impl SimulatedTorrent {
    /// Creates a torrent whose info hash is derived from its name.
    pub fn new<P: Into<PathBuf>>(
        name: &str,
        piece_length: u64,
        files: impl IntoIterator<Item = (P, u64)>,
    ) -> Self {
        let mut hash = [0u8; 20];
        for (i, byte) in name.bytes().enumerate() {
            hash[i % 20] ^= byte.wrapping_mul(31).wrapping_add(i as u8);
        }

        Self {
            info_hash: InfoHash::new(hash),
            name: name.to_string(),
            piece_length,
            files: files
                .into_iter()
                .map(|(path, length)| (path.into(), length))
                .collect(),
            withhold_metadata: false,
        }
    }

    pub fn withholding_metadata(mut self) -> Self {
        self.withhold_metadata = true;
        self
    }

    pub fn magnet_uri(&self) -> String {
        let name: String = url::form_urlencoded::byte_serialize(self.name.as_bytes()).collect();
        format!("magnet:?xt=urn:btih:{}&dn={name}", self.info_hash)
    }

    pub fn info(&self) -> TorrentInfo {
        TorrentInfo::from_files(&self.name, self.piece_length, &self.files)
    }
}

/// Limits shared between the engine and its download drivers.
#[derive(Debug, Default)]
struct SharedLimits {
    download: Mutex<Option<u64>>,
    upload: Mutex<Option<u64>>,
}

/// Engine serving torrents registered with [`SimulatedEngine::register`].
pub struct SimulatedEngine {
    catalog: Mutex<HashMap<InfoHash, SimulatedTorrent>>,
    downloads: Mutex<HashMap<InfoHash, SimulatedDownload>>,
    bandwidth: Option<u64>,
    metadata_delay: Duration,
    storage_mode: StorageMode,
    limits: Arc<SharedLimits>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    /// Creates an engine whose pieces only change under manual control.
    pub fn new() -> Self {
        Self {
            catalog: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            bandwidth: None,
            metadata_delay: Duration::ZERO,
            storage_mode: StorageMode::File,
            limits: Arc::new(SharedLimits::default()),
        }
    }

    /// Completes pieces in the background at `bytes_per_sec`.
    pub fn with_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.bandwidth = Some(bytes_per_sec);
        self
    }

    pub fn with_metadata_delay(mut self, delay: Duration) -> Self {
        self.metadata_delay = delay;
        self
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Makes a torrent available to the swarm and returns its magnet URI.
    pub fn register(&self, torrent: SimulatedTorrent) -> String {
        let uri = torrent.magnet_uri();
        self.catalog.lock().insert(torrent.info_hash, torrent);
        uri
    }

    /// Test access to an added download.
    pub fn download(&self, info_hash: InfoHash) -> Option<SimulatedDownload> {
        self.downloads.lock().get(&info_hash).cloned()
    }

    pub fn download_limit(&self) -> Option<u64> {
        *self.limits.download.lock()
    }

    pub fn upload_limit(&self) -> Option<u64> {
        *self.limits.upload.lock()
    }

    fn add_registered(&self, info_hash: InfoHash) -> Result<SimulatedDownload, EngineError> {
        if let Some(existing) = self.downloads.lock().get(&info_hash) {
            if !existing.is_dropped() {
                return Ok(existing.clone());
            }
        }

        let torrent = self
            .catalog
            .lock()
            .get(&info_hash)
            .cloned()
            .ok_or_else(|| EngineError::Rejected {
                reason: format!("no simulated swarm for {info_hash}"),
            })?;

        let download = SimulatedDownload::new(torrent);
        self.downloads.lock().insert(info_hash, download.clone());

        if !download.shared.torrent.withhold_metadata {
            let delayed = download.clone();
            let delay = self.metadata_delay;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                delayed.publish_info();
            });
        }

        if let Some(bandwidth) = self.bandwidth {
            let driven = download.clone();
            let limits = Arc::clone(&self.limits);
            tokio::spawn(async move {
                drive_download(driven, bandwidth, limits).await;
            });
        }

        info!("Simulated engine added torrent {}", info_hash);
        Ok(download)
    }
}

async fn drive_download(download: SimulatedDownload, bandwidth: u64, limits: Arc<SharedLimits>) {
    let mut ticker = tokio::time::interval(DRIVER_TICK);
    let ticks_per_sec = (Duration::from_secs(1).as_millis() / DRIVER_TICK.as_millis()) as u64;

    loop {
        ticker.tick().await;
        if download.is_dropped() {
            break;
        }
        if download.max_connections() == 0 || !download.has_info() {
            continue;
        }

        let rate = match *limits.download.lock() {
            Some(limit) => bandwidth.min(limit),
            None => bandwidth,
        };
        download.step(rate / ticks_per_sec);
    }

    debug!(
        "Simulated driver for {} stopped",
        download.shared.torrent.info_hash
    );
}

#[async_trait]
impl TorrentEngine for SimulatedEngine {
    async fn add_magnet(&self, uri: &str) -> Result<Arc<dyn DownloadHandle>, EngineError> {
        let link =
            MagnetParser::parse_magnet_link(uri).map_err(|e| EngineError::InvalidSource {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        let download = self.add_registered(link.info_hash)?;
        Ok(Arc::new(download))
    }

    async fn add_torrent_file(&self, path: &Path) -> Result<Arc<dyn DownloadHandle>, EngineError> {
        let bytes = tokio::fs::read(path).await?;
        let torrent: SimulatedTorrent =
            serde_json::from_slice(&bytes).map_err(|e| EngineError::InvalidSource {
                uri: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let info_hash = torrent.info_hash;
        self.catalog.lock().entry(info_hash).or_insert(torrent);
        let download = self.add_registered(info_hash)?;
        Ok(Arc::new(download))
    }

    fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    fn set_download_limit(&self, limit: Option<u64>) {
        *self.limits.download.lock() = limit;
    }

    fn set_upload_limit(&self, limit: Option<u64>) {
        *self.limits.upload.lock() = limit;
    }
}

#[derive(Debug)]
struct PieceStore {
    missing: Vec<u64>,
    checking: Vec<bool>,
    wanted_files: Vec<bool>,
    urgent: BTreeSet<u32>,
    downloaded: u64,
}

struct Shared {
    torrent: SimulatedTorrent,
    info: Arc<TorrentInfo>,
    has_info: watch::Sender<bool>,
    store: Mutex<PieceStore>,
    events: broadcast::Sender<PieceStateChange>,
    uploaded: AtomicU64,
    max_connections: AtomicUsize,
    dropped: AtomicBool,
}

/// A torrent inside the simulated engine. Cloning shares the same state.
#[derive(Clone)]
pub struct SimulatedDownload {
    shared: Arc<Shared>,
}

impl SimulatedDownload {
    fn new(torrent: SimulatedTorrent) -> Self {
        let info = Arc::new(torrent.info());
        let missing = (0..info.piece_count).map(|p| info.piece_size(p)).collect();
        let store = PieceStore {
            missing,
            checking: vec![false; info.piece_count as usize],
            wanted_files: vec![false; info.files.len()],
            urgent: BTreeSet::new(),
            downloaded: 0,
        };
        let (has_info, _) = watch::channel(false);
        let (events, _) = broadcast::channel(PIECE_EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                torrent,
                info,
                has_info,
                store: Mutex::new(store),
                events,
                uploaded: AtomicU64::new(0),
                max_connections: AtomicUsize::new(usize::MAX),
                dropped: AtomicBool::new(false),
            }),
        }
    }

    /// Makes metadata available immediately.
    pub fn publish_info(&self) {
        self.shared.has_info.send_replace(true);
    }

    pub fn has_info(&self) -> bool {
        *self.shared.has_info.borrow()
    }

    /// Sets the missing byte count of a piece and emits a change event.
    pub fn set_piece_missing(&self, piece: u32, missing: u64) {
        let state = {
            let mut store = self.shared.store.lock();
            let Some(slot) = store.missing.get_mut(piece as usize) else {
                return;
            };
            let before = *slot;
            *slot = missing.min(self.shared.info.piece_size(piece));
            store.downloaded += before.saturating_sub(missing);
            self.state_of(&store, piece)
        };
        let _ = self
            .shared
            .events
            .send(PieceStateChange { index: piece, state });
    }

    pub fn complete_piece(&self, piece: u32) {
        self.set_piece_missing(piece, 0);
    }

    pub fn complete_all(&self) {
        for piece in 0..self.shared.info.piece_count {
            self.complete_piece(piece);
        }
    }

    /// Marks pieces as undergoing verification.
    pub fn set_checking(&self, pieces: std::ops::Range<u32>, checking: bool) {
        for piece in pieces {
            let state = {
                let mut store = self.shared.store.lock();
                let Some(flag) = store.checking.get_mut(piece as usize) else {
                    continue;
                };
                *flag = checking;
                self.state_of(&store, piece)
            };
            let _ = self
                .shared
                .events
                .send(PieceStateChange { index: piece, state });
        }
    }

    pub fn record_upload(&self, bytes: u64) {
        self.shared.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn is_file_wanted(&self, file_index: usize) -> bool {
        self.shared
            .store
            .lock()
            .wanted_files
            .get(file_index)
            .copied()
            .unwrap_or(false)
    }

    pub fn urgent_pieces(&self) -> Vec<u32> {
        self.shared.store.lock().urgent.iter().copied().collect()
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections.load(Ordering::Relaxed)
    }

    pub fn is_dropped(&self) -> bool {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Spends up to `budget` bytes on the next pieces to fetch.
    ///
    /// Returns the number of bytes applied.
    pub fn step(&self, budget: u64) -> u64 {
        let mut remaining = budget;
        while remaining > 0 {
            let Some((piece, missing)) = self.next_piece() else {
                break;
            };
            let take = missing.min(remaining);
            self.set_piece_missing(piece, missing - take);
            remaining -= take;
        }
        budget - remaining
    }

    fn next_piece(&self) -> Option<(u32, u64)> {
        let mut guard = self.shared.store.lock();
        let store = &mut *guard;
        let fetchable = |store: &PieceStore, piece: u32| {
            let i = piece as usize;
            store.missing[i] > 0 && !store.checking[i]
        };

        let missing = &store.missing;
        store.urgent.retain(|piece| missing[*piece as usize] > 0);
        if let Some(piece) = store
            .urgent
            .iter()
            .copied()
            .find(|p| fetchable(&*store, *p))
        {
            return Some((piece, store.missing[piece as usize]));
        }

        let info = &self.shared.info;
        for file in info.files.iter().filter(|f| store.wanted_files[f.index]) {
            if file.length == 0 {
                continue;
            }
            let first = (file.offset / info.piece_length) as u32;
            let last = ((file.end() - 1) / info.piece_length) as u32;
            if let Some(piece) = (first..=last).find(|p| fetchable(&*store, *p)) {
                return Some((piece, store.missing[piece as usize]));
            }
        }
        None
    }

    fn state_of(&self, store: &PieceStore, piece: u32) -> PieceState {
        let i = piece as usize;
        let missing = store.missing[i];
        let checking = store.checking[i];
        PieceState {
            complete: missing == 0 && !checking,
            partial: missing > 0 && missing < self.shared.info.piece_size(piece),
            checking,
        }
    }

    fn prioritize_bytes(shared: &Shared, offset: u64, length: u64) {
        if length == 0 || shared.info.piece_length == 0 {
            return;
        }
        let first = (offset / shared.info.piece_length) as u32;
        let last = ((offset + length - 1) / shared.info.piece_length) as u32;
        let last = last.min(shared.info.piece_count.saturating_sub(1));
        let mut store = shared.store.lock();
        store.urgent.extend(first..=last);
    }
}

#[async_trait]
impl DownloadHandle for SimulatedDownload {
    fn info_hash(&self) -> InfoHash {
        self.shared.torrent.info_hash
    }

    fn name(&self) -> String {
        self.shared.torrent.name.clone()
    }

    fn info(&self) -> Option<Arc<TorrentInfo>> {
        self.has_info().then(|| Arc::clone(&self.shared.info))
    }

    async fn wait_for_info(&self) {
        let mut rx = self.shared.has_info.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn metainfo_bytes(&self) -> Option<Bytes> {
        if !self.has_info() {
            return None;
        }
        serde_json::to_vec(&self.shared.torrent).ok().map(Bytes::from)
    }

    fn piece_state_runs(&self) -> Vec<PieceStateRun> {
        let store = self.shared.store.lock();
        PieceStateRun::encode((0..self.shared.info.piece_count).map(|p| self.state_of(&store, p)))
    }

    fn piece_bytes_missing(&self, piece: u32) -> u64 {
        let store = self.shared.store.lock();
        store.missing.get(piece as usize).copied().unwrap_or(0)
    }

    fn bytes_completed(&self) -> u64 {
        let store = self.shared.store.lock();
        (0..self.shared.info.piece_count)
            .filter(|p| self.state_of(&store, *p).complete)
            .map(|p| self.shared.info.piece_size(p))
            .sum()
    }

    fn file_bytes_completed(&self, file_index: usize) -> u64 {
        let info = &self.shared.info;
        let Some(file) = info.file(file_index) else {
            return 0;
        };
        if file.length == 0 {
            return 0;
        }
        let first = (file.offset / info.piece_length) as u32;
        let last = ((file.end() - 1) / info.piece_length) as u32;
        let store = self.shared.store.lock();
        (first..=last)
            .filter(|p| self.state_of(&store, *p).complete)
            .map(|p| {
                let start = p as u64 * info.piece_length;
                let end = start + info.piece_size(p);
                end.min(file.end()) - start.max(file.offset)
            })
            .sum()
    }

    fn stats(&self) -> TransferStats {
        let connections = self.max_connections().min(8);
        TransferStats {
            bytes_read: self.shared.store.lock().downloaded,
            bytes_written: self.shared.uploaded.load(Ordering::Relaxed),
            active_peers: connections,
            total_peers: 8,
            connected_seeders: connections / 2,
        }
    }

    fn subscribe_piece_changes(&self) -> broadcast::Receiver<PieceStateChange> {
        self.shared.events.subscribe()
    }

    fn download_file(&self, file_index: usize) {
        if let Some(wanted) = self.shared.store.lock().wanted_files.get_mut(file_index) {
            *wanted = true;
        }
    }

    fn cancel_file(&self, file_index: usize) {
        if let Some(wanted) = self.shared.store.lock().wanted_files.get_mut(file_index) {
            *wanted = false;
        }
    }

    fn set_max_established_connections(&self, max: usize) {
        self.shared.max_connections.store(max, Ordering::Relaxed);
    }

    fn new_reader(&self) -> Box<dyn EngineReader> {
        Box::new(SimulatedReader {
            shared: Arc::clone(&self.shared),
            position: 0,
        })
    }

    fn pin_region(&self, offset: u64, length: u64) {
        Self::prioritize_bytes(&self.shared, offset, length);
    }

    fn drop_torrent(&self) {
        self.shared.dropped.store(true, Ordering::Relaxed);
        debug!("Simulated torrent {} dropped", self.shared.torrent.info_hash);
    }
}

/// Reader returning [`synthetic_byte`] content for the whole torrent.
struct SimulatedReader {
    shared: Arc<Shared>,
    position: u64,
}

impl AsyncRead for SimulatedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let total = self.shared.info.total_length;
        let available = total.saturating_sub(self.position);
        let count = (buf.remaining() as u64).min(available);
        let start = self.position;
        let bytes: Vec<u8> = (start..start + count).map(synthetic_byte).collect();
        buf.put_slice(&bytes);
        self.position += count;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for SimulatedReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let total = self.shared.info.total_length as i128;
        let target = match position {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => total + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of torrent",
            ));
        }
        self.position = target as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

impl EngineReader for SimulatedReader {
    fn set_readahead(&mut self, bytes: u64) {
        SimulatedDownload::prioritize_bytes(&self.shared, self.position, bytes);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use super::*;

    fn movie() -> SimulatedTorrent {
        SimulatedTorrent::new("movie", 1000, [("movie/movie.mkv", 4500u64)])
    }

    #[tokio::test]
    async fn test_add_magnet_and_publish_info() {
        let engine = SimulatedEngine::new();
        let uri = engine.register(movie());

        let handle = engine.add_magnet(&uri).await.unwrap();
        handle.wait_for_info().await;

        let info = handle.info().unwrap();
        assert_eq!(info.piece_count, 5);
        assert_eq!(handle.name(), "movie");
    }

    #[tokio::test]
    async fn test_unknown_magnet_rejected() {
        let engine = SimulatedEngine::new();
        let uri = movie().magnet_uri();
        assert!(matches!(
            engine.add_magnet(&uri).await,
            Err(EngineError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_piece_events_and_completion_counters() {
        let engine = SimulatedEngine::new();
        let torrent = movie();
        let info_hash = torrent.info_hash;
        let uri = engine.register(torrent);
        let handle = engine.add_magnet(&uri).await.unwrap();
        let sim = engine.download(info_hash).unwrap();
        let mut events = handle.subscribe_piece_changes();

        sim.set_piece_missing(0, 400);
        let change = events.recv().await.unwrap();
        assert_eq!(change.index, 0);
        assert!(change.state.partial);

        sim.complete_piece(0);
        sim.complete_piece(4);
        assert_eq!(handle.bytes_completed(), 1000 + 500);
        assert_eq!(handle.file_bytes_completed(0), 1500);
        assert_eq!(handle.piece_bytes_missing(1), 1000);
    }

    #[tokio::test]
    async fn test_step_prefers_urgent_pieces() {
        let engine = SimulatedEngine::new();
        let torrent = movie();
        let info_hash = torrent.info_hash;
        let uri = engine.register(torrent);
        let handle = engine.add_magnet(&uri).await.unwrap();
        let sim = engine.download(info_hash).unwrap();

        handle.download_file(0);
        handle.pin_region(4000, 500);
        sim.step(500);

        assert_eq!(handle.piece_bytes_missing(4), 0);
        assert_eq!(handle.piece_bytes_missing(0), 1000);

        sim.step(1500);
        assert_eq!(handle.piece_bytes_missing(0), 0);
        assert_eq!(handle.piece_bytes_missing(1), 500);
    }

    #[tokio::test]
    async fn test_reader_returns_synthetic_content() {
        let engine = SimulatedEngine::new();
        let uri = engine.register(movie());
        let handle = engine.add_magnet(&uri).await.unwrap();

        let mut reader = handle.new_reader();
        reader.seek(SeekFrom::Start(300)).await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();

        assert_eq!(buf, [300u64, 301, 302, 303].map(synthetic_byte));
    }

    #[tokio::test]
    async fn test_descriptor_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SimulatedEngine::new();
        let uri = engine.register(movie());
        let handle = engine.add_magnet(&uri).await.unwrap();
        handle.wait_for_info().await;

        let path = dir.path().join("movie.torrent");
        std::fs::write(&path, handle.metainfo_bytes().unwrap()).unwrap();

        let other = SimulatedEngine::new();
        let readded = other.add_torrent_file(&path).await.unwrap();
        assert_eq!(readded.info_hash(), handle.info_hash());
    }
}
