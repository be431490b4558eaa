//! Playback-aware wrapper around one torrent in the engine.
//!
//! A [`StreamingDownload`] owns the buffer window bookkeeping, smoothed
//! rates, seeding timer and library linkage of one download. A single event
//! loop task per download is the only writer of buffer, seeding and rate
//! state; every other task reads through shared locks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::outcome::SingleShot;
use super::piece_window::{PieceWindow, PieceWindowError, effective_buffer_size};
use super::rate::RateSample;
use super::reader::{ReaderError, SequentialReader};
use super::state::{DownloadState, StateInputs, derive_state, progress_percent};
use crate::config::{StorageMode, StreamingConfig};
use crate::engine::{DownloadHandle, PieceStateChange};
use crate::session::limits::RateLimits;
use crate::storage::{DownloadRecord, RecordStore, lookup_record};
use crate::torrent::InfoHash;

/// Errors raised by streaming download operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Torrent metadata is not available yet")]
    MetadataUnavailable,

    #[error("File index {index} out of range ({count} files)")]
    FileNotFound { index: usize, count: usize },

    #[error("Invalid buffer window: {0}")]
    Window(#[from] PieceWindowError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Download {info_hash} is closed")]
    Closed { info_hash: InfoHash },
}

/// Why a buffer wait ended without the window being ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferInterrupted {
    #[error("a newer buffer request replaced this one")]
    Superseded,

    #[error("the download was closed")]
    Closed,
}

/// Result delivered once a buffer request settles.
pub type BufferResult = Result<(), BufferInterrupted>;

/// Library or player item a stream was matched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedItem {
    pub id: String,
    pub title: String,
}

/// Resolves which external library item a download corresponds to.
#[async_trait]
pub trait ItemLookup: Send + Sync {
    async fn find_item(&self, info_hash: InfoHash, name: &str) -> Option<LinkedItem>;
}

/// Independent flags describing the download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadFlags {
    pub is_buffering: bool,
    pub is_seeding: bool,
    pub is_paused: bool,
    pub is_rar_archive: bool,
    pub is_playing: bool,
}

/// Smoothed transfer rates in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferRates {
    pub download: u64,
    pub upload: u64,
}

/// Missing-byte counts for the pieces of the active buffer window.
///
/// The window is contiguous, so counts live in a vector indexed from
/// `start_piece` rather than a map.
#[derive(Debug)]
struct BufferTracker {
    window: Option<PieceWindow>,
    missing: Vec<u64>,
    /// -1 until buffering first starts
    progress: f64,
}

impl Default for BufferTracker {
    fn default() -> Self {
        Self {
            window: None,
            missing: Vec::new(),
            progress: -1.0,
        }
    }
}

impl BufferTracker {
    fn start(&mut self, window: PieceWindow, missing: Vec<u64>) {
        self.window = Some(window);
        self.missing = missing;
        self.progress = 0.0;
        self.recompute();
    }

    /// Updates one piece; returns false for pieces outside the window.
    fn update(&mut self, piece: u32, missing: u64) -> bool {
        let Some(window) = self.window else {
            return false;
        };
        if !window.contains(piece) {
            return false;
        }
        self.missing[(piece - window.start_piece) as usize] = missing;
        self.recompute();
        true
    }

    fn recompute(&mut self) -> f64 {
        let Some(window) = self.window else {
            return self.progress;
        };
        let total = window.byte_length() as f64;
        let missing: u64 = self.missing.iter().sum();
        let computed = if missing == 0 {
            100.0
        } else {
            (100.0 * (1.0 - missing as f64 / total)).clamp(0.0, 100.0)
        };
        // Never move backwards while buffering.
        self.progress = self.progress.max(computed);
        self.progress
    }

    fn is_complete(&self) -> bool {
        self.window.is_some() && self.progress >= 100.0
    }

    fn incomplete(&self) -> Vec<(u32, u64)> {
        let Some(window) = self.window else {
            return Vec::new();
        };
        window
            .pieces()
            .zip(self.missing.iter().copied())
            .filter(|(_, missing)| *missing > 0)
            .collect()
    }

    fn finish(&mut self) {
        self.window = None;
        self.missing.clear();
    }
}

/// Human-readable snapshot for status overlays and dialogs.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadStatus {
    pub name: String,
    pub state: DownloadState,
    pub progress: f64,
    pub buffer_progress: f64,
    pub rates: TransferRates,
    pub active_peers: usize,
    pub total_peers: usize,
    pub seeds: usize,
    pub paused: bool,
}

impl DownloadStatus {
    /// Lines suitable for a multi-line overlay.
    pub fn lines(&self) -> Vec<String> {
        let state = if self.paused {
            format!("{} (paused)", self.state)
        } else {
            self.state.to_string()
        };
        let progress = if self.state == DownloadState::Buffering {
            self.buffer_progress
        } else {
            self.progress
        };
        vec![
            self.name.clone(),
            format!("{state} {progress:.2}%"),
            format!(
                "D: {} U: {}",
                format_rate(self.rates.download),
                format_rate(self.rates.upload)
            ),
            format!(
                "P: {}/{} S: {}",
                self.active_peers, self.total_peers, self.seeds
            ),
        ]
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lines().join(" | "))
    }
}

fn format_rate(bytes_per_sec: u64) -> String {
    const KIB: f64 = 1024.0;
    let rate = bytes_per_sec as f64;
    if rate >= KIB * KIB {
        format!("{:.2} MB/s", rate / (KIB * KIB))
    } else {
        format!("{:.2} kB/s", rate / KIB)
    }
}

enum LoopCommand {
    StartBuffering {
        window: PieceWindow,
        reader: SequentialReader,
        done: SingleShot<BufferResult>,
        responder: oneshot::Sender<()>,
    },
}

/// Collaborators a download needs besides the engine handle.
#[derive(Clone)]
pub struct DownloadContext {
    pub config: StreamingConfig,
    pub storage_mode: StorageMode,
    pub limits: Arc<RateLimits>,
    pub records: Arc<dyn RecordStore>,
    pub item_lookup: Option<Arc<dyn ItemLookup>>,
}

/// One active download as seen by playback.
pub struct StreamingDownload {
    handle: Arc<dyn DownloadHandle>,
    info_hash: InfoHash,
    ctx: DownloadContext,
    flags: RwLock<DownloadFlags>,
    buffer: RwLock<BufferTracker>,
    chosen_files: RwLock<Vec<usize>>,
    rates: RwLock<TransferRates>,
    record: RwLock<Option<DownloadRecord>>,
    linked_item: RwLock<Option<LinkedItem>>,
    commands: mpsc::UnboundedSender<LoopCommand>,
    close_tx: watch::Sender<bool>,
}

impl fmt::Debug for StreamingDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingDownload")
            .field("info_hash", &self.info_hash)
            .field("flags", &*self.flags.read())
            .field("chosen_files", &*self.chosen_files.read())
            .finish()
    }
}

impl StreamingDownload {
    /// Wraps an engine handle and starts its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(handle: Arc<dyn DownloadHandle>, ctx: DownloadContext) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let pieces = handle.subscribe_piece_changes();

        let download = Arc::new(Self {
            info_hash: handle.info_hash(),
            handle,
            ctx,
            flags: RwLock::new(DownloadFlags::default()),
            buffer: RwLock::new(BufferTracker::default()),
            chosen_files: RwLock::new(Vec::new()),
            rates: RwLock::new(TransferRates::default()),
            record: RwLock::new(None),
            linked_item: RwLock::new(None),
            commands,
            close_tx,
        });

        let event_loop = EventLoop::new(Arc::clone(&download), pieces, command_rx, close_rx);
        tokio::spawn(event_loop.run());
        download
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> String {
        self.handle
            .info()
            .map(|info| info.name.clone())
            .unwrap_or_else(|| self.handle.name())
    }

    /// Underlying engine handle.
    pub fn handle(&self) -> &Arc<dyn DownloadHandle> {
        &self.handle
    }

    pub fn flags(&self) -> DownloadFlags {
        *self.flags.read()
    }

    pub fn rates(&self) -> TransferRates {
        *self.rates.read()
    }

    pub fn chosen_files(&self) -> Vec<usize> {
        self.chosen_files.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Marks `file_index` for download. Files never chosen stay unfetched.
    pub fn download_file(&self, file_index: usize) {
        {
            let mut chosen = self.chosen_files.write();
            if !chosen.contains(&file_index) {
                chosen.push(file_index);
            }
        }
        self.handle.download_file(file_index);
        debug!("Download {} file {} selected", self.info_hash, file_index);
    }

    /// Starts buffering the window at the beginning of `file_index`.
    ///
    /// The returned signal resolves once every window piece is present, or
    /// with an interruption if another buffer request or close intervenes.
    ///
    /// # Errors
    ///
    /// - `StreamingError::MetadataUnavailable` - Torrent info not known yet
    /// - `StreamingError::FileNotFound` - Index outside the file list
    /// - `StreamingError::Reader` - The priming reader could not be opened
    /// - `StreamingError::Closed` - The event loop has stopped
    pub async fn buffer(
        &self,
        file_index: usize,
    ) -> Result<SingleShot<BufferResult>, StreamingError> {
        let info = self
            .handle
            .info()
            .ok_or(StreamingError::MetadataUnavailable)?;
        let file = info.file(file_index).ok_or(StreamingError::FileNotFound {
            index: file_index,
            count: info.files.len(),
        })?;

        let buffer_size = effective_buffer_size(&self.ctx.config, self.ctx.storage_mode);
        let window = PieceWindow::compute(
            file.offset,
            file.length,
            info.piece_length,
            buffer_size,
            self.ctx.config.tail_pin_bytes,
        )?;

        self.download_file(file_index);

        // Only needed to push read-ahead priority; closed once buffered.
        let reader = SequentialReader::open(
            self.handle.as_ref(),
            file_index,
            window.byte_length(),
            self.ctx.config.reader_watchdog_interval,
        )
        .await?;

        let (tail_offset, tail_length) = window.tail_region();
        self.handle.pin_region(tail_offset, tail_length);

        info!(
            "Buffering {} file {}: pieces {}..={} ({} bytes), tail pin {} bytes",
            self.info_hash,
            file_index,
            window.start_piece,
            window.end_piece,
            window.byte_length(),
            tail_length
        );

        let done = SingleShot::new();
        let (responder, accepted) = oneshot::channel();
        self.commands
            .send(LoopCommand::StartBuffering {
                window,
                reader,
                done: done.clone(),
                responder,
            })
            .map_err(|_| StreamingError::Closed {
                info_hash: self.info_hash,
            })?;
        accepted.await.map_err(|_| StreamingError::Closed {
            info_hash: self.info_hash,
        })?;

        Ok(done)
    }

    /// Completion of the chosen files, in `[0, 100]`.
    pub fn progress(&self) -> f64 {
        let (completed, total) = self.chosen_totals();
        progress_percent(completed, total)
    }

    /// Bytes of the chosen files still to download, or of the whole torrent
    /// when nothing was chosen yet.
    pub fn remaining_bytes(&self) -> u64 {
        let Some(info) = self.handle.info() else {
            return 0;
        };
        if self.chosen_files.read().is_empty() {
            return info
                .total_length
                .saturating_sub(self.handle.bytes_completed());
        }
        let (completed, total) = self.chosen_totals();
        total.saturating_sub(completed)
    }

    /// Buffer window progress in `[0, 100]`, or -1 before buffering starts.
    pub fn buffer_progress(&self) -> f64 {
        // While verifying, report whole-torrent verification progress rather
        // than the window. Checking blocks all downloading, so the window
        // would sit still while the user waits on the whole torrent.
        if self.state() == DownloadState::Checking {
            return match self.handle.info() {
                Some(info) => progress_percent(self.handle.bytes_completed(), info.total_length),
                None => 0.0,
            };
        }
        self.buffer.read().progress
    }

    /// Derived display state, computed fresh on every call.
    pub fn state(&self) -> DownloadState {
        let flags = self.flags();
        let runs = self.handle.piece_state_runs();
        let (completed, total) = self.chosen_totals();
        derive_state(&StateInputs {
            is_buffering: flags.is_buffering,
            is_seeding: flags.is_seeding,
            runs: &runs,
            bytes_completed: completed,
            total_bytes: total,
        })
    }

    /// Stops establishing connections.
    pub fn pause(&self) {
        self.handle.set_max_established_connections(0);
        self.flags.write().is_paused = true;
        info!("Download {} paused", self.info_hash);
    }

    /// Restores the connection cap that applies to the current phase.
    pub fn resume(&self) {
        let connections = if self.flags().is_seeding {
            self.ctx.config.seeding_connections
        } else {
            self.ctx.config.max_connections
        };
        self.handle.set_max_established_connections(connections);
        self.flags.write().is_paused = false;
        info!("Download {} resumed", self.info_hash);
    }

    pub fn set_playing(&self, playing: bool) {
        self.flags.write().is_playing = playing;
    }

    pub fn set_rar_archive(&self, is_archive: bool) {
        self.flags.write().is_rar_archive = is_archive;
    }

    /// Opens a seekable stream over one chosen file for serving.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Reader` - Metadata missing or bad file index
    pub async fn open_reader(&self, file_index: usize) -> Result<SequentialReader, StreamingError> {
        let readahead = effective_buffer_size(&self.ctx.config, self.ctx.storage_mode);
        Ok(SequentialReader::open(
            self.handle.as_ref(),
            file_index,
            readahead,
            self.ctx.config.reader_watchdog_interval,
        )
        .await?)
    }

    /// Cached persistence record, if one was found or written.
    pub fn record(&self) -> Option<DownloadRecord> {
        self.record.read().clone()
    }

    /// Writes the persistence record and caches it. Failures are logged.
    pub async fn set_record(&self, record: DownloadRecord) {
        if let Err(e) = self.ctx.records.set(self.info_hash, record.clone()).await {
            warn!("Failed to store record for {}: {}", self.info_hash, e);
        }
        *self.record.write() = Some(record);
    }

    pub fn linked_item(&self) -> Option<LinkedItem> {
        self.linked_item.read().clone()
    }

    /// Status snapshot for overlays.
    pub fn status(&self) -> DownloadStatus {
        let stats = self.handle.stats();
        let flags = self.flags();
        DownloadStatus {
            name: self.name(),
            state: self.state(),
            progress: self.progress(),
            buffer_progress: self.buffer_progress(),
            rates: self.rates(),
            active_peers: stats.active_peers,
            total_peers: stats.total_peers,
            seeds: stats.connected_seeders,
            paused: flags.is_paused,
        }
    }

    /// Stops the event loop. Pending buffer waits resolve as closed.
    pub fn close(&self) {
        if !self.close_tx.send_replace(true) {
            debug!("Closing download {}", self.info_hash);
        }
    }

    fn chosen_totals(&self) -> (u64, u64) {
        let Some(info) = self.handle.info() else {
            return (0, 0);
        };
        let chosen = self.chosen_files.read();
        chosen
            .iter()
            .filter_map(|index| info.file(*index))
            .fold((0, 0), |(completed, total), file| {
                (
                    completed + self.handle.file_bytes_completed(file.index),
                    total + file.length,
                )
            })
    }
}

/// Loop-private state of one download.
struct EventLoop {
    download: Arc<StreamingDownload>,
    pieces: Option<broadcast::Receiver<PieceStateChange>>,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    close_rx: watch::Receiver<bool>,
    reader: Option<SequentialReader>,
    pending: Option<SingleShot<BufferResult>>,
    download_rate: RateSample,
    upload_rate: RateSample,
    record_resolved: bool,
    seed_deadline: Option<Instant>,
    seeding_done: bool,
    linkage: Option<Interval>,
    linkage_attempts: u32,
}

impl EventLoop {
    fn new(
        download: Arc<StreamingDownload>,
        pieces: broadcast::Receiver<PieceStateChange>,
        commands: mpsc::UnboundedReceiver<LoopCommand>,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        let linkage = download.ctx.item_lookup.as_ref().map(|_| {
            let mut ticker = tokio::time::interval(download.ctx.config.linkage_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        Self {
            download,
            pieces: Some(pieces),
            commands,
            close_rx,
            reader: None,
            pending: None,
            download_rate: RateSample::new(),
            upload_rate: RateSample::new(),
            record_resolved: false,
            seed_deadline: None,
            seeding_done: false,
            linkage,
            linkage_attempts: 0,
        }
    }

    async fn run(mut self) {
        let config = self.download.ctx.config.clone();
        let mut rate_ticker = tokio::time::interval(config.rate_interval);
        rate_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check_ticker = tokio::time::interval(config.progress_check_interval);
        check_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Event loop for {} started", self.download.info_hash);

        loop {
            tokio::select! {
                changed = self.close_rx.changed() => {
                    if changed.is_err() || *self.close_rx.borrow() {
                        break;
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }
                event = next_piece_change(&mut self.pieces) => {
                    self.handle_piece_event(event);
                }
                _ = rate_ticker.tick() => {
                    self.sample_rates();
                    self.resolve_record().await;
                    self.check_seeding();
                }
                _ = check_ticker.tick() => {
                    self.check_buffer_consistency();
                }
                _ = wait_until(self.seed_deadline) => {
                    self.stop_seeding();
                }
                _ = tick_optional(&mut self.linkage) => {
                    self.try_linkage().await;
                }
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::StartBuffering {
                window,
                reader,
                done,
                responder,
            } => {
                let download = &self.download;
                let missing = window
                    .pieces()
                    .map(|piece| download.handle.piece_bytes_missing(piece))
                    .collect();

                if let Some(previous) = self.pending.take() {
                    previous.resolve(Err(BufferInterrupted::Superseded));
                }
                if let Some(previous) = self.reader.take() {
                    previous.close();
                }

                let was_buffering = {
                    let mut flags = download.flags.write();
                    std::mem::replace(&mut flags.is_buffering, true)
                };
                if !was_buffering {
                    download.ctx.limits.release_for_buffering();
                }
                download.buffer.write().start(window, missing);

                self.reader = Some(reader);
                self.pending = Some(done);
                let _ = responder.send(());
                self.complete_if_ready();
            }
        }
    }

    fn handle_piece_event(&mut self, event: Result<PieceStateChange, RecvError>) {
        match event {
            Ok(change) => {
                if !self.download.flags().is_buffering {
                    return;
                }
                let missing = self.download.handle.piece_bytes_missing(change.index);
                if self.download.buffer.write().update(change.index, missing) {
                    self.complete_if_ready();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(
                    "Download {} missed {} piece events, recomputing",
                    self.download.info_hash, skipped
                );
                self.refresh_window();
            }
            Err(RecvError::Closed) => {
                debug!(
                    "Piece events for {} closed",
                    self.download.info_hash
                );
                self.pieces = None;
            }
        }
    }

    /// Reloads every window piece from the engine.
    fn refresh_window(&mut self) {
        if !self.download.flags().is_buffering {
            return;
        }
        let handle = &self.download.handle;
        {
            let mut tracker = self.download.buffer.write();
            let Some(window) = tracker.window else {
                return;
            };
            for piece in window.pieces() {
                tracker.update(piece, handle.piece_bytes_missing(piece));
            }
        }
        self.complete_if_ready();
    }

    fn check_buffer_consistency(&mut self) {
        self.refresh_window();
        if !self.download.flags().is_buffering {
            return;
        }
        let (progress, incomplete) = {
            let tracker = self.download.buffer.read();
            (tracker.progress, tracker.incomplete())
        };
        debug!(
            "Buffer {} at {:.2}%, incomplete pieces: {:?}",
            self.download.info_hash, progress, incomplete
        );
    }

    fn complete_if_ready(&mut self) {
        if !self.download.buffer.read().is_complete() {
            return;
        }
        self.download.buffer.write().finish();
        self.download.flags.write().is_buffering = false;
        self.download.ctx.limits.restore_after_buffering();

        if let Some(reader) = self.reader.take() {
            reader.close();
        }
        if let Some(done) = self.pending.take() {
            done.resolve(Ok(()));
        }
        info!("Buffer for {} is ready", self.download.info_hash);
    }

    fn sample_rates(&mut self) {
        let stats = self.download.handle.stats();
        let rates = TransferRates {
            download: self.download_rate.record(stats.bytes_read),
            upload: self.upload_rate.record(stats.bytes_written),
        };
        *self.download.rates.write() = rates;
    }

    async fn resolve_record(&mut self) {
        if self.record_resolved {
            return;
        }
        if self.download.record.read().is_some() {
            self.record_resolved = true;
            return;
        }
        let download = &self.download;
        if let Some(record) = lookup_record(download.ctx.records.as_ref(), download.info_hash).await
        {
            debug!(
                "Download {} linked to catalog entry {}",
                download.info_hash, record.catalog_id
            );
            *download.record.write() = Some(record);
            self.record_resolved = true;
        }
    }

    fn check_seeding(&mut self) {
        let flags = self.download.flags();
        if self.seeding_done || flags.is_seeding || flags.is_buffering {
            return;
        }
        if self.download.chosen_files.read().is_empty() || self.download.progress() < 100.0 {
            return;
        }

        let config = &self.download.ctx.config;
        if config.seed_time.is_zero() {
            self.seeding_done = true;
            self.download.handle.set_max_established_connections(0);
            info!(
                "Download {} finished, seeding disabled",
                self.download.info_hash
            );
            return;
        }

        self.download.flags.write().is_seeding = true;
        if !flags.is_paused {
            self.download
                .handle
                .set_max_established_connections(config.seeding_connections);
        }
        self.seed_deadline = Some(Instant::now() + config.seed_time);
        info!(
            "Download {} finished, seeding for {:?}",
            self.download.info_hash, config.seed_time
        );
    }

    fn stop_seeding(&mut self) {
        self.seed_deadline = None;
        self.seeding_done = true;
        self.download.flags.write().is_seeding = false;
        self.download.handle.set_max_established_connections(0);
        info!("Download {} stopped seeding", self.download.info_hash);
    }

    async fn try_linkage(&mut self) {
        let Some(lookup) = self.download.ctx.item_lookup.clone() else {
            self.linkage = None;
            return;
        };
        self.linkage_attempts += 1;
        let name = self.download.name();
        if let Some(item) = lookup.find_item(self.download.info_hash, &name).await {
            debug!(
                "Download {} linked to player item {}",
                self.download.info_hash, item.id
            );
            *self.download.linked_item.write() = Some(item);
            self.linkage = None;
            return;
        }
        if self.linkage_attempts >= self.download.ctx.config.linkage_attempts {
            debug!(
                "Giving up linking {} after {} attempts",
                self.download.info_hash, self.linkage_attempts
            );
            self.linkage = None;
        }
    }

    fn shutdown(&mut self) {
        self.pieces = None;
        self.linkage = None;
        if let Some(reader) = self.reader.take() {
            reader.close();
        }
        if let Some(done) = self.pending.take() {
            done.resolve(Err(BufferInterrupted::Closed));
        }
        let was_buffering = std::mem::take(&mut self.download.flags.write().is_buffering);
        if was_buffering {
            self.download.buffer.write().finish();
            self.download.ctx.limits.restore_after_buffering();
        }
        debug!("Event loop for {} stopped", self.download.info_hash);
    }
}

async fn next_piece_change(
    pieces: &mut Option<broadcast::Receiver<PieceStateChange>>,
) -> Result<PieceStateChange, RecvError> {
    match pieces {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Longest time the event loop keeps retrying player linkage.
pub fn linkage_budget(config: &StreamingConfig) -> Duration {
    config.linkage_interval * config.linkage_attempts
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::{MIB, SessionConfig, UndertowConfig};
    use crate::engine::{SimulatedDownload, SimulatedEngine, SimulatedTorrent, TorrentEngine};
    use crate::storage::MemoryRecordStore;

    struct Fixture {
        engine: Arc<SimulatedEngine>,
        sim: SimulatedDownload,
        download: Arc<StreamingDownload>,
        limits: Arc<RateLimits>,
        records: Arc<MemoryRecordStore>,
    }

    async fn fixture_with(
        torrent: SimulatedTorrent,
        config: StreamingConfig,
        session: SessionConfig,
        item_lookup: Option<Arc<dyn ItemLookup>>,
    ) -> Fixture {
        let engine = Arc::new(SimulatedEngine::new());
        let info_hash = torrent.info_hash;
        let magnet = engine.register(torrent);
        let handle = engine.add_magnet(&magnet).await.unwrap();
        handle.wait_for_info().await;

        let limits = Arc::new(RateLimits::new(
            Arc::clone(&engine) as Arc<dyn TorrentEngine>,
            &session,
        ));
        let records = Arc::new(MemoryRecordStore::new());
        let download = StreamingDownload::spawn(
            handle,
            DownloadContext {
                config,
                storage_mode: StorageMode::File,
                limits: Arc::clone(&limits),
                records: Arc::clone(&records) as Arc<dyn RecordStore>,
                item_lookup,
            },
        );
        Fixture {
            sim: engine.download(info_hash).unwrap(),
            engine,
            download,
            limits,
            records,
        }
    }

    async fn movie_fixture() -> Fixture {
        // 700 MiB in 1 MiB pieces, 10 MiB buffer.
        let mut config = UndertowConfig::for_testing().streaming;
        config.buffer_size = 10 * MIB;
        fixture_with(
            SimulatedTorrent::new("Movie", MIB, [("Movie/movie.mkv", 700 * MIB)]),
            config,
            SessionConfig::default(),
            None,
        )
        .await
    }

    #[tokio::test]
    async fn test_buffer_completes_on_window_pieces_only() {
        let fx = movie_fixture().await;
        let done = fx.download.buffer(0).await.unwrap();

        assert_eq!(fx.download.state(), DownloadState::Buffering);
        assert_eq!(fx.download.buffer_progress(), 0.0);

        for piece in 10..20 {
            fx.sim.complete_piece(piece);
        }
        for piece in 0..9 {
            fx.sim.complete_piece(piece);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!done.is_resolved());
        assert!(fx.download.buffer_progress() > 89.0);

        fx.sim.complete_piece(9);
        assert_eq!(done.wait().await, Ok(()));
        assert!(!fx.download.flags().is_buffering);
        assert_eq!(fx.download.buffer_progress(), 100.0);
    }

    #[tokio::test]
    async fn test_open_reader_serves_chosen_file() {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        use crate::engine::simulated::synthetic_byte;

        let fx = fixture_with(
            SimulatedTorrent::new(
                "Pack",
                1024,
                [("Pack/intro.nfo", 1000u64), ("Pack/movie.mkv", 5000u64)],
            ),
            UndertowConfig::for_testing().streaming,
            SessionConfig::default(),
            None,
        )
        .await;
        fx.download.download_file(1);

        let mut reader = fx.download.open_reader(1).await.unwrap();
        assert_eq!(reader.seek(std::io::SeekFrom::Start(10)).await.unwrap(), 10);
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).await.unwrap();
        let expected: Vec<u8> = (1010..1014).map(synthetic_byte).collect();
        assert_eq!(head.to_vec(), expected);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 5000 - 14);

        assert!(matches!(
            fx.download.open_reader(7).await,
            Err(StreamingError::Reader(_))
        ));
    }

    #[tokio::test]
    async fn test_buffer_progress_monotonic() {
        let fx = movie_fixture().await;
        let _done = fx.download.buffer(0).await.unwrap();

        fx.sim.set_piece_missing(0, MIB / 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = fx.download.buffer_progress();
        assert!(first > 0.0);

        // A piece regressing (failed hash check) must not lower progress.
        fx.sim.set_piece_missing(0, MIB);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.download.buffer_progress() >= first);
        assert!(fx.download.buffer_progress() <= 100.0);
    }

    #[tokio::test]
    async fn test_buffer_resolves_immediately_when_present() {
        let fx = movie_fixture().await;
        fx.sim.complete_all();
        let done = fx.download.buffer(0).await.unwrap();
        assert_eq!(done.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_buffer_pins_tail_and_primes_window() {
        let fx = movie_fixture().await;
        let _done = fx.download.buffer(0).await.unwrap();

        let urgent = fx.sim.urgent_pieces();
        assert!(urgent.contains(&0));
        assert!(urgent.contains(&9));
        assert!(urgent.contains(&697));
        assert!(urgent.contains(&699));
        assert!(fx.sim.is_file_wanted(0));
        assert_eq!(fx.download.chosen_files(), vec![0]);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_buffer() {
        let fx = movie_fixture().await;
        let done = fx.download.buffer(0).await.unwrap();
        fx.download.close();
        assert_eq!(done.wait().await, Err(BufferInterrupted::Closed));
        assert!(!fx.download.flags().is_buffering);
    }

    #[tokio::test]
    async fn test_rebuffer_supersedes_previous_wait() {
        let fx = movie_fixture().await;
        let first = fx.download.buffer(0).await.unwrap();
        let second = fx.download.buffer(0).await.unwrap();
        assert_eq!(first.wait().await, Err(BufferInterrupted::Superseded));
        assert!(!second.is_resolved());
    }

    #[tokio::test]
    async fn test_download_limit_lifted_while_buffering() {
        let mut config = UndertowConfig::for_testing().streaming;
        config.buffer_size = 10 * MIB;
        let session = SessionConfig {
            download_limit: Some(4096),
            ..Default::default()
        };
        let fx = fixture_with(
            SimulatedTorrent::new("Movie", MIB, [("Movie/movie.mkv", 50 * MIB)]),
            config,
            session,
            None,
        )
        .await;

        let done = fx.download.buffer(0).await.unwrap();
        assert_eq!(fx.engine.download_limit(), None);

        fx.sim.complete_all();
        done.wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.engine.download_limit(), Some(4096));
        assert_eq!(fx.limits.download_limit(), Some(4096));
    }

    #[tokio::test]
    async fn test_checking_reports_whole_torrent_progress() {
        let fx = fixture_with(
            SimulatedTorrent::new("Pack", 1000, [("Pack/a.mkv", 4000u64)]),
            UndertowConfig::for_testing().streaming,
            SessionConfig::default(),
            None,
        )
        .await;
        fx.download.download_file(0);
        fx.sim.complete_piece(0);
        fx.sim.set_checking(1..2, true);

        assert_eq!(fx.download.state(), DownloadState::Checking);
        assert_eq!(fx.download.buffer_progress(), 25.0);
    }

    #[tokio::test]
    async fn test_progress_and_remaining_follow_chosen_files() {
        let fx = fixture_with(
            SimulatedTorrent::new(
                "Pack",
                1000,
                [("Pack/a.nfo", 1000u64), ("Pack/b.mkv", 3000u64)],
            ),
            UndertowConfig::for_testing().streaming,
            SessionConfig::default(),
            None,
        )
        .await;

        assert_eq!(fx.download.progress(), 0.0);
        assert_eq!(fx.download.remaining_bytes(), 4000);

        fx.download.download_file(1);
        fx.sim.complete_piece(1);
        assert!((fx.download.progress() - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(fx.download.remaining_bytes(), 2000);
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle_connections() {
        let fx = movie_fixture().await;
        fx.download.pause();
        assert_eq!(fx.sim.max_connections(), 0);
        assert!(fx.download.flags().is_paused);
        assert!(fx.download.status().lines()[1].contains("paused"));

        fx.download.resume();
        assert_eq!(fx.sim.max_connections(), 200);
        assert!(!fx.download.flags().is_paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeding_ends_after_seed_time() {
        let mut config = UndertowConfig::for_testing().streaming;
        config.seed_time = Duration::from_secs(60);
        let fx = fixture_with(
            SimulatedTorrent::new("Small", 1000, [("Small/a.mkv", 3000u64)]),
            config,
            SessionConfig::default(),
            None,
        )
        .await;

        fx.download.download_file(0);
        fx.sim.complete_all();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.download.state(), DownloadState::Seeding);
        assert_eq!(fx.sim.max_connections(), 20);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fx.download.state(), DownloadState::Finished);
        assert_eq!(fx.sim.max_connections(), 0);
    }

    #[tokio::test]
    async fn test_rates_are_smoothed() {
        let fx = movie_fixture().await;
        fx.download.download_file(0);
        fx.sim.record_upload(0);
        for _ in 0..3 {
            fx.sim.step(MIB);
            fx.sim.record_upload(1000);
            tokio::time::sleep(Duration::from_millis(110)).await;
        }
        let rates = fx.download.rates();
        assert!(rates.download > 0);
        assert!(rates.upload > 0);
    }

    #[tokio::test]
    async fn test_record_resolved_lazily() {
        let fx = movie_fixture().await;
        fx.records
            .set(fx.download.info_hash(), DownloadRecord::movie("tt42", 0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fx.download.record().unwrap().catalog_id, "tt42");
    }

    struct CountingLookup {
        calls: AtomicU32,
        found_on: u32,
    }

    #[async_trait]
    impl ItemLookup for CountingLookup {
        async fn find_item(&self, _info_hash: InfoHash, name: &str) -> Option<LinkedItem> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (call == self.found_on).then(|| LinkedItem {
                id: "item-1".to_string(),
                title: name.to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_linkage_retries_are_bounded() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
            found_on: u32::MAX,
        });
        let config = UndertowConfig::for_testing().streaming;
        let budget = linkage_budget(&config);
        let fx = fixture_with(
            SimulatedTorrent::new("Movie", 1000, [(PathBuf::from("Movie/a.mkv"), 3000u64)]),
            config,
            SessionConfig::default(),
            Some(Arc::clone(&lookup) as Arc<dyn ItemLookup>),
        )
        .await;

        tokio::time::sleep(budget * 3).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 10);
        assert!(fx.download.linked_item().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linkage_stops_once_found() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
            found_on: 3,
        });
        let config = UndertowConfig::for_testing().streaming;
        let fx = fixture_with(
            SimulatedTorrent::new("Movie", 1000, [(PathBuf::from("Movie/a.mkv"), 3000u64)]),
            config,
            SessionConfig::default(),
            Some(Arc::clone(&lookup) as Arc<dyn ItemLookup>),
        )
        .await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fx.download.linked_item().unwrap().title, "Movie");
    }

    #[test]
    fn test_status_lines_format() {
        let status = DownloadStatus {
            name: "Movie".to_string(),
            state: DownloadState::Downloading,
            progress: 42.0,
            buffer_progress: 100.0,
            rates: TransferRates {
                download: 2 * 1024 * 1024,
                upload: 512,
            },
            active_peers: 3,
            total_peers: 10,
            seeds: 2,
            paused: false,
        };
        let lines = status.lines();
        assert_eq!(lines[0], "Movie");
        assert_eq!(lines[1], "Downloading 42.00%");
        assert_eq!(lines[2], "D: 2.00 MB/s U: 0.50 kB/s");
        assert_eq!(lines[3], "P: 3/10 S: 2");
    }
}
