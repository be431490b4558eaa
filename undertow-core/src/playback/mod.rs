//! One playback attempt from URI to teardown.
//!
//! [`PlaybackOrchestrator`] walks a request through adding the torrent,
//! waiting for metadata, choosing the file, buffering (or downloading and
//! extracting an archive), starting the player and monitoring it. Every wait
//! races the session's fatal signal, which is resolved once by whichever of
//! user cancel, space shortfall, timeout or extraction failure fires first.
//! The close policy runs once when the attempt ends.

pub mod extract;
pub mod monitor;
pub mod selection;
pub mod ui;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use extract::{ExtractionError, extract_archive, find_playable};
pub use monitor::{WatchState, WatchTransition};
pub use selection::{
    Classification, EpisodeHint, FileChoice, choose_subtitle, classify_files, match_episode,
    plan_selection, sorted_listing,
};
pub use ui::{
    HeadlessUi, Notifier, PlaybackSource, PlaybackStatus, PlaybackTarget, PlayerUi,
    ProgressDialog, StatusOverlay, TelemetryEvent,
};

use crate::config::{ClosePolicy, PlaybackConfig};
use crate::engine::TorrentInfo;
use crate::session::{DownloadSession, SessionError};
use crate::storage::{ContentType, DownloadRecord};
use crate::streaming::{SingleShot, StreamingDownload, StreamingError};
use crate::torrent::InfoHash;

/// Terminal failures of a playback attempt.
///
/// Cloneable so one value can be observed by every waiter of the session's
/// fatal signal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Cannot add torrent: {reason}")]
    Resolution { reason: String },

    #[error("Torrent metadata did not arrive in time")]
    MetadataTimeout,

    #[error("Not enough disk space: need {needed} bytes, {available} available")]
    SpaceExhausted { needed: u64, available: u64 },

    #[error("Cancelled by user")]
    UserCancelled,

    #[error("Playback did not start within {waited:?}")]
    PlaybackStartTimeout { waited: Duration },

    #[error("Extraction failed: {reason}")]
    Extraction { reason: String },

    #[error("Torrent contains no playable file")]
    NoPlayableFile,

    #[error("Session error: {reason}")]
    Session { reason: String },
}

impl From<SessionError> for PlaybackError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Resolution { .. } | SessionError::Engine(_) => {
                PlaybackError::Resolution {
                    reason: error.to_string(),
                }
            }
            SessionError::SpaceExhausted { needed, available } => {
                PlaybackError::SpaceExhausted { needed, available }
            }
            SessionError::MetadataTimeout { .. } => PlaybackError::MetadataTimeout,
            other => PlaybackError::Session {
                reason: other.to_string(),
            },
        }
    }
}

impl From<StreamingError> for PlaybackError {
    fn from(error: StreamingError) -> Self {
        PlaybackError::Session {
            reason: error.to_string(),
        }
    }
}

impl From<ExtractionError> for PlaybackError {
    fn from(error: ExtractionError) -> Self {
        PlaybackError::Extraction {
            reason: error.to_string(),
        }
    }
}

/// Where a playback attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Initializing,
    AddingOrResolving,
    AwaitingMetadata,
    SelectingFile,
    Buffering,
    Extracting,
    AwaitingPlaybackStart,
    Monitoring,
    Closed,
}

impl PlaybackPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackPhase::Initializing => "Initializing",
            PlaybackPhase::AddingOrResolving => "Adding",
            PlaybackPhase::AwaitingMetadata => "Awaiting metadata",
            PlaybackPhase::SelectingFile => "Selecting file",
            PlaybackPhase::Buffering => "Buffering",
            PlaybackPhase::Extracting => "Extracting",
            PlaybackPhase::AwaitingPlaybackStart => "Awaiting playback",
            PlaybackPhase::Monitoring => "Monitoring",
            PlaybackPhase::Closed => "Closed",
        }
    }
}

impl fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry the played content belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRef {
    pub catalog_id: String,
    pub content_type: ContentType,
    pub show_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub title: Option<String>,
}

impl ContentRef {
    pub fn movie(catalog_id: impl Into<String>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            content_type: ContentType::Movie,
            show_id: None,
            season: None,
            episode: None,
            title: None,
        }
    }

    pub fn episode(
        catalog_id: impl Into<String>,
        show_id: impl Into<String>,
        season: u32,
        episode: u32,
    ) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            content_type: ContentType::Episode,
            show_id: Some(show_id.into()),
            season: Some(season),
            episode: Some(episode),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn hint(&self) -> Option<EpisodeHint> {
        Some(EpisodeHint {
            season: self.season?,
            episode: self.episode?,
        })
    }

    fn record(&self, file_index: usize) -> DownloadRecord {
        let mut record = DownloadRecord::movie(self.catalog_id.clone(), file_index);
        record.content_type = self.content_type;
        record.show_id = self.show_id.clone();
        record.season = self.season;
        record.episode = self.episode;
        record.title = self.title.clone();
        record
    }
}

/// What to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRequest {
    /// Magnet link, HTTP(S) descriptor URL or local descriptor path
    pub uri: String,
    /// Exact file to play, skipping the interactive choice
    pub file_index: Option<usize>,
    pub content: Option<ContentRef>,
}

impl PlayRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            file_index: None,
            content: None,
        }
    }

    pub fn with_file_index(mut self, file_index: usize) -> Self {
        self.file_index = Some(file_index);
        self
    }

    pub fn with_content(mut self, content: ContentRef) -> Self {
        self.content = Some(content);
        self
    }
}

/// Result of a completed playback attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSummary {
    pub session: Uuid,
    pub info_hash: InfoHash,
    pub file_index: usize,
    pub watched_time: f64,
    pub duration: f64,
    pub watched: bool,
    pub close: CloseOutcome,
}

/// What the close policy decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    pub kept_downloading: bool,
    pub files_deleted: bool,
}

/// Drives one playback attempt.
pub struct PlaybackOrchestrator {
    id: Uuid,
    session: Arc<DownloadSession>,
    ui: Arc<dyn PlayerUi>,
    config: PlaybackConfig,
    fatal: SingleShot<PlaybackError>,
    phase: RwLock<PlaybackPhase>,
    watch: Mutex<WatchState>,
    last_watch: Mutex<WatchState>,
    space_exhausted: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for PlaybackOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackOrchestrator")
            .field("id", &self.id)
            .field("phase", &*self.phase.read())
            .finish()
    }
}

impl PlaybackOrchestrator {
    pub fn new(session: Arc<DownloadSession>, ui: Arc<dyn PlayerUi>) -> Self {
        let config = session.config().playback.clone();
        Self {
            id: Uuid::new_v4(),
            session,
            ui,
            config,
            fatal: SingleShot::new(),
            phase: RwLock::new(PlaybackPhase::Initializing),
            watch: Mutex::new(WatchState::new()),
            last_watch: Mutex::new(WatchState::new()),
            space_exhausted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Playback session id used to key telemetry.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> PlaybackPhase {
        *self.phase.read()
    }

    /// Fatal error that ended the attempt, if any.
    pub fn failure(&self) -> Option<PlaybackError> {
        self.fatal.peek()
    }

    /// Live playback counters.
    pub fn watch_state(&self) -> WatchState {
        self.watch.lock().clone()
    }

    /// Aborts whatever phase is running.
    pub fn cancel(&self) {
        if self.fatal.resolve(PlaybackError::UserCancelled) {
            info!("Playback session {} cancel requested", self.id);
        }
    }

    /// Runs the attempt to completion.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`PlaybackError`]; the close policy has
    /// already run by then.
    pub async fn play(&self, request: PlayRequest) -> Result<PlaybackSummary, PlaybackError> {
        info!("Playback session {} starting for {}", self.id, request.uri);

        self.set_phase(PlaybackPhase::AddingOrResolving);
        let added = self
            .race(self.session.add_torrent(&request.uri))
            .await
            .and_then(|added| added.map_err(PlaybackError::from));
        let download = match added {
            Ok(download) => download,
            Err(e) => {
                self.set_phase(PlaybackPhase::Closed);
                return Err(self.report_failure(e));
            }
        };

        let result = self.run(&download, &request).await;
        let result = result.map_err(|e| self.raise(e));
        let close = self.close(&download, result.as_ref().err()).await;
        self.set_phase(PlaybackPhase::Closed);

        match result {
            Ok(file_index) => {
                let watch = self.last_watch.lock().clone();
                let summary = PlaybackSummary {
                    session: self.id,
                    info_hash: download.info_hash(),
                    file_index,
                    watched_time: watch.watched_time(),
                    duration: watch.duration(),
                    watched: watch.is_watched(self.config.watched_ratio),
                    close,
                };
                info!(
                    "Playback session {} ended after {:.0}s of {:.0}s",
                    self.id, summary.watched_time, summary.duration
                );
                Ok(summary)
            }
            Err(e) => Err(self.report_failure(e)),
        }
    }

    async fn run(
        &self,
        download: &Arc<StreamingDownload>,
        request: &PlayRequest,
    ) -> Result<usize, PlaybackError> {
        self.set_phase(PlaybackPhase::AwaitingMetadata);
        self.race(
            self.session
                .await_metadata(download, self.config.metadata_timeout),
        )
        .await??;
        let info = download
            .handle()
            .info()
            .ok_or_else(|| PlaybackError::Session {
                reason: "metadata missing after arrival".to_string(),
            })?;

        self.set_phase(PlaybackPhase::SelectingFile);
        let file_index = self.select_file(download, &info, request).await?;
        if let Some(content) = &request.content {
            download.set_record(content.record(file_index)).await;
        }
        self.check_space(download)?;

        let is_archive = download.flags().is_rar_archive;
        let (source, subtitle) = if is_archive {
            self.set_phase(PlaybackPhase::Buffering);
            self.download_archive(download).await?;
            self.set_phase(PlaybackPhase::Extracting);
            let path = self.extract(&info, file_index).await?;
            (PlaybackSource::Local(path), None)
        } else {
            let subtitle = choose_subtitle(&info.files, file_index).filter(|&s| s != file_index);
            if let Some(subtitle) = subtitle {
                download.download_file(subtitle);
            }
            self.set_phase(PlaybackPhase::Buffering);
            self.buffer(download, file_index).await?;
            let source = PlaybackSource::Stream {
                info_hash: download.info_hash(),
                file_index,
            };
            (source, subtitle)
        };

        let target = PlaybackTarget {
            title: download.name(),
            source,
            subtitle,
        };
        self.set_phase(PlaybackPhase::AwaitingPlaybackStart);
        download.set_playing(true);
        self.await_playback_start(&target).await?;

        self.set_phase(PlaybackPhase::Monitoring);
        self.monitor(download).await?;
        Ok(file_index)
    }

    async fn select_file(
        &self,
        download: &StreamingDownload,
        info: &TorrentInfo,
        request: &PlayRequest,
    ) -> Result<usize, PlaybackError> {
        let hint = request.content.as_ref().and_then(ContentRef::hint);
        let choice = plan_selection(
            &info.files,
            self.config.candidate_min_size,
            self.config.archive_min_size,
            request.file_index,
            hint,
        )
        .ok_or(PlaybackError::NoPlayableFile)?;

        let file_index = match choice {
            FileChoice::Auto(index) => index,
            FileChoice::Archive(index) => {
                let message = format!(
                    "{} is packed in a RAR archive. It has to download completely and be \
                     extracted before playback can start. Continue?",
                    info.name
                );
                if !self.race(self.ui.confirm("Archive", &message)).await? {
                    return Err(PlaybackError::UserCancelled);
                }
                download.set_rar_archive(true);
                index
            }
            FileChoice::Prompt(listing) => {
                let names: Vec<String> = listing.iter().map(|(_, name)| name.clone()).collect();
                let picked = self
                    .race(self.ui.select("Choose file to play", &names))
                    .await?;
                picked
                    .and_then(|position| listing.get(position))
                    .map(|(index, _)| *index)
                    .ok_or(PlaybackError::UserCancelled)?
            }
        };

        info!(
            "Playback session {} chose file {} of {}",
            self.id,
            file_index,
            download.info_hash()
        );
        download.download_file(file_index);
        Ok(file_index)
    }

    async fn buffer(
        &self,
        download: &StreamingDownload,
        file_index: usize,
    ) -> Result<(), PlaybackError> {
        let done = download.buffer(file_index).await?;
        let dialog = self.ui.progress_dialog("Buffering");
        let mut ticker = self.poll_ticker();

        let result = loop {
            tokio::select! {
                outcome = done.wait() => {
                    break outcome.map_err(|interrupted| PlaybackError::Session {
                        reason: format!("buffering interrupted: {interrupted}"),
                    });
                }
                e = self.fatal.wait() => break Err(e),
                _ = ticker.tick() => {
                    dialog.update(download.buffer_progress().max(0.0), &download.status().lines());
                    if dialog.is_cancelled() {
                        self.fatal.resolve(PlaybackError::UserCancelled);
                    } else if let Err(e) = self.check_space(download) {
                        break Err(e);
                    }
                }
            }
        };

        dialog.close();
        if result.is_ok() {
            info!("Playback session {} buffered", self.id);
        }
        result
    }

    /// Archives play only once fully downloaded.
    async fn download_archive(&self, download: &StreamingDownload) -> Result<(), PlaybackError> {
        let dialog = self.ui.progress_dialog("Downloading archive");
        let mut ticker = self.poll_ticker();

        let result = loop {
            tokio::select! {
                e = self.fatal.wait() => break Err(e),
                _ = ticker.tick() => {
                    let progress = download.progress();
                    dialog.update(progress, &download.status().lines());
                    if progress >= 100.0 {
                        break Ok(());
                    }
                    if dialog.is_cancelled() {
                        self.fatal.resolve(PlaybackError::UserCancelled);
                    } else if let Err(e) = self.check_space(download) {
                        break Err(e);
                    }
                }
            }
        };

        dialog.close();
        result
    }

    async fn extract(&self, info: &TorrentInfo, file_index: usize) -> Result<PathBuf, PlaybackError> {
        let file = info.file(file_index).ok_or(PlaybackError::NoPlayableFile)?;
        let download_path = &self.session.config().storage.download_path;
        let archive = download_path.join(&file.path);
        let dest = archive
            .parent()
            .unwrap_or(download_path.as_path())
            .join("extracted");

        let dialog = self.ui.progress_dialog("Extracting");
        dialog.update(0.0, &[format!("Extracting {}", file.file_name())]);
        let result = self
            .race(extract_archive(&self.config.extract_program, &archive, &dest))
            .await;
        dialog.close();

        let path = result??;
        info!("Playback session {} extracted {}", self.id, path.display());
        Ok(path)
    }

    /// The deadline covers the player's start call as well as the wait
    /// for it to report playing.
    async fn await_playback_start(&self, target: &PlaybackTarget) -> Result<(), PlaybackError> {
        let waited = self.config.playback_start_timeout;
        match tokio::time::timeout(waited, self.wait_for_player(target)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Playback session {}: player did not start within {:?}", self.id, waited);
                Err(self.raise(PlaybackError::PlaybackStartTimeout { waited }))
            }
        }
    }

    async fn wait_for_player(&self, target: &PlaybackTarget) -> Result<(), PlaybackError> {
        self.race(self.ui.start_playback(target)).await?;
        let mut ticker = self.poll_ticker();

        loop {
            tokio::select! {
                e = self.fatal.wait() => return Err(e),
                _ = ticker.tick() => {
                    if self.ui.playback_status().await.is_playing {
                        debug!("Playback session {} player started", self.id);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn monitor(&self, download: &StreamingDownload) -> Result<(), PlaybackError> {
        self.ui.report(&TelemetryEvent::Started { session: self.id });
        let overlay = self.ui.status_overlay();
        let mut ticker = self.poll_ticker();
        let mut last_poll = Instant::now();

        let result = loop {
            tokio::select! {
                e = self.fatal.wait() => break Err(e),
                _ = ticker.tick() => {
                    let status = self.ui.playback_status().await;
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_poll);
                    last_poll = now;

                    if !status.is_playing {
                        break Ok(());
                    }

                    let transitions = self.watch.lock().observe(&status, elapsed);
                    for transition in transitions {
                        self.on_transition(transition, download, overlay.as_ref());
                    }
                    if status.is_paused && self.config.pause_overlay {
                        overlay.update(&download.status().lines());
                    }

                    if download.progress() < 100.0
                        && let Err(e) = self.check_space(download)
                    {
                        break Err(e);
                    }
                }
            }
        };

        overlay.close();
        let watch = std::mem::take(&mut *self.watch.lock());
        self.ui.report(&TelemetryEvent::Stopped {
            session: self.id,
            watched_time: watch.watched_time(),
            duration: watch.duration(),
        });
        *self.last_watch.lock() = watch;
        result
    }

    fn on_transition(
        &self,
        transition: WatchTransition,
        download: &StreamingDownload,
        overlay: &dyn StatusOverlay,
    ) {
        let session = self.id;
        match transition {
            WatchTransition::Seeked { from, to } => {
                debug!("Playback session {} seeked {:.0}s -> {:.0}s", session, from, to);
                self.ui.report(&TelemetryEvent::Seeked { session, from, to });
            }
            WatchTransition::Paused { position } => {
                self.ui.report(&TelemetryEvent::Paused { session, position });
                if self.config.pause_overlay {
                    overlay.update(&download.status().lines());
                    overlay.show();
                }
            }
            WatchTransition::Resumed { position } => {
                self.ui.report(&TelemetryEvent::Resumed { session, position });
                overlay.hide();
            }
        }
    }

    /// Applies the keep/delete policy. Runs at most once.
    async fn close(
        &self,
        download: &StreamingDownload,
        error: Option<&PlaybackError>,
    ) -> CloseOutcome {
        if self.closed.swap(true, Ordering::AcqRel) {
            return CloseOutcome::default();
        }
        download.set_playing(false);

        let info_hash = download.info_hash();
        let name = download.name();
        let watched = self.last_watch.lock().is_watched(self.config.watched_ratio);

        let forced_delete = self.space_exhausted.load(Ordering::Acquire)
            || matches!(error, Some(PlaybackError::MetadataTimeout));
        let outcome = if forced_delete {
            CloseOutcome {
                kept_downloading: false,
                files_deleted: true,
            }
        } else if self
            .decide(
                self.config.keep_downloading,
                "Keep downloading",
                &format!("Keep downloading {name} in the background?"),
            )
            .await
        {
            CloseOutcome {
                kept_downloading: true,
                files_deleted: false,
            }
        } else {
            let policy = if watched {
                self.config.keep_files_finished
            } else {
                self.config.keep_files_playing
            };
            let keep_files = self
                .decide(
                    policy,
                    "Keep files",
                    &format!("Keep the downloaded files of {name}?"),
                )
                .await;
            CloseOutcome {
                kept_downloading: false,
                files_deleted: !keep_files,
            }
        };

        if outcome.kept_downloading {
            info!("Playback session {}: {} keeps downloading", self.id, info_hash);
            return outcome;
        }

        info!(
            "Playback session {}: stopping {}{}",
            self.id,
            info_hash,
            if outcome.files_deleted {
                " and deleting files"
            } else {
                ""
            }
        );
        self.session.delete_descriptor(info_hash).await;
        if let Err(e) = self.session.records().delete(info_hash).await {
            warn!("Failed to delete record for {}: {}", info_hash, e);
        }
        if let Some(task) = self.session.remove_torrent(info_hash, outcome.files_deleted) {
            let _ = task.await;
        }
        outcome
    }

    async fn decide(&self, policy: ClosePolicy, title: &str, message: &str) -> bool {
        match policy {
            ClosePolicy::Always => true,
            ClosePolicy::Never => false,
            ClosePolicy::Ask => self.ui.confirm(title, message).await,
        }
    }

    fn check_space(&self, download: &StreamingDownload) -> Result<(), PlaybackError> {
        match self.session.check_available_space(download) {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, SessionError::SpaceExhausted { .. }) {
                    self.space_exhausted.store(true, Ordering::Release);
                }
                Err(self.raise(e.into()))
            }
        }
    }

    /// Runs `fut` unless the fatal signal fires first.
    async fn race<T>(&self, fut: impl Future<Output = T>) -> Result<T, PlaybackError> {
        tokio::select! {
            biased;
            e = self.fatal.wait() => Err(e),
            value = fut => Ok(value),
        }
    }

    /// Resolves the fatal signal and returns whichever error won.
    fn raise(&self, error: PlaybackError) -> PlaybackError {
        self.fatal.resolve(error.clone());
        self.fatal.peek().unwrap_or(error)
    }

    fn report_failure(&self, error: PlaybackError) -> PlaybackError {
        let error = self.raise(error);
        match &error {
            PlaybackError::UserCancelled => {
                info!("Playback session {} cancelled by user", self.id);
            }
            // The session already told the user.
            PlaybackError::SpaceExhausted { .. } => {
                error!("Playback session {} failed: {}", self.id, error);
            }
            _ => {
                error!("Playback session {} failed: {}", self.id, error);
                self.session
                    .notifier()
                    .notify("Playback failed", &error.to_string());
            }
        }
        error
    }

    fn poll_ticker(&self) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn set_phase(&self, phase: PlaybackPhase) {
        let previous = std::mem::replace(&mut *self.phase.write(), phase);
        if previous != phase {
            debug!("Playback session {}: {} -> {}", self.id, previous, phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_map_onto_playback_taxonomy() {
        let info_hash = InfoHash::new([1; 20]);
        assert_eq!(
            PlaybackError::from(SessionError::SpaceExhausted {
                needed: 10,
                available: 5
            }),
            PlaybackError::SpaceExhausted {
                needed: 10,
                available: 5
            }
        );
        assert_eq!(
            PlaybackError::from(SessionError::MetadataTimeout {
                info_hash,
                waited: Duration::from_secs(1)
            }),
            PlaybackError::MetadataTimeout
        );
        assert!(matches!(
            PlaybackError::from(SessionError::Resolution {
                uri: "x".to_string(),
                reason: "bad".to_string()
            }),
            PlaybackError::Resolution { .. }
        ));
        assert!(matches!(
            PlaybackError::from(SessionError::DownloadPathUnset),
            PlaybackError::Session { .. }
        ));
    }

    #[test]
    fn test_content_ref_record_and_hint() {
        let content = ContentRef::episode("ep", "show", 2, 7).with_title("Show");
        assert_eq!(
            content.hint(),
            Some(EpisodeHint {
                season: 2,
                episode: 7
            })
        );
        let record = content.record(3);
        assert_eq!(record.file_index, 3);
        assert_eq!(record.content_type, ContentType::Episode);
        assert_eq!(record.season, Some(2));
        assert_eq!(record.title.as_deref(), Some("Show"));
        assert!(record.is_active());

        assert_eq!(ContentRef::movie("tt1").hint(), None);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(PlaybackPhase::AwaitingPlaybackStart.to_string(), "Awaiting playback");
        assert_eq!(PlaybackPhase::Closed.as_str(), "Closed");
    }
}
