//! Boundary to the media player and its remote-control surface.
//!
//! Dialogs, overlays, prompts and playback queries are supplied by the host
//! player. [`HeadlessUi`] is a stand-in that answers prompts from fixed
//! settings, logs through `tracing` and simulates a player that plays for a
//! fixed duration.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::torrent::InfoHash;

/// Toast notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Modal progress dialog owned by one playback phase.
pub trait ProgressDialog: Send + Sync {
    fn update(&self, percent: f64, lines: &[String]);

    /// Whether the user pressed cancel.
    fn is_cancelled(&self) -> bool;

    fn close(&self);
}

/// Non-blocking overlay drawn over the player.
pub trait StatusOverlay: Send + Sync {
    fn update(&self, lines: &[String]);
    fn show(&self);
    fn hide(&self);
    fn close(&self);
}

/// What the player reports about the current item.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub is_paused: bool,
    /// Seconds from the start of the item
    pub position: f64,
    /// Total length in seconds, zero while unknown
    pub duration: f64,
}

/// Where the player should read media from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// A file inside a download, served as a seekable stream
    Stream { info_hash: InfoHash, file_index: usize },
    /// A file on local disk, e.g. archive extraction output
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackTarget {
    pub title: String,
    pub source: PlaybackSource,
    /// Subtitle file index inside the same download
    pub subtitle: Option<usize>,
}

/// Playback telemetry keyed by the playback session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Started { session: Uuid },
    Seeked { session: Uuid, from: f64, to: f64 },
    Paused { session: Uuid, position: f64 },
    Resumed { session: Uuid, position: f64 },
    Stopped {
        session: Uuid,
        watched_time: f64,
        duration: f64,
    },
}

/// Prompts, dialogs and player control.
#[async_trait]
pub trait PlayerUi: Send + Sync {
    async fn confirm(&self, title: &str, message: &str) -> bool;

    /// Returns the chosen index into `options`, or `None` when cancelled.
    async fn select(&self, title: &str, options: &[String]) -> Option<usize>;

    fn progress_dialog(&self, title: &str) -> Box<dyn ProgressDialog>;

    fn status_overlay(&self) -> Box<dyn StatusOverlay>;

    async fn start_playback(&self, target: &PlaybackTarget);

    async fn playback_status(&self) -> PlaybackStatus;

    fn report(&self, event: &TelemetryEvent);
}

#[derive(Debug, Default)]
struct PlayerClock {
    started: Option<Instant>,
    target: Option<PlaybackTarget>,
}

/// Player stand-in for the command line.
#[derive(Debug, Clone)]
pub struct HeadlessUi {
    confirm_answer: bool,
    play_for: Duration,
    clock: Arc<Mutex<PlayerClock>>,
}

impl HeadlessUi {
    /// Creates a UI whose player stops after `play_for`.
    pub fn new(play_for: Duration) -> Self {
        Self {
            confirm_answer: true,
            play_for,
            clock: Arc::new(Mutex::new(PlayerClock::default())),
        }
    }

    /// Answer given to every confirmation prompt.
    pub fn with_confirm_answer(mut self, answer: bool) -> Self {
        self.confirm_answer = answer;
        self
    }

    /// Item handed to the player, if playback was started.
    pub fn current_target(&self) -> Option<PlaybackTarget> {
        self.clock.lock().target.clone()
    }
}

impl Notifier for HeadlessUi {
    fn notify(&self, title: &str, message: &str) {
        info!("[{}] {}", title, message);
    }
}

#[async_trait]
impl PlayerUi for HeadlessUi {
    async fn confirm(&self, title: &str, message: &str) -> bool {
        info!(
            "[{}] {} -> {}",
            title,
            message,
            if self.confirm_answer { "yes" } else { "no" }
        );
        self.confirm_answer
    }

    async fn select(&self, title: &str, options: &[String]) -> Option<usize> {
        let choice = options.first()?;
        info!("[{}] choosing {}", title, choice);
        Some(0)
    }

    fn progress_dialog(&self, title: &str) -> Box<dyn ProgressDialog> {
        Box::new(LogDialog {
            title: title.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn status_overlay(&self) -> Box<dyn StatusOverlay> {
        Box::new(LogOverlay)
    }

    async fn start_playback(&self, target: &PlaybackTarget) {
        info!("Starting playback of {}", target.title);
        let mut clock = self.clock.lock();
        clock.started = Some(Instant::now());
        clock.target = Some(target.clone());
    }

    async fn playback_status(&self) -> PlaybackStatus {
        let Some(started) = self.clock.lock().started else {
            return PlaybackStatus::default();
        };
        let elapsed = started.elapsed();
        PlaybackStatus {
            is_playing: elapsed < self.play_for,
            is_paused: false,
            position: elapsed.min(self.play_for).as_secs_f64(),
            duration: self.play_for.as_secs_f64(),
        }
    }

    fn report(&self, event: &TelemetryEvent) {
        debug!("Telemetry: {:?}", event);
    }
}

struct LogDialog {
    title: String,
    closed: AtomicBool,
}

impl ProgressDialog for LogDialog {
    fn update(&self, percent: f64, lines: &[String]) {
        info!("[{}] {:.2}% {}", self.title, percent, lines.join(" | "));
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            debug!("[{}] closed", self.title);
        }
    }
}

struct LogOverlay;

impl StatusOverlay for LogOverlay {
    fn update(&self, lines: &[String]) {
        debug!("Overlay: {}", lines.join(" | "));
    }

    fn show(&self) {
        debug!("Overlay shown");
    }

    fn hide(&self) {
        debug!("Overlay hidden");
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_headless_player_plays_for_duration() {
        let ui = HeadlessUi::new(Duration::from_secs(30));
        assert!(!ui.playback_status().await.is_playing);

        let target = PlaybackTarget {
            title: "Movie".to_string(),
            source: PlaybackSource::Local(PathBuf::from("movie.mkv")),
            subtitle: None,
        };
        ui.start_playback(&target).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let status = ui.playback_status().await;
        assert!(status.is_playing);
        assert_eq!(status.duration, 30.0);
        assert!((status.position - 10.0).abs() < 0.5);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!ui.playback_status().await.is_playing);
        assert_eq!(ui.current_target(), Some(target));
    }

    #[tokio::test]
    async fn test_headless_prompts() {
        let ui = HeadlessUi::new(Duration::ZERO).with_confirm_answer(false);
        assert!(!ui.confirm("Archive", "Download it?").await);
        assert_eq!(ui.select("Pick", &[]).await, None);
        assert_eq!(
            ui.select("Pick", &["a".to_string(), "b".to_string()]).await,
            Some(0)
        );
        let dialog = ui.progress_dialog("Buffering");
        assert!(!dialog.is_cancelled());
        dialog.close();
    }
}
