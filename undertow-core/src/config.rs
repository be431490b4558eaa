//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub session: SessionConfig,
    pub playback: PlaybackConfig,
}

/// How the protocol engine persists piece data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Pieces are written to files under the download path
    File,
    /// Pieces live in a bounded in-memory ring
    Memory { capacity: u64 },
}

/// Download and library locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Where in-progress downloads are written. Empty means unset.
    pub download_path: PathBuf,
    /// Where saved torrent descriptors are kept for resume
    pub torrents_path: PathBuf,
    /// Library root for completed movies
    pub movies_library_path: PathBuf,
    /// Library root for completed shows
    pub shows_library_path: PathBuf,
    /// Storage backend used by the engine
    pub mode: StorageMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("downloads"),
            torrents_path: PathBuf::from("downloads/.torrents"),
            movies_library_path: PathBuf::from("library/Movies"),
            shows_library_path: PathBuf::from("library/Shows"),
            mode: StorageMode::File,
        }
    }
}

/// Buffer window, seeding and event-loop timing for a single download.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Configured buffer window size in bytes
    pub buffer_size: u64,
    /// Floor applied to the buffer window
    pub min_buffer_size: u64,
    /// Trailing bytes of a file pinned at highest priority
    pub tail_pin_bytes: u64,
    /// Rate sampling tick
    pub rate_interval: Duration,
    /// Full recomputation of buffer progress, guards against missed events
    pub progress_check_interval: Duration,
    /// How long to keep seeding after completion (zero disables seeding)
    pub seed_time: Duration,
    /// Connection cap while seeding
    pub seeding_connections: usize,
    /// Connection cap while downloading
    pub max_connections: usize,
    /// Attempts made to link the stream to a library item
    pub linkage_attempts: u32,
    /// Delay between linkage attempts
    pub linkage_interval: Duration,
    /// Reader position logging interval
    pub reader_watchdog_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 20 * MIB,
            min_buffer_size: 10 * MIB,
            tail_pin_bytes: 3 * MIB,
            rate_interval: Duration::from_secs(1),
            progress_check_interval: Duration::from_secs(10),
            seed_time: Duration::from_secs(3600),
            seeding_connections: 20,
            max_connections: 200,
            linkage_attempts: 10,
            linkage_interval: Duration::from_secs(1),
            reader_watchdog_interval: Duration::from_secs(30),
        }
    }
}

/// Session-wide policies: rate limits and the completed-download sweep.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Download bandwidth limit in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Upload bandwidth limit in bytes per second (None = unlimited)
    pub upload_limit: Option<u64>,
    /// Lift the download limit while any download is buffering
    pub unlimited_while_buffering: bool,
    /// Move fully seeded downloads into the library
    pub move_completed: bool,
    /// Interval of the completed-download sweep
    pub sweep_interval: Duration,
    /// HTTP timeout when resolving descriptor URLs
    pub resolve_timeout: Duration,
    /// User agent for descriptor resolution
    pub user_agent: &'static str,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_limit: None,
            upload_limit: None,
            unlimited_while_buffering: true,
            move_completed: false,
            sweep_interval: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(30),
            user_agent: "undertow/0.1.0",
        }
    }
}

/// Answer to a yes/no policy question at playback teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    Always,
    Never,
    /// Prompt the user
    Ask,
}

/// Playback session behaviour.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Files at or below this size are never offered as the main title
    pub candidate_min_size: u64,
    /// `.rar` files above this size switch to archive mode
    pub archive_min_size: u64,
    /// Wait for torrent metadata before giving up
    pub metadata_timeout: Duration,
    /// Wait for the player to start after buffering
    pub playback_start_timeout: Duration,
    /// Poll interval for dialogs, buffering and the playback monitor
    pub poll_interval: Duration,
    /// Fraction of the duration after which content counts as watched
    pub watched_ratio: f64,
    /// Keep downloading after the player stops
    pub keep_downloading: ClosePolicy,
    /// Keep files when playback stopped before the content was watched
    pub keep_files_playing: ClosePolicy,
    /// Keep files when the content was watched
    pub keep_files_finished: ClosePolicy,
    /// Show the status overlay while paused
    pub pause_overlay: bool,
    /// Archive extraction executable
    pub extract_program: PathBuf,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            candidate_min_size: 100 * MIB,
            archive_min_size: 10 * MIB,
            metadata_timeout: Duration::from_secs(120),
            playback_start_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(1),
            watched_ratio: 0.90,
            keep_downloading: ClosePolicy::Ask,
            keep_files_playing: ClosePolicy::Ask,
            keep_files_finished: ClosePolicy::Ask,
            pause_overlay: true,
            extract_program: PathBuf::from("unrar"),
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("UNDERTOW_DOWNLOAD_PATH") {
            config.storage.torrents_path = PathBuf::from(&path).join(".torrents");
            config.storage.download_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("UNDERTOW_LIBRARY_PATH") {
            let root = PathBuf::from(path);
            config.storage.movies_library_path = root.join("Movies");
            config.storage.shows_library_path = root.join("Shows");
        }

        if let Ok(size) = std::env::var("UNDERTOW_BUFFER_MB")
            && let Ok(mb) = size.parse::<u64>()
        {
            config.streaming.buffer_size = mb * MIB;
        }

        if let Ok(seed) = std::env::var("UNDERTOW_SEED_TIME")
            && let Ok(seconds) = seed.parse::<u64>()
        {
            config.streaming.seed_time = Duration::from_secs(seconds);
        }

        if let Ok(enabled) = std::env::var("UNDERTOW_MOVE_COMPLETED") {
            config.session.move_completed = enabled.parse().unwrap_or(false);
        }

        if let Ok(limit) = std::env::var("UNDERTOW_DOWNLOAD_LIMIT") {
            config.session.download_limit = limit.parse::<u64>().ok().filter(|l| *l > 0);
        }

        if let Ok(limit) = std::env::var("UNDERTOW_UPLOAD_LIMIT") {
            config.session.upload_limit = limit.parse::<u64>().ok().filter(|l| *l > 0);
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.streaming.rate_interval = Duration::from_millis(100);
        config.streaming.progress_check_interval = Duration::from_millis(500);
        config.streaming.linkage_interval = Duration::from_millis(100);
        config.streaming.reader_watchdog_interval = Duration::from_millis(500);
        config.session.sweep_interval = Duration::from_millis(200);
        config.playback.poll_interval = Duration::from_millis(50);
        config.playback.metadata_timeout = Duration::from_secs(5);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.streaming.min_buffer_size, 10 * MIB);
        assert_eq!(config.streaming.tail_pin_bytes, 3 * MIB);
        assert_eq!(config.streaming.linkage_attempts, 10);
        assert_eq!(config.session.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.playback.candidate_min_size, 100 * MIB);
        assert_eq!(config.playback.archive_min_size, 10 * MIB);
        assert_eq!(
            config.playback.playback_start_timeout,
            Duration::from_secs(20)
        );
        assert_eq!(config.storage.mode, StorageMode::File);
        assert!(!config.session.move_completed);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_DOWNLOAD_PATH", "/tmp/undertow-dl");
            std::env::set_var("UNDERTOW_BUFFER_MB", "64");
            std::env::set_var("UNDERTOW_MOVE_COMPLETED", "true");
            std::env::set_var("UNDERTOW_DOWNLOAD_LIMIT", "0");
            std::env::set_var("UNDERTOW_UPLOAD_LIMIT", "1024");
        }

        let config = UndertowConfig::from_env();

        assert_eq!(
            config.storage.download_path,
            PathBuf::from("/tmp/undertow-dl")
        );
        assert_eq!(
            config.storage.torrents_path,
            PathBuf::from("/tmp/undertow-dl/.torrents")
        );
        assert_eq!(config.streaming.buffer_size, 64 * MIB);
        assert!(config.session.move_completed);
        assert_eq!(config.session.download_limit, None);
        assert_eq!(config.session.upload_limit, Some(1024));

        unsafe {
            std::env::remove_var("UNDERTOW_DOWNLOAD_PATH");
            std::env::remove_var("UNDERTOW_BUFFER_MB");
            std::env::remove_var("UNDERTOW_MOVE_COMPLETED");
            std::env::remove_var("UNDERTOW_DOWNLOAD_LIMIT");
            std::env::remove_var("UNDERTOW_UPLOAD_LIMIT");
        }
    }
}
