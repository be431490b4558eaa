//! Undertow Core - progressive playback on top of a torrent engine
//!
//! This crate keeps the pieces a media player needs next at the front of the
//! download queue, exposes an in-progress file as a seekable stream and
//! manages the lifecycle of every download around playback sessions.

pub mod config;
pub mod engine;
pub mod playback;
pub mod session;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use engine::{DownloadHandle, EngineError, TorrentEngine};
pub use playback::{PlayRequest, PlaybackError, PlaybackOrchestrator};
pub use session::{DownloadSession, SessionError};
pub use storage::{RecordStore, RecordStoreError};
pub use streaming::{StreamingDownload, StreamingError};
pub use torrent::InfoHash;

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Record store error: {0}")]
    RecordStore(#[from] RecordStoreError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Session(e) => match e {
                SessionError::DownloadPathUnset => {
                    "Set a download location before playing".to_string()
                }
                SessionError::Resolution { uri, .. } => format!("Could not open {uri}"),
                SessionError::SpaceExhausted { needed, .. } => format!(
                    "Not enough free disk space ({} MB needed)",
                    needed / (1024 * 1024)
                ),
                SessionError::MetadataTimeout { .. } => {
                    "Could not fetch torrent information from peers".to_string()
                }
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Playback(e) => match e {
                PlaybackError::UserCancelled => "Playback cancelled".to_string(),
                PlaybackError::PlaybackStartTimeout { .. } => {
                    "The player did not start in time".to_string()
                }
                PlaybackError::NoPlayableFile => "No playable file in this torrent".to_string(),
                other => other.to_string(),
            },
            UndertowError::Engine(_) => "Download error occurred".to_string(),
            UndertowError::Streaming(_) => "Streaming error occurred".to_string(),
            UndertowError::RecordStore(_) => "Could not save download history".to_string(),
            UndertowError::Configuration { .. } => "Configuration error occurred".to_string(),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input or a user decision.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Session(SessionError::DownloadPathUnset)
                | UndertowError::Session(SessionError::Resolution { .. })
                | UndertowError::Playback(PlaybackError::UserCancelled)
                | UndertowError::Playback(PlaybackError::Resolution { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let error = UndertowError::from(SessionError::SpaceExhausted {
            needed: 5 * 1024 * 1024,
            available: 0,
        });
        assert_eq!(error.user_message(), "Not enough free disk space (5 MB needed)");
        assert!(!error.is_user_error());

        let cancelled = UndertowError::from(PlaybackError::UserCancelled);
        assert_eq!(cancelled.user_message(), "Playback cancelled");
        assert!(cancelled.is_user_error());

        let unset = UndertowError::from(SessionError::DownloadPathUnset);
        assert!(unset.is_user_error());
    }
}
