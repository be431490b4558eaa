//! Boundary to the underlying torrent protocol engine.
//!
//! The wire protocol, peer discovery and piece storage live behind these
//! traits. The streaming layer only consumes piece state, byte counters,
//! priority controls and a positional reader.

pub mod simulated;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::broadcast;

use crate::config::StorageMode;
use crate::torrent::InfoHash;

pub use simulated::{SimulatedDownload, SimulatedEngine, SimulatedTorrent};

/// Errors reported by the protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid torrent source {uri}: {reason}")]
    InvalidSource { uri: String, reason: String },

    #[error("Engine rejected torrent: {reason}")]
    Rejected { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// One file inside a torrent, positioned in torrent-absolute bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub index: usize,
    /// Path relative to the download directory
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl TorrentFile {
    /// Final path component, used for display and pattern matching.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Torrent-absolute offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Metadata available once the engine has the info dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub piece_count: u32,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
}

impl TorrentInfo {
    /// Builds file offsets from an ordered list of `(path, length)` entries.
    pub fn from_files(name: &str, piece_length: u64, files: &[(PathBuf, u64)]) -> Self {
        let mut offset = 0;
        let files: Vec<TorrentFile> = files
            .iter()
            .enumerate()
            .map(|(index, (path, length))| {
                let file = TorrentFile {
                    index,
                    path: path.clone(),
                    offset,
                    length: *length,
                };
                offset += length;
                file
            })
            .collect();
        let piece_count = if piece_length == 0 {
            0
        } else {
            offset.div_ceil(piece_length) as u32
        };

        Self {
            name: name.to_string(),
            piece_length,
            piece_count,
            total_length: offset,
            files,
        }
    }

    pub fn file(&self, index: usize) -> Option<&TorrentFile> {
        self.files.get(index)
    }

    /// Size of a piece, accounting for the short final piece.
    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = piece as u64 * self.piece_length;
        self.piece_length
            .min(self.total_length.saturating_sub(start))
    }
}

/// Completion state of a single piece.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PieceState {
    pub complete: bool,
    /// Some but not all blocks are present
    pub partial: bool,
    /// Queued for or undergoing hash verification
    pub checking: bool,
}

/// Run-length encoded stretch of pieces sharing one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStateRun {
    pub length: u32,
    pub state: PieceState,
}

impl PieceStateRun {
    /// Encodes per-piece states into runs.
    pub fn encode(states: impl IntoIterator<Item = PieceState>) -> Vec<PieceStateRun> {
        let mut runs: Vec<PieceStateRun> = Vec::new();
        for state in states {
            match runs.last_mut() {
                Some(run) if run.state == state => run.length += 1,
                _ => runs.push(PieceStateRun { length: 1, state }),
            }
        }
        runs
    }
}

/// Notification that a piece changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStateChange {
    pub index: u32,
    pub state: PieceState,
}

/// Cumulative transfer counters and swarm population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes received from peers
    pub bytes_read: u64,
    /// Payload bytes sent to peers
    pub bytes_written: u64,
    pub active_peers: usize,
    pub total_peers: usize,
    pub connected_seeders: usize,
}

/// Positional reader over the whole torrent.
///
/// Offsets are torrent-absolute. The read-ahead tells the engine how many
/// bytes past the current position to prioritize.
pub trait EngineReader: AsyncRead + AsyncSeek + Send + Unpin {
    fn set_readahead(&mut self, bytes: u64);
}

/// A single torrent inside the engine.
#[async_trait]
pub trait DownloadHandle: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// Display name, available before metadata from the magnet `dn`.
    fn name(&self) -> String;

    /// Torrent metadata, `None` until the info dictionary is known.
    fn info(&self) -> Option<Arc<TorrentInfo>>;

    /// Resolves once metadata is available.
    async fn wait_for_info(&self);

    /// Raw descriptor bytes suitable for re-adding via `add_torrent_file`.
    fn metainfo_bytes(&self) -> Option<Bytes>;

    fn piece_state_runs(&self) -> Vec<PieceStateRun>;

    /// Bytes of `piece` not yet downloaded and verified.
    fn piece_bytes_missing(&self, piece: u32) -> u64;

    /// Verified bytes across the whole torrent.
    fn bytes_completed(&self) -> u64;

    /// Verified bytes inside one file.
    fn file_bytes_completed(&self, file_index: usize) -> u64;

    fn stats(&self) -> TransferStats;

    /// Piece state notifications. Dropping the receiver cancels the
    /// subscription.
    fn subscribe_piece_changes(&self) -> broadcast::Receiver<PieceStateChange>;

    /// Marks a file for download at normal priority.
    fn download_file(&self, file_index: usize);

    /// Returns a file to the not-fetched priority.
    fn cancel_file(&self, file_index: usize);

    /// Caps established peer connections; zero stops transfers.
    fn set_max_established_connections(&self, max: usize);

    fn new_reader(&self) -> Box<dyn EngineReader>;

    /// Raises a torrent-absolute byte region to the highest priority with an
    /// immediate deadline.
    fn pin_region(&self, offset: u64, length: u64);

    /// Removes the torrent from the engine. Files on disk are untouched.
    fn drop_torrent(&self);
}

/// The protocol engine that owns every torrent.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Adds a torrent from a magnet URI.
    ///
    /// # Errors
    /// - `EngineError::InvalidSource` - The URI cannot be parsed
    /// - `EngineError::Rejected` - The engine refused the torrent
    async fn add_magnet(&self, uri: &str) -> Result<Arc<dyn DownloadHandle>, EngineError>;

    /// Adds a torrent from a descriptor file on disk.
    ///
    /// # Errors
    /// - `EngineError::InvalidSource` - The file is not a valid descriptor
    /// - `EngineError::Io` - The file cannot be read
    async fn add_torrent_file(&self, path: &Path) -> Result<Arc<dyn DownloadHandle>, EngineError>;

    fn storage_mode(&self) -> StorageMode;

    /// Process-wide download cap in bytes per second.
    fn set_download_limit(&self, limit: Option<u64>);

    /// Process-wide upload cap in bytes per second.
    fn set_upload_limit(&self, limit: Option<u64>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_info_offsets() {
        let info = TorrentInfo::from_files(
            "pack",
            1024,
            &[
                (PathBuf::from("pack/a.nfo"), 100),
                (PathBuf::from("pack/b.mkv"), 5000),
            ],
        );

        assert_eq!(info.total_length, 5100);
        assert_eq!(info.piece_count, 5);
        assert_eq!(info.files[1].offset, 100);
        assert_eq!(info.files[1].end(), 5100);
        assert_eq!(info.files[1].file_name(), "b.mkv");
        assert_eq!(info.piece_size(0), 1024);
        assert_eq!(info.piece_size(4), 5100 - 4 * 1024);
    }

    #[test]
    fn test_piece_state_run_encoding() {
        let done = PieceState {
            complete: true,
            ..Default::default()
        };
        let empty = PieceState::default();
        let runs = PieceStateRun::encode([done, done, empty, done]);

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].length, 2);
        assert_eq!(runs[1].state, empty);
        assert_eq!(runs[2].length, 1);
        assert!(PieceStateRun::encode([]).is_empty());
    }
}
