//! Progressive playback on top of an in-progress download.
//!
//! A playback session asks a [`StreamingDownload`] to buffer the head of a
//! file. The download computes a [`PieceWindow`], pushes those pieces to the
//! front of the engine's queue and signals once they are all present. After
//! that, [`SequentialReader`] serves the file as a seekable byte stream while
//! the rest of the torrent keeps downloading.

pub mod download;
pub mod outcome;
pub mod piece_window;
pub mod rate;
pub mod reader;
pub mod state;

pub use download::{
    BufferInterrupted, BufferResult, DownloadContext, DownloadFlags, DownloadStatus, ItemLookup,
    LinkedItem, StreamingDownload, StreamingError, TransferRates,
};
pub use outcome::SingleShot;
pub use piece_window::{PieceWindow, PieceWindowError, effective_buffer_size};
pub use rate::{RATE_WINDOW, RateSample};
pub use reader::{ReaderError, SequentialReader};
pub use state::{DownloadState, StateInputs, derive_state, progress_percent};
