//! Buffer window computation.
//!
//! Maps a file's byte range inside a torrent to the contiguous run of pieces
//! that must be present before playback starts, plus the trailing region that
//! is pinned so players can read container indexes stored at the end.

use crate::config::{StorageMode, StreamingConfig};

/// Errors that can occur when computing a buffer window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PieceWindowError {
    #[error("Piece length must be greater than zero")]
    ZeroPieceLength,
}

/// Contiguous inclusive range of pieces to buffer for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWindow {
    pub start_piece: u32,
    pub end_piece: u32,
    pub piece_length: u64,
    pub tail_pin_bytes: u64,
    file_offset: u64,
    file_length: u64,
}

impl PieceWindow {
    /// Computes the window for a file at `file_offset` spanning `file_length`
    /// bytes.
    ///
    /// `start_piece = floor(offset / piece_length)`, the window covers
    /// `ceil(buffer_size / piece_length)` pieces and is clamped to the file's
    /// last piece.
    ///
    /// # Errors
    ///
    /// - `PieceWindowError::ZeroPieceLength` - If `piece_length` is zero
    pub fn compute(
        file_offset: u64,
        file_length: u64,
        piece_length: u64,
        buffer_size: u64,
        tail_pin_bytes: u64,
    ) -> Result<Self, PieceWindowError> {
        if piece_length == 0 {
            return Err(PieceWindowError::ZeroPieceLength);
        }

        let start_piece = file_offset / piece_length;
        let buffer_pieces = buffer_size.div_ceil(piece_length).max(1);
        let last_file_piece = if file_length == 0 {
            start_piece
        } else {
            (file_offset + file_length - 1) / piece_length
        };
        let end_piece = (start_piece + buffer_pieces - 1).min(last_file_piece);

        Ok(Self {
            start_piece: start_piece as u32,
            end_piece: end_piece as u32,
            piece_length,
            tail_pin_bytes: tail_pin_bytes.min(file_length),
            file_offset,
            file_length,
        })
    }

    /// Number of pieces in the window.
    pub fn piece_count(&self) -> u32 {
        self.end_piece - self.start_piece + 1
    }

    /// Bytes covered by the window, used as the reader's read-ahead.
    pub fn byte_length(&self) -> u64 {
        self.piece_count() as u64 * self.piece_length
    }

    pub fn contains(&self, piece: u32) -> bool {
        (self.start_piece..=self.end_piece).contains(&piece)
    }

    pub fn pieces(&self) -> std::ops::RangeInclusive<u32> {
        self.start_piece..=self.end_piece
    }

    /// Torrent-absolute `(offset, length)` of the pinned file tail.
    pub fn tail_region(&self) -> (u64, u64) {
        (
            self.file_offset + self.file_length - self.tail_pin_bytes,
            self.tail_pin_bytes,
        )
    }
}

/// Buffer size actually used for a window.
///
/// With memory-backed storage the window cannot exceed the memory capacity;
/// the result never drops below the configured minimum.
pub fn effective_buffer_size(config: &StreamingConfig, mode: StorageMode) -> u64 {
    let mut size = config.buffer_size;
    if let StorageMode::Memory { capacity } = mode
        && capacity < size
    {
        size = capacity;
    }
    size.max(config.min_buffer_size)
}
