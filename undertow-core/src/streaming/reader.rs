//! File-scoped reader over an in-progress download.
//!
//! Wraps the engine's torrent-wide positional reader and exposes a single
//! file as a seekable stream starting at zero. Players and HTTP range
//! handlers seek in file-relative offsets; the reader translates them to
//! torrent-absolute offsets.

use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio::sync::watch;
use tracing::debug;

use crate::engine::{DownloadHandle, EngineReader};
use crate::torrent::InfoHash;

/// Errors that can occur when opening or using a sequential reader.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("Torrent metadata is not available yet")]
    MetadataUnavailable,

    #[error("File index {index} out of range ({count} files)")]
    FileNotFound { index: usize, count: usize },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Seekable byte stream over one file of a download.
pub struct SequentialReader {
    id: u16,
    info_hash: InfoHash,
    file_index: usize,
    file_offset: u64,
    file_length: u64,
    inner: Box<dyn EngineReader>,
    position: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for SequentialReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialReader")
            .field("id", &self.id)
            .field("info_hash", &self.info_hash)
            .field("file_index", &self.file_index)
            .field("position", &self.position())
            .finish()
    }
}

impl SequentialReader {
    /// Opens a reader positioned at the start of `file_index`.
    ///
    /// Spawns a watchdog that logs the read position every
    /// `watchdog_interval` until the reader is closed or dropped.
    ///
    /// # Errors
    ///
    /// - `ReaderError::MetadataUnavailable` - Torrent info not known yet
    /// - `ReaderError::FileNotFound` - Index outside the torrent's file list
    /// - `ReaderError::Io` - Initial seek failed
    pub async fn open(
        handle: &dyn DownloadHandle,
        file_index: usize,
        readahead: u64,
        watchdog_interval: Duration,
    ) -> Result<Self, ReaderError> {
        let info = handle.info().ok_or(ReaderError::MetadataUnavailable)?;
        let file = info.file(file_index).ok_or(ReaderError::FileNotFound {
            index: file_index,
            count: info.files.len(),
        })?;

        let mut inner = handle.new_reader();
        inner.seek(SeekFrom::Start(file.offset)).await?;
        inner.set_readahead(readahead);

        let id = rand::random::<u16>();
        let info_hash = handle.info_hash();
        let position = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_watchdog(
            id,
            info_hash,
            file.length,
            Arc::clone(&position),
            watchdog_interval,
            shutdown_rx,
        ));

        debug!(
            "Opened reader {:04x} for {} file {} ({} bytes at offset {})",
            id, info_hash, file_index, file.length, file.offset
        );

        Ok(Self {
            id,
            info_hash,
            file_index,
            file_offset: file.offset,
            file_length: file.length,
            inner,
            position,
            shutdown_tx,
        })
    }

    /// Log correlation id.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn len(&self) -> u64 {
        self.file_length
    }

    pub fn is_empty(&self) -> bool {
        self.file_length == 0
    }

    /// Current file-relative position.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    /// Changes how far past the current position the engine prioritizes.
    pub fn set_readahead(&mut self, bytes: u64) {
        self.inner.set_readahead(bytes);
    }

    /// Stops the watchdog. Reads keep working; the reader is simply detached
    /// from diagnostics.
    pub fn close(&self) {
        if !*self.shutdown_tx.borrow() {
            debug!("Closing reader {:04x} for {}", self.id, self.info_hash);
            let _ = self.shutdown_tx.send(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn remaining(&self) -> u64 {
        self.file_length.saturating_sub(self.position())
    }
}

impl Drop for SequentialReader {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl AsyncRead for SequentialReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let remaining = self.remaining();
        if remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // Never hand the engine more room than the file has left, or it
        // would read into the next file.
        let limit = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let read = {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(limit));
            match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
                Poll::Ready(Ok(())) => limited.filled().len(),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        };
        buf.advance(read);

        self.position.fetch_add(read as u64, Ordering::Relaxed);
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for SequentialReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let current = self.position() as i128;
        let target = match position {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => current + delta as i128,
            SeekFrom::End(delta) => self.file_length as i128 + delta as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }

        let absolute = self.file_offset + target as u64;
        Pin::new(&mut self.inner).start_seek(SeekFrom::Start(absolute))
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        match Pin::new(&mut self.inner).poll_complete(cx) {
            Poll::Ready(Ok(absolute)) => {
                let relative = absolute.saturating_sub(self.file_offset);
                self.position.store(relative, Ordering::Relaxed);
                Poll::Ready(Ok(relative))
            }
            other => other,
        }
    }
}

async fn run_watchdog(
    id: u16,
    info_hash: InfoHash,
    length: u64,
    position: Arc<AtomicU64>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!(
                    "Reader {:04x} for {} at {}/{}",
                    id,
                    info_hash,
                    position.load(Ordering::Relaxed),
                    length
                );
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Reader {:04x} watchdog stopped", id);
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use super::*;
    use crate::engine::simulated::synthetic_byte;
    use crate::engine::{SimulatedEngine, SimulatedTorrent, TorrentEngine};

    async fn two_file_download() -> Arc<dyn DownloadHandle> {
        let engine = SimulatedEngine::new();
        let magnet = engine.register(SimulatedTorrent::new(
            "Pack",
            1024,
            [
                (PathBuf::from("Pack/intro.nfo"), 1000u64),
                (PathBuf::from("Pack/movie.mkv"), 5000u64),
            ],
        ));
        let handle = engine.add_magnet(&magnet).await.unwrap();
        handle.wait_for_info().await;
        handle
    }

    #[tokio::test]
    async fn test_reads_stay_inside_file() {
        let handle = two_file_download().await;
        let mut reader = SequentialReader::open(handle.as_ref(), 0, 0, Duration::from_secs(60))
            .await
            .unwrap();

        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();

        assert_eq!(content.len(), 1000);
        assert_eq!(content[999], synthetic_byte(999));
        assert_eq!(reader.position(), 1000);
    }

    #[tokio::test]
    async fn test_large_read_near_end_is_clipped() {
        let handle = two_file_download().await;
        let mut reader = SequentialReader::open(handle.as_ref(), 0, 0, Duration::from_secs(60))
            .await
            .unwrap();
        reader.seek(SeekFrom::End(-10)).await.unwrap();

        let mut chunk = [0xffu8; 64];
        let read = reader.read(&mut chunk).await.unwrap();
        assert_eq!(read, 10);
        assert_eq!(chunk[9], synthetic_byte(999));
        assert_eq!(chunk[10], 0xff);
        assert_eq!(reader.read(&mut chunk).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seek_is_file_relative() {
        let handle = two_file_download().await;
        let mut reader = SequentialReader::open(handle.as_ref(), 1, 0, Duration::from_secs(60))
            .await
            .unwrap();

        let position = reader.seek(SeekFrom::Start(10)).await.unwrap();
        assert_eq!(position, 10);

        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], synthetic_byte(1010));

        let end = reader.seek(SeekFrom::End(-1)).await.unwrap();
        assert_eq!(end, 4999);
        assert!(reader.seek(SeekFrom::Current(-10_000)).await.is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_file() {
        let handle = two_file_download().await;
        let result = SequentialReader::open(handle.as_ref(), 5, 0, Duration::from_secs(60)).await;
        assert!(matches!(
            result,
            Err(ReaderError::FileNotFound { index: 5, count: 2 })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let handle = two_file_download().await;
        let reader = SequentialReader::open(handle.as_ref(), 1, 0, Duration::from_millis(10))
            .await
            .unwrap();
        reader.close();
        reader.close();
        assert!(reader.is_closed());
    }
}
