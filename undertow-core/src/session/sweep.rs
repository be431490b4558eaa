//! Moves completed downloads into the media library.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{DownloadSession, SessionError};
use crate::config::StorageConfig;
use crate::engine::TorrentInfo;
use crate::storage::{DownloadRecord, RecordState, lookup_record};
use crate::streaming::{DownloadState, StreamingDownload};

/// Library folder a completed download belongs in.
///
/// Movies go straight into the movies root. Shows go into
/// `<shows root>/<title>/Season <n>` when the season is known.
pub fn library_destination(
    storage: &StorageConfig,
    record: Option<&DownloadRecord>,
    fallback_title: &str,
) -> PathBuf {
    let Some(record) = record.filter(|r| r.content_type.is_show()) else {
        return storage.movies_library_path.clone();
    };

    let title = record.title.as_deref().unwrap_or(fallback_title);
    let mut path = storage.shows_library_path.join(sanitize_component(title));
    if let Some(season) = record.season {
        path.push(format!("Season {season}"));
    }
    path
}

/// Replaces characters that are invalid in folder names on common platforms.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Top-level entries a torrent occupies under the download path.
pub fn top_level_entries(info: &TorrentInfo) -> Vec<PathBuf> {
    let roots: BTreeSet<PathBuf> = info
        .files
        .iter()
        .filter_map(|file| match file.path.components().next() {
            Some(Component::Normal(first)) => Some(PathBuf::from(first)),
            _ => None,
        })
        .collect();
    roots.into_iter().collect()
}

/// Renames `from` to `to`, copying across filesystems when needed.
///
/// # Errors
///
/// - `std::io::Error` - Source missing or destination not writable
pub async fn move_path(from: &Path, to: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "Rename {} -> {} failed ({}), copying",
                from.display(),
                to.display(),
                e
            );
            copy_recursive(from, to).await?;
            remove_path(from).await
        }
    }
}

fn copy_recursive<'a>(
    from: &'a Path,
    to: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send + 'a>> {
    Box::pin(async move {
        let metadata = tokio::fs::metadata(from).await?;
        if !metadata.is_dir() {
            tokio::fs::copy(from, to).await?;
            return Ok(());
        }

        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            copy_recursive(&entry.path(), &to.join(entry.file_name())).await?;
        }
        Ok(())
    })
}

/// Removes a file or directory tree. Missing paths are not an error.
///
/// # Errors
///
/// - `std::io::Error` - Removal failed
pub async fn remove_path(path: &Path) -> Result<(), std::io::Error> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// One pass over the active downloads.
///
/// Returns how many downloads were moved. A failing item is logged and left
/// in place for the next pass.
pub async fn sweep_completed(session: &DownloadSession) -> usize {
    if !session.config().session.move_completed {
        return 0;
    }

    let mut moved = 0;
    for download in session.downloads() {
        if download.flags().is_playing || download.state() != DownloadState::Finished {
            continue;
        }
        match move_to_library(session, &download).await {
            Ok(destination) => {
                moved += 1;
                info!(
                    "Moved {} into library at {}",
                    download.info_hash(),
                    destination.display()
                );
            }
            Err(e) => warn!(
                "Failed to move {} into library, retrying next sweep: {}",
                download.info_hash(),
                e
            ),
        }
    }
    moved
}

async fn move_to_library(
    session: &DownloadSession,
    download: &Arc<StreamingDownload>,
) -> Result<PathBuf, SessionError> {
    let info_hash = download.info_hash();
    let info = download
        .handle()
        .info()
        .ok_or(SessionError::MetadataUnavailable { info_hash })?;
    let storage = &session.config().storage;

    let record = match download.record() {
        Some(record) => Some(record),
        None => lookup_record(session.records().as_ref(), info_hash).await,
    };
    let destination = library_destination(storage, record.as_ref(), &info.name);
    tokio::fs::create_dir_all(&destination).await?;

    for entry in top_level_entries(&info) {
        let source = storage.download_path.join(&entry);
        if tokio::fs::try_exists(&source).await? {
            move_path(&source, &destination.join(&entry)).await?;
        }
    }

    // Files are already moved, so drop without deleting anything.
    if let Some(task) = session.remove_torrent(info_hash, false) {
        let _ = task.await;
    }
    session.delete_descriptor(info_hash).await;

    if let Some(mut record) = record {
        record.state = RecordState::Removed;
        record.updated_at = Utc::now();
        if let Err(e) = session.records().set(info_hash, record).await {
            warn!("Failed to mark record {} removed: {}", info_hash, e);
        }
    }
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DownloadRecord;

    fn storage() -> StorageConfig {
        StorageConfig {
            movies_library_path: PathBuf::from("/lib/Movies"),
            shows_library_path: PathBuf::from("/lib/Shows"),
            ..Default::default()
        }
    }

    #[test]
    fn test_movie_destination() {
        let record = DownloadRecord::movie("tt1", 0);
        assert_eq!(
            library_destination(&storage(), Some(&record), "Movie.2020"),
            PathBuf::from("/lib/Movies")
        );
        assert_eq!(
            library_destination(&storage(), None, "Movie.2020"),
            PathBuf::from("/lib/Movies")
        );
    }

    #[test]
    fn test_show_destination_has_season_folder() {
        let record = DownloadRecord::episode("ep", "show", 2, 5, 0).with_title("Some: Show");
        assert_eq!(
            library_destination(&storage(), Some(&record), "pack"),
            PathBuf::from("/lib/Shows/Some_ Show/Season 2")
        );

        let untitled = DownloadRecord::episode("ep", "show", 1, 1, 0);
        assert_eq!(
            library_destination(&storage(), Some(&untitled), "Pack"),
            PathBuf::from("/lib/Shows/Pack/Season 1")
        );
    }

    #[test]
    fn test_top_level_entries() {
        let info = TorrentInfo::from_files(
            "Pack",
            1024,
            &[
                (PathBuf::from("Pack/a.mkv"), 10),
                (PathBuf::from("Pack/sub/b.srt"), 10),
                (PathBuf::from("loose.nfo"), 10),
            ],
        );
        assert_eq!(
            top_level_entries(&info),
            vec![PathBuf::from("Pack"), PathBuf::from("loose.nfo")]
        );
    }

    #[tokio::test]
    async fn test_move_path_directory_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("downloads/Pack");
        std::fs::create_dir_all(source.join("sub")).unwrap();
        std::fs::write(source.join("a.mkv"), b"movie").unwrap();
        std::fs::write(source.join("sub/b.srt"), b"subs").unwrap();

        let target = dir.path().join("library/Movies/Pack");
        move_path(&source, &target).await.unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read(target.join("a.mkv")).unwrap(), b"movie");
        assert_eq!(std::fs::read(target.join("sub/b.srt")).unwrap(), b"subs");
    }

    #[tokio::test]
    async fn test_copy_fallback_and_remove_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("Pack");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.mkv"), b"movie").unwrap();

        let copy = dir.path().join("Copy");
        copy_recursive(&source, &copy).await.unwrap();
        assert_eq!(std::fs::read(copy.join("a.mkv")).unwrap(), b"movie");

        remove_path(&source).await.unwrap();
        remove_path(&source).await.unwrap();
        assert!(!source.exists());
    }
}
