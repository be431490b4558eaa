//! Archive extraction through an external program.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, error, info};

/// Video extensions recognized in extraction output.
const VIDEO_PATTERN: &str = r"(?i)\.(mkv|mp4|avi|m4v|mov|wmv|ts|m2ts|mpg|mpeg|webm|flv|divx|ogm)$";

/// Errors from the extraction pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },

    #[error("No playable file in {}", dir.display())]
    NoOutput { dir: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts `archive` into `dest` and returns the file to play.
///
/// A destination that already holds output is reused without running the
/// program again.
///
/// # Errors
///
/// - `ExtractionError::Spawn` - The program could not be started
/// - `ExtractionError::Failed` - The program exited unsuccessfully
/// - `ExtractionError::NoOutput` - Nothing playable was produced
pub async fn extract_archive(
    program: &Path,
    archive: &Path,
    dest: &Path,
) -> Result<PathBuf, ExtractionError> {
    if has_entries(dest).await? {
        info!("Reusing extracted output in {}", dest.display());
        return find_playable(dest).await;
    }

    tokio::fs::create_dir_all(dest).await?;
    let program_name = program.display().to_string();

    // Trailing separator makes unrar treat the target as a directory.
    let mut target = dest.as_os_str().to_owned();
    target.push(std::path::MAIN_SEPARATOR_STR);

    info!(
        "Extracting {} into {} with {}",
        archive.display(),
        dest.display(),
        program_name
    );
    let mut child = Command::new(program)
        .arg("x")
        .arg("-y")
        .arg(archive)
        .arg(&target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExtractionError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    let output_logger = child.stdout.take().map(spawn_output_logger);
    let status = child.wait().await?;
    if let Some(logger) = output_logger {
        let _ = logger.await;
    }

    if !status.success() {
        error!("{} failed on {}: {}", program_name, archive.display(), status);
        return Err(ExtractionError::Failed {
            program: program_name,
            status: status.to_string(),
        });
    }

    find_playable(dest).await
}

/// Logs the program's output line by line so the pipe never fills.
fn spawn_output_logger(stdout: ChildStdout) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                debug!("extract: {}", line);
            }
        }
    })
}

async fn has_entries(dir: &Path) -> Result<bool, std::io::Error> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Picks the playable file in an extraction directory.
///
/// A lone file is used as-is. Otherwise the first video file in sorted
/// order wins.
///
/// # Errors
///
/// - `ExtractionError::NoOutput` - No file qualifies
/// - `ExtractionError::Io` - The directory cannot be read
pub async fn find_playable(dir: &Path) -> Result<PathBuf, ExtractionError> {
    let mut files = Vec::new();
    collect_files(dir, &mut files).await?;
    files.sort();

    if files.len() == 1 {
        return Ok(files.remove(0));
    }

    let video = Regex::new(VIDEO_PATTERN).map_err(|e| {
        ExtractionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })?;
    files
        .into_iter()
        .find(|path| video.is_match(&path.to_string_lossy()))
        .ok_or_else(|| ExtractionError::NoOutput {
            dir: dir.to_path_buf(),
        })
}

fn collect_files<'a>(
    dir: &'a Path,
    out: &'a mut Vec<PathBuf>,
) -> Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                collect_files(&path, out).await?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_single_output_used_as_is() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("movie.bin"), b"x").unwrap();
        assert_eq!(
            find_playable(dir.path()).await.unwrap(),
            dir.path().join("movie.bin")
        );
    }

    #[tokio::test]
    async fn test_first_video_file_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/b.MKV"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/c.mp4"), b"x").unwrap();
        assert_eq!(
            find_playable(dir.path()).await.unwrap(),
            dir.path().join("sub/b.MKV")
        );
    }

    #[tokio::test]
    async fn test_no_playable_output() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("b.nfo"), b"x").unwrap();
        assert!(matches!(
            find_playable(dir.path()).await,
            Err(ExtractionError::NoOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let result = extract_archive(
            Path::new("/nonexistent/undertow-unrar"),
            &dir.path().join("a.rar"),
            &dir.path().join("extracted"),
        )
        .await;
        assert!(matches!(result, Err(ExtractionError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_existing_output_is_reused() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("extracted");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("movie.mkv"), b"x").unwrap();

        // The program would fail to spawn if it were run.
        let result = extract_archive(
            Path::new("/nonexistent/undertow-unrar"),
            &dir.path().join("a.rar"),
            &dest,
        )
        .await
        .unwrap();
        assert_eq!(result, dest.join("movie.mkv"));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-unrar.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_output_is_scanned() {
        let dir = TempDir::new().unwrap();
        // Arguments: x -y <archive> <dest>/
        let script = write_script(
            dir.path(),
            "echo \"Extracting from $3\"\nprintf data > \"$4movie.mkv\"\nprintf n > \"$4info.nfo\"",
        );
        let dest = dir.path().join("extracted");

        let result = extract_archive(&script, &dir.path().join("a.rar"), &dest)
            .await
            .unwrap();
        assert_eq!(result, dest.join("movie.mkv"));
        assert_eq!(std::fs::read(result).unwrap(), b"data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "echo broken archive\nexit 3");
        let result = extract_archive(
            &script,
            &dir.path().join("a.rar"),
            &dir.path().join("extracted"),
        )
        .await;
        assert!(matches!(result, Err(ExtractionError::Failed { .. })));
    }
}
