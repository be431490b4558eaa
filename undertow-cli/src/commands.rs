//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use undertow_core::config::{ClosePolicy, MIB, UndertowConfig};
use undertow_core::engine::{SimulatedEngine, SimulatedTorrent, TorrentEngine, TorrentInfo};
use undertow_core::playback::{
    ContentRef, EpisodeHint, FileChoice, HeadlessUi, PlayRequest, PlaybackOrchestrator,
    classify_files, plan_selection,
};
use undertow_core::session::DownloadSession;
use undertow_core::UndertowError;
use undertow_core::storage::{JsonRecordStore, RecordStore};
use undertow_core::streaming::{PieceWindow, effective_buffer_size};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Play a simulated torrent end to end with a headless player
    Simulate {
        /// Size of the simulated video file in MiB
        #[arg(long, default_value = "700")]
        size_mb: u64,
        /// Piece length in KiB
        #[arg(long, default_value = "1024")]
        piece_kb: u64,
        /// Simulated swarm bandwidth in MiB/s
        #[arg(long, default_value = "8")]
        bandwidth_mb: u64,
        /// How long the headless player plays, in seconds
        #[arg(long, default_value = "10")]
        play_secs: u64,
        /// Buffer window size in MiB
        #[arg(long)]
        buffer_mb: Option<u64>,
        /// Working directory for downloads and records
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print the buffer window for a file
    Window {
        /// Torrent-absolute offset of the file in bytes
        #[arg(long, default_value = "0")]
        offset: u64,
        /// File length in bytes
        #[arg(long)]
        length: u64,
        /// Piece length in bytes
        #[arg(long)]
        piece_length: u64,
        /// Buffer size in bytes (defaults to the configured size)
        #[arg(long)]
        buffer: Option<u64>,
    },
    /// Show which file would be played from a file list
    Select {
        /// Files as `name:size_in_bytes`
        #[arg(required = true)]
        files: Vec<String>,
        /// Season number for episode matching
        #[arg(long, requires = "episode")]
        season: Option<u32>,
        /// Episode number for episode matching
        #[arg(long, requires = "season")]
        episode: Option<u32>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failure of the command that ran
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            size_mb,
            piece_kb,
            bandwidth_mb,
            play_secs,
            buffer_mb,
            dir,
        } => {
            run_simulation(SimulationArgs {
                size: size_mb * MIB,
                piece_length: piece_kb * 1024,
                bandwidth: bandwidth_mb * MIB,
                play_for: Duration::from_secs(play_secs),
                buffer_size: buffer_mb.map(|mb| mb * MIB),
                dir,
            })
            .await
        }
        Commands::Window {
            offset,
            length,
            piece_length,
            buffer,
        } => show_window(offset, length, piece_length, buffer),
        Commands::Select {
            files,
            season,
            episode,
        } => show_selection(&files, season.zip(episode)),
    }
}

struct SimulationArgs {
    size: u64,
    piece_length: u64,
    bandwidth: u64,
    play_for: Duration,
    buffer_size: Option<u64>,
    dir: Option<PathBuf>,
}

/// Runs one playback session against the simulated engine.
///
/// # Errors
/// - Invalid sizes, session setup failures or a failed playback attempt
async fn run_simulation(args: SimulationArgs) -> anyhow::Result<()> {
    if args.piece_length == 0 || args.size == 0 {
        bail!("file size and piece length must be positive");
    }

    let root = args
        .dir
        .unwrap_or_else(|| std::env::temp_dir().join("undertow-simulation"));
    let mut config = UndertowConfig::from_env();
    config.storage.download_path = root.join("downloads");
    config.storage.torrents_path = root.join("downloads/.torrents");
    config.storage.movies_library_path = root.join("library/Movies");
    config.storage.shows_library_path = root.join("library/Shows");
    if let Some(buffer_size) = args.buffer_size {
        config.streaming.buffer_size = buffer_size;
    }
    config.playback.keep_downloading = ClosePolicy::Never;
    config.playback.keep_files_playing = ClosePolicy::Never;
    config.playback.keep_files_finished = ClosePolicy::Never;

    let engine = Arc::new(simulated_engine(&config, args.bandwidth));
    let magnet = engine.register(SimulatedTorrent::new(
        "Simulated.Movie.2024",
        args.piece_length,
        [
            ("Simulated.Movie.2024/movie.nfo", 4 * 1024),
            ("Simulated.Movie.2024/movie.mkv", args.size),
            ("Simulated.Movie.2024/movie.srt", 64 * 1024),
        ],
    ));

    let records: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::new(root.join("records")));
    let ui = Arc::new(HeadlessUi::new(args.play_for));
    let session = DownloadSession::new(
        engine as Arc<dyn TorrentEngine>,
        config,
        records,
        ui.clone(),
    )
    .context("failed to create download session")?
    .start();

    let orchestrator = Arc::new(PlaybackOrchestrator::new(Arc::clone(&session), ui));
    let request = PlayRequest::new(magnet).with_content(ContentRef::movie("sim-1"));

    println!("Simulating playback session {}", orchestrator.id());
    let playback = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.play(request).await })
    };

    let result = tokio::select! {
        result = playback => result.context("playback task failed")?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel();
            println!("Cancelling...");
            bail!("interrupted");
        }
    };
    session.shutdown();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            let error = UndertowError::from(e);
            if error.is_user_error() {
                println!("{}", error.user_message());
                return Ok(());
            }
            bail!("playback failed: {}", error.user_message());
        }
    };
    println!("Played file {} of {}", summary.file_index, summary.info_hash);
    println!(
        "  Watched {:.0}s of {:.0}s ({})",
        summary.watched_time,
        summary.duration,
        if summary.watched { "watched" } else { "not finished" }
    );
    println!(
        "  Kept downloading: {}, files deleted: {}",
        summary.close.kept_downloading, summary.close.files_deleted
    );
    Ok(())
}

/// Engine for `simulate`, honouring the configured storage mode.
fn simulated_engine(config: &UndertowConfig, bandwidth: u64) -> SimulatedEngine {
    SimulatedEngine::new()
        .with_bandwidth(bandwidth)
        .with_storage_mode(config.storage.mode)
}

/// Prints the piece window for a file.
///
/// # Errors
/// - Zero piece length
fn show_window(
    offset: u64,
    length: u64,
    piece_length: u64,
    buffer: Option<u64>,
) -> anyhow::Result<()> {
    let config = UndertowConfig::from_env();
    let buffer_size = buffer.unwrap_or_else(|| {
        effective_buffer_size(&config.streaming, config.storage.mode)
    });
    let window = PieceWindow::compute(
        offset,
        length,
        piece_length,
        buffer_size,
        config.streaming.tail_pin_bytes,
    )?;
    let (tail_offset, tail_length) = window.tail_region();

    println!("Buffer Window");
    println!("{:-<60}", "");
    println!("Pieces:      {}..={}", window.start_piece, window.end_piece);
    println!("Piece count: {}", window.piece_count());
    println!("Read-ahead:  {} bytes", window.byte_length());
    println!("Tail pin:    {tail_length} bytes at offset {tail_offset}");
    Ok(())
}

/// Prints the classification and selection plan for a file list.
///
/// # Errors
/// - Malformed `name:size` entries
fn show_selection(entries: &[String], episode: Option<(u32, u32)>) -> anyhow::Result<()> {
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let (name, size) = entry
            .rsplit_once(':')
            .with_context(|| format!("expected name:size, got '{entry}'"))?;
        let size: u64 = size
            .parse()
            .with_context(|| format!("invalid size in '{entry}'"))?;
        files.push((PathBuf::from(name), size));
    }

    let config = UndertowConfig::from_env().playback;
    let info = TorrentInfo::from_files("selection", MIB, &files);
    let classification = classify_files(
        &info.files,
        config.candidate_min_size,
        config.archive_min_size,
    );
    let name_of = |index: usize| {
        info.file(index)
            .map(|file| file.path.display().to_string())
            .unwrap_or_default()
    };

    println!("File Selection");
    println!("{:-<60}", "");
    if let Some(largest) = classification.largest {
        println!("Largest:    {}", name_of(largest));
    }
    let candidates: Vec<String> = classification.candidates.iter().map(|&i| name_of(i)).collect();
    println!("Candidates: {}", candidates.join(", "));
    if let Some(archive) = classification.archive {
        println!("Archive:    {}", name_of(archive));
    }

    let hint = episode.map(|(season, episode)| EpisodeHint { season, episode });
    match plan_selection(
        &info.files,
        config.candidate_min_size,
        config.archive_min_size,
        None,
        hint,
    ) {
        Some(FileChoice::Auto(index)) => println!("Plays:      {}", name_of(index)),
        Some(FileChoice::Archive(index)) => {
            println!("Plays:      {} (after confirmation and extraction)", name_of(index))
        }
        Some(FileChoice::Prompt(listing)) => {
            println!("Plays:      user choice from");
            for (_, name) in listing {
                println!("  {name}");
            }
        }
        None => println!("Plays:      nothing (empty list)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use undertow_core::config::StorageMode;

    use super::*;

    #[test]
    fn test_simulated_engine_uses_configured_storage_mode() {
        let mut config = UndertowConfig::default();
        config.storage.mode = StorageMode::Memory {
            capacity: 64 * MIB,
        };

        let engine = simulated_engine(&config, MIB);
        assert_eq!(engine.storage_mode(), config.storage.mode);
    }
}
