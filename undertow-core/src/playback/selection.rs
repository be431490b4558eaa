//! Which file of a torrent to play, and which subtitle goes with it.

use std::path::Path;

use regex::Regex;
use tracing::{debug, warn};

use crate::engine::TorrentFile;

/// Size-based classification of a torrent's file list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Index of the single largest file
    pub largest: Option<usize>,
    /// Files above the candidate threshold, in torrent order
    pub candidates: Vec<usize>,
    /// First `.rar` above the archive threshold
    pub archive: Option<usize>,
}

/// Classifies files by size and extension.
pub fn classify_files(files: &[TorrentFile], candidate_min: u64, archive_min: u64) -> Classification {
    let mut classification = Classification::default();
    let mut largest_size = 0;

    for file in files {
        if classification.largest.is_none() || file.length > largest_size {
            classification.largest = Some(file.index);
            largest_size = file.length;
        }
        if file.length > candidate_min {
            classification.candidates.push(file.index);
        }
        if classification.archive.is_none() && file.length > archive_min && is_rar(&file.path) {
            classification.archive = Some(file.index);
        }
    }

    classification
}

fn is_rar(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("rar"))
}

/// Returns the only candidate whose name carries `S<season>E<episode>`.
///
/// Leading zeros are tolerated and case is ignored. Zero or several matches
/// yield `None`.
pub fn match_episode(
    files: &[TorrentFile],
    candidates: &[usize],
    season: u32,
    episode: u32,
) -> Option<usize> {
    let pattern = format!(r"(?i)\bs0*{season}e0*{episode}\b");
    let regex = match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!("Invalid episode pattern {}: {}", pattern, e);
            return None;
        }
    };

    let mut matches = candidates
        .iter()
        .filter_map(|&index| files.iter().find(|f| f.index == index))
        .filter(|file| regex.is_match(&file.file_name()));

    let first = matches.next()?;
    if matches.next().is_some() {
        debug!("Several files match S{:02}E{:02}", season, episode);
        return None;
    }
    Some(first.index)
}

/// Candidates sorted by file name, as `(index, name)` pairs.
pub fn sorted_listing(files: &[TorrentFile], candidates: &[usize]) -> Vec<(usize, String)> {
    let mut listing: Vec<(usize, String)> = candidates
        .iter()
        .filter_map(|&index| files.iter().find(|f| f.index == index))
        .map(|file| (file.index, file.file_name()))
        .collect();
    listing.sort_by(|a, b| a.1.cmp(&b.1));
    listing
}

/// Episode hint used to disambiguate season packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeHint {
    pub season: u32,
    pub episode: u32,
}

/// Outcome of automatic file selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChoice {
    /// Play this file without asking
    Auto(usize),
    /// Whole-archive download, needs confirmation first
    Archive(usize),
    /// Ask the user to pick from this sorted listing
    Prompt(Vec<(usize, String)>),
}

/// Decides which file to play, or whether the user must choose.
///
/// Returns `None` when the torrent has no files.
pub fn plan_selection(
    files: &[TorrentFile],
    candidate_min: u64,
    archive_min: u64,
    explicit_index: Option<usize>,
    hint: Option<EpisodeHint>,
) -> Option<FileChoice> {
    let classification = classify_files(files, candidate_min, archive_min);

    if let Some(archive) = classification.archive {
        return Some(FileChoice::Archive(archive));
    }

    if classification.candidates.len() <= 1 {
        return classification.largest.map(FileChoice::Auto);
    }

    if let Some(index) = explicit_index {
        if index < files.len() {
            return Some(FileChoice::Auto(index));
        }
        warn!("Ignoring out-of-range file index {}", index);
    }

    if let Some(hint) = hint
        && let Some(index) = match_episode(
            files,
            &classification.candidates,
            hint.season,
            hint.episode,
        )
    {
        return Some(FileChoice::Auto(index));
    }

    Some(FileChoice::Prompt(sorted_listing(
        files,
        &classification.candidates,
    )))
}

/// Picks a subtitle for `chosen`.
///
/// Prefers `<same stem>.srt` next to the chosen file, then the torrent's
/// only `.srt` file.
pub fn choose_subtitle(files: &[TorrentFile], chosen: usize) -> Option<usize> {
    let chosen = files.iter().find(|f| f.index == chosen)?;
    let expected = chosen.path.with_extension("srt");
    if let Some(exact) = files.iter().find(|f| f.path == expected) {
        return Some(exact.index);
    }

    let mut subtitles = files.iter().filter(|f| {
        f.path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("srt"))
    });
    let only = subtitles.next()?;
    if subtitles.next().is_some() {
        return None;
    }
    Some(only.index)
}
