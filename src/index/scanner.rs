//! Folder import for the media index.
//!
//! Walks a folder for video files and guesses what each one is from its
//! file name alone: `Show.Name.S01E02.Title.avi` and `Show Name 1x02.mkv`
//! become episodes, everything else a movie with an optional year.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{IndexError, MediaIndex, MediaKind, MediaRecord};

/// File extensions treated as video
pub const VIDEO_EXTENSIONS: &[&str] = &["avi", "mkv", "mp4", "ogm", "m4v", "mov", "wmv", "mpg"];

/// Errors that can occur while importing a folder
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read directory {path}: {source}")]
    DirectoryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to store record: {0}")]
    Index(#[from] IndexError),
}

/// Summary of one import run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub movies: usize,
    pub episodes: usize,
    pub skipped: usize,
}

/// Import every video file under `root` into the index.
///
/// Unreadable subdirectories are logged and skipped; only a failure to read
/// `root` itself aborts the scan.
pub fn scan_folder(index: &MediaIndex, root: &Path) -> Result<ScanSummary, ScanError> {
    info!(folder = %root.display(), "Scanning shared folder");

    let mut summary = ScanSummary::default();
    let mut pending = vec![root.to_path_buf()];
    let mut is_root = true;

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if is_root => {
                return Err(ScanError::DirectoryRead { path: dir, source });
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        is_root = false;

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                summary.skipped += 1;
                continue;
            };

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_video(&path) {
                let relative = path.strip_prefix(root).unwrap_or(&path);
                let record = guess_record(relative);
                debug!(path = %path.display(), kind = ?record.kind, title = %record.title, "Indexing file");
                match record.kind {
                    MediaKind::Movie => summary.movies += 1,
                    MediaKind::Episode => summary.episodes += 1,
                }
                index.upsert(&record)?;
            } else {
                summary.skipped += 1;
            }
        }
    }

    info!(
        movies = summary.movies,
        episodes = summary.episodes,
        skipped = summary.skipped,
        "Scan complete"
    );
    Ok(summary)
}

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Guess metadata from a file name.
pub fn guess_record(path: &Path) -> MediaRecord {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let words: Vec<&str> = stem
        .split(|c: char| c == '.' || c == '_' || c == ' ' || c == '-')
        .filter(|w| !w.is_empty())
        .collect();

    for (idx, word) in words.iter().enumerate() {
        if let Some((season, episode)) = parse_episode_marker(word) {
            let series = words[..idx].join(" ");
            if series.is_empty() {
                break;
            }
            let title = words[idx + 1..].join(" ");
            return MediaRecord::episode(series, season, episode, title, path);
        }
    }

    // Movie: everything before the last plausible year, release tags dropped
    let year_pos = words
        .iter()
        .enumerate()
        .skip(1)
        .rev()
        .find_map(|(idx, w)| parse_year(w).map(|year| (idx, year)));

    match year_pos {
        Some((idx, year)) => MediaRecord::movie(words[..idx].join(" "), Some(year), path),
        None if words.is_empty() => MediaRecord::movie(stem, None, path),
        None => MediaRecord::movie(words.join(" "), None, path),
    }
}

/// `S01E02` or `1x02`, case-insensitive
fn parse_episode_marker(word: &str) -> Option<(u32, u32)> {
    let lower = word.to_lowercase();

    if let Some(rest) = lower.strip_prefix('s') {
        let (season, episode) = rest.split_once('e')?;
        return parse_pair(season, episode);
    }

    let (season, episode) = lower.split_once('x')?;
    if episode.len() < 2 {
        return None;
    }
    parse_pair(season, episode)
}

fn parse_pair(season: &str, episode: &str) -> Option<(u32, u32)> {
    if season.is_empty() || episode.is_empty() {
        return None;
    }
    if !season.chars().all(|c| c.is_ascii_digit()) || !episode.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((season.parse().ok()?, episode.parse().ok()?))
}

fn parse_year(word: &str) -> Option<i32> {
    let trimmed = word.trim_matches(|c| c == '(' || c == ')' || c == '[' || c == ']');
    if trimmed.len() != 4 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = trimmed.parse().ok()?;
    (1900..=2099).contains(&year).then_some(year)
}
