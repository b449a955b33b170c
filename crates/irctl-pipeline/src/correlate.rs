//! Locating and tidying the controller's per-exposure output directories.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use irctl_protocol::{ControlError, ControlResult};
use tokio::fs;
use tracing::debug;

/// Output directories are named after the second they were created, on the
/// controller host's local clock.
pub const DIRECTORY_TIMESTAMP: &str = "%Y%m%d%H%M%S";

/// A local time that falls twice (clocks going back) takes the earlier
/// instant; one skipped by a clock change is not a valid name.
pub fn parse_directory_name(name: &str) -> Option<DateTime<Utc>> {
    if name.len() != 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(name, DIRECTORY_TIMESTAMP)
        .ok()?
        .and_local_timezone(Local)
        .earliest()
        .map(|stamp| stamp.with_timezone(&Utc))
}

pub fn directory_name(stamp: DateTime<Utc>) -> String {
    stamp.with_timezone(&Local).format(DIRECTORY_TIMESTAMP).to_string()
}

/// Pick the candidate with the smallest non-negative offset from
/// `started_at`, compared at whole-second resolution. Candidates are taken in
/// listing order and an equal offset never displaces an earlier candidate;
/// which of two identically-stamped directories wins is otherwise undefined.
pub fn closest_after(
    started_at: DateTime<Utc>,
    candidates: &[(PathBuf, DateTime<Utc>)],
) -> Option<&Path> {
    let start = started_at.trunc_subsecs(0);
    let mut best: Option<(&Path, TimeDelta)> = None;
    for (path, stamp) in candidates {
        let offset = *stamp - start;
        if offset < TimeDelta::zero() {
            continue;
        }
        match best {
            Some((_, best_offset)) if offset >= best_offset => {}
            _ => best = Some((path.as_path(), offset)),
        }
    }
    best.map(|(path, _)| path)
}

pub async fn locate_output(root: &Path, started_at: DateTime<Utc>) -> ControlResult<PathBuf> {
    let mut entries = fs::read_dir(root).await.map_err(|e| {
        ControlError::Pipeline(format!("cannot list {}: {e}", root.display()))
    })?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(stamp) = name.to_str().and_then(parse_directory_name) else {
            debug!(directory = ?name, "ignoring directory without a timestamp name");
            continue;
        };
        candidates.push((entry.path(), stamp));
    }

    closest_after(started_at, &candidates)
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            ControlError::Pipeline(format!(
                "no output directory under {} at or after {}",
                root.display(),
                directory_name(started_at)
            ))
        })
}

/// Frames directly inside `directory` with the given extension, by name.
pub async fn list_frames(directory: &Path, extension: &str) -> ControlResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(directory).await?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if matches {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Reduce an ordered ramp to its first two and last two frames.
pub fn pseudo_cds(mut frames: Vec<PathBuf>) -> Vec<PathBuf> {
    if frames.len() > 4 {
        let tail = frames.split_off(frames.len() - 2);
        frames.truncate(2);
        frames.extend(tail);
    }
    frames
}

/// Remove `directory` and everything below it, deepest directories first.
pub async fn reclaim(directory: &Path) -> ControlResult<()> {
    let mut directories = vec![(directory.to_path_buf(), 0usize)];
    let mut cursor = 0;
    while cursor < directories.len() {
        let (current, depth) = directories[cursor].clone();
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                directories.push((entry.path(), depth + 1));
            } else {
                fs::remove_file(entry.path()).await?;
            }
        }
        cursor += 1;
    }

    directories.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in directories {
        fs::remove_dir(&path).await.map_err(|e| {
            ControlError::Pipeline(format!("cannot remove {}: {e}", path.display()))
        })?;
    }
    Ok(())
}
