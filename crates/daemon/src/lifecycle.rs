//! File lifecycle manager.
//!
//! A media file and its sidecar logs move between lifecycle directories as
//! one unit: either every file of the unit arrives at the destination or the
//! files already moved are put back.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Sources that were encoded successfully
pub const DONE_DIR: &str = "done";
/// Duplicates superseded by a new encode
pub const OBSOLETE_DIR: &str = ".obsolete";
/// Sources rejected because a better duplicate exists
pub const EXISTS_DIR: &str = "exists";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {} to {}: {source}", from.display(), to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy {} to {}: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Move a file, renaming when possible and copying across filesystems.
///
/// On failure the source is left in place and no partial copy remains at `to`.
pub fn move_file(from: &Path, to: &Path) -> Result<(), LifecycleError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let move_err = |source| LifecycleError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    let existed = to.exists();
    if let Err(e) = fs::copy(from, to) {
        if !existed {
            let _ = fs::remove_file(to);
        }
        return Err(move_err(e));
    }
    if let Err(e) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(move_err(e));
    }
    Ok(())
}

pub fn copy_file(from: &Path, to: &Path) -> Result<(), LifecycleError> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| LifecycleError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

fn ensure_dir(dir: &Path) -> Result<(), LifecycleError> {
    fs::create_dir_all(dir).map_err(|source| LifecycleError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Completed moves as `(original, destination)` pairs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MoveRecord {
    moves: Vec<(PathBuf, PathBuf)>,
}

impl MoveRecord {
    pub fn moves(&self) -> &[(PathBuf, PathBuf)] {
        &self.moves
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// New location of `original`, if it was moved.
    pub fn destination_of(&self, original: &Path) -> Option<&Path> {
        self.moves
            .iter()
            .find(|(from, _)| from == original)
            .map(|(_, to)| to.as_path())
    }

    /// Move every file back, newest first. Returns the moves that failed.
    pub fn rollback(&self) -> Vec<LifecycleError> {
        let mut failures = Vec::new();
        for (original, moved) in self.moves.iter().rev() {
            match move_file(moved, original) {
                Ok(()) => info!("rolled back {} to {}", moved.display(), original.display()),
                Err(e) => {
                    error!("rollback failed: {}", e);
                    failures.push(e);
                }
            }
        }
        failures
    }
}

/// `<stem>[ <tag> <YYYY-MM-DD HHMM>]<ext>` for a file moved into a lifecycle directory.
pub fn lifecycle_name(path: &Path, tag: Option<&str>, stamp: &str) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    match tag {
        Some(tag) => format!("{} {} {}{}", stem, tag, stamp, ext),
        None => format!("{}{}", stem, ext),
    }
}

/// Move a media file and its logs into `dst_dir` as one unit.
///
/// `tag` (the deciding module) and a timestamp are appended to every file name
/// when given. If any log cannot be moved, everything already moved is rolled
/// back before the error is returned.
pub fn move_unit(
    media: &Path,
    logs: &[PathBuf],
    dst_dir: &Path,
    tag: Option<&str>,
) -> Result<MoveRecord, LifecycleError> {
    ensure_dir(dst_dir)?;
    let stamp = Local::now().format("%Y-%m-%d %H%M").to_string();
    let mut record = MoveRecord::default();

    let media_dst = dst_dir.join(lifecycle_name(media, tag, &stamp));
    move_file(media, &media_dst)?;
    record.moves.push((media.to_path_buf(), media_dst));

    for log in logs {
        let log_dst = dst_dir.join(lifecycle_name(log, tag, &stamp));
        if let Err(e) = move_file(log, &log_dst) {
            warn!("log move failed, rolling back {} moved files: {}", record.moves.len(), e);
            record.rollback();
            return Err(e);
        }
        record.moves.push((log.clone(), log_dst));
    }
    Ok(record)
}

/// Copy sidecar logs next to the encoded output, renamed after it.
pub fn copy_logs_to_output(logs: &[PathBuf], out_name: &str, dst_dir: &Path) -> Result<(), LifecycleError> {
    ensure_dir(dst_dir)?;
    for log in logs {
        let ext = log
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        copy_file(log, &dst_dir.join(format!("{}{}", out_name, ext)))?;
    }
    Ok(())
}

/// Lifecycle directory next to `path`.
pub fn sibling_dir(path: &Path, dir_name: &str) -> PathBuf {
    path.parent()
        .unwrap_or_else(|| Path::new(""))
        .join(dir_name)
}

/// `.obsolete` directory for a duplicate: under the configured root, else next to it.
pub fn obsolete_dir(obsolete_root: &Path, duplicate: &Path) -> PathBuf {
    if obsolete_root.as_os_str().is_empty() {
        sibling_dir(duplicate, OBSOLETE_DIR)
    } else {
        obsolete_root.join(OBSOLETE_DIR)
    }
}
