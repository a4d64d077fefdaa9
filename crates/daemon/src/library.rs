//! Library cache and duplicate scanner.
//!
//! Finding a duplicate means finding an encoded file whose name equals the
//! candidate's output name. A full walk of every media root also refills the
//! cache, later lookups are served from memory until the cache goes stale.

use crate::config::Config;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Lifetime of a full scan when no shared cache keeps it up to date
pub const LOCAL_CACHE_STALENESS: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ScanError {
    /// A media root could not be walked
    #[error("Failed to scan media root {}: {source}", root.display())]
    Root {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Known output paths. Appends never change validity.
#[derive(Debug, Default, Clone)]
pub struct LibraryCache {
    paths: Vec<PathBuf>,
    valid: bool,
    last_update: Option<Instant>,
    /// Paths appended while a full scan is running, `None` outside a scan
    scan_appends: Option<Vec<PathBuf>>,
}

/// Library cache shared between the worker and the broadcast receiver
pub type SharedLibraryCache = Arc<Mutex<LibraryCache>>;

pub fn new_shared_cache() -> SharedLibraryCache {
    Arc::new(Mutex::new(LibraryCache::default()))
}

impl LibraryCache {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Whether the last full scan is too old at `now`.
    ///
    /// With a shared cache the TTL applies, otherwise the fixed local window.
    pub fn is_stale_at(&self, now: Instant, shared_active: bool, ttl: Duration) -> bool {
        let max_age = if shared_active { ttl } else { LOCAL_CACHE_STALENESS };
        match self.last_update {
            None => true,
            Some(at) => now.saturating_duration_since(at) > max_age,
        }
    }

    /// Invalidate when stale. Returns whether the cache is still valid.
    pub fn expire_if_stale(&mut self, now: Instant, shared_active: bool, ttl: Duration) -> bool {
        if self.valid && self.is_stale_at(now, shared_active, ttl) {
            if shared_active {
                info!("invalidating shared cache after {:?} due to ttl", ttl);
            } else {
                info!("auto invalidating local library cache after {:?}", LOCAL_CACHE_STALENESS);
            }
            self.valid = false;
        }
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Add a path produced elsewhere.
    pub fn append(&mut self, path: PathBuf) {
        if let Some(pending) = &mut self.scan_appends {
            pending.push(path.clone());
        }
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Start recording appends so the next [`replace_all`](Self::replace_all)
    /// keeps them.
    pub fn begin_scan(&mut self) {
        self.scan_appends = Some(Vec::new());
    }

    /// Drop the appends recorded for a scan that failed.
    pub fn cancel_scan(&mut self) {
        self.scan_appends = None;
    }

    /// Install the result of a full scan, merged with the paths appended
    /// since [`begin_scan`](Self::begin_scan). Returns those appended paths.
    pub fn replace_all(&mut self, paths: Vec<PathBuf>, now: Instant) -> Vec<PathBuf> {
        let appended = self.scan_appends.take().unwrap_or_default();
        self.paths = paths;
        for path in &appended {
            if !self.paths.contains(path) {
                self.paths.push(path.clone());
            }
        }
        self.valid = true;
        self.last_update = Some(now);
        appended
    }

    /// Cached paths whose file name is `file_name`.
    pub fn find_matches(&self, file_name: &str) -> Vec<PathBuf> {
        self.paths
            .iter()
            .filter(|p| p.file_name().and_then(|n| n.to_str()) == Some(file_name))
            .cloned()
            .collect()
    }
}

/// Result of walking the media roots
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Files named `file_name`
    pub matches: Vec<PathBuf>,
    /// Every file with the output extension
    pub library: Vec<PathBuf>,
}

/// Walk every root, skipping hidden directories.
///
/// An unreadable root fails the scan, unreadable entries below it are skipped.
pub fn scan_roots(roots: &[PathBuf], ext: &str, file_name: &str) -> Result<ScanResult, ScanError> {
    let mut result = ScanResult::default();

    for (idx, root) in roots.iter().enumerate() {
        info!("scanning directory ({}/{}): {}", idx + 1, roots.len(), root.display());
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            // Allow the root directory even if it starts with '.'
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && entry.file_name().to_str().is_some_and(|n| n.starts_with('.')))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(ScanError::Root {
                        root: root.clone(),
                        source: e,
                    })
                }
                Err(e) => {
                    warn!("could not read {:?}, skipping: {}", e.path(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name == file_name {
                info!("found duplicate: {}", entry.path().display());
                result.matches.push(entry.path().to_path_buf());
            }
            if name.ends_with(ext) {
                result.library.push(entry.path().to_path_buf());
            }
        }
    }
    Ok(result)
}

/// Duplicates of `out_name`, from memory when the cache is valid.
pub fn find_duplicates(
    cache: &SharedLibraryCache,
    config: &Config,
    shared_active: bool,
    out_name: &str,
) -> Result<Vec<PathBuf>, ScanError> {
    let file_name = format!("{}{}", out_name, config.ext);
    let ttl = Duration::from_secs(config.shared_cache.cache_ttl_secs);
    {
        let mut cache = cache.lock();
        if cache.expire_if_stale(Instant::now(), shared_active, ttl) {
            info!("scanning via memory cache ({} entries)", cache.paths().len());
            return Ok(cache.find_matches(&file_name));
        }
        cache.begin_scan();
    }

    let mut scan = match scan_roots(&config.media_paths, &config.ext, &file_name) {
        Ok(scan) => scan,
        Err(e) => {
            cache.lock().cancel_scan();
            return Err(e);
        }
    };
    info!("library scan found {} files", scan.library.len());
    let appended = cache.lock().replace_all(scan.library, Instant::now());
    for path in appended {
        let is_match = path.file_name().and_then(|n| n.to_str()) == Some(file_name.as_str());
        if is_match && !scan.matches.contains(&path) {
            info!("found duplicate published during scan: {}", path.display());
            scan.matches.push(path);
        }
    }
    Ok(scan.matches)
}

/// Whether `path` lives directly inside a directory named `dir_name`.
pub fn is_in_dir_named(path: &Path, dir_name: &str) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        == Some(dir_name)
}
