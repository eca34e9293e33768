//! Scratch cache directory management.
//!
//! Owns the working directory used to stage library copies during
//! processing: collision-free temporary filenames, the derived encode
//! output name, and startup purging of leftovers from prior runs.

use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Prefix of every cache file created in the working directory.
pub const CACHE_PREFIX: &str = "cache_";
/// Suffix of every cache file.
pub const CACHE_SUFFIX: &str = ".tmp";
/// Additional suffix the encoder output variant carries.
pub const ENCODE_SUFFIX: &str = ".mp4";

/// Length of the random identifier fragment in a cache filename.
const ID_LEN: usize = 12;

/// Derive the encode output path for a cache file by appending the fixed
/// encode suffix. `cache_ab12cd34ef56.tmp` -> `cache_ab12cd34ef56.tmp.mp4`
pub fn encode_path(cache_path: &Path) -> PathBuf {
    let mut p = cache_path.as_os_str().to_owned();
    p.push(ENCODE_SUFFIX);
    PathBuf::from(p)
}

/// Whether a filename matches the cache naming pattern, including the
/// encoder output variant. Matching files are subject to unconditional
/// deletion at startup.
pub fn is_cache_artifact(file_name: &str) -> bool {
    if !file_name.starts_with(CACHE_PREFIX) {
        return false;
    }
    file_name.ends_with(CACHE_SUFFIX)
        || file_name.ends_with(&format!("{}{}", CACHE_SUFFIX, ENCODE_SUFFIX))
}

/// Manager for the scratch directory holding cache and encode files.
#[derive(Debug, Clone)]
pub struct CacheDir {
    dir: PathBuf,
}

impl CacheDir {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// The scratch directory this manager owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete leftover cache files from prior runs.
    ///
    /// Scans the top level of the scratch directory for files matching
    /// the cache naming pattern and deletes them. Per-file failures are
    /// logged and skipped; a job from a previous abnormal termination
    /// must never block a new run.
    pub fn purge_stale(&self) {
        info!("Deleting old cache files if necessary..");

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Unable to read working directory {:?}: {}", self.dir, e);
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_cache_artifact(name) {
                continue;
            }

            debug!("Deleting old cache file {:?}", path);
            if let Err(e) = std::fs::remove_file(&path) {
                error!("Unable to delete file {:?}: {}", path, e);
            }
        }
    }

    /// Generate a cache filename that does not yet exist on disk.
    ///
    /// Combines the fixed prefix/suffix with a fresh random identifier
    /// truncated to twelve characters, retrying with a new identifier on
    /// the off chance the path is taken. This guards against identifier
    /// collision only; callers must serialize calls externally (the
    /// scheduler is the sole caller).
    pub fn new_cache_path(&self) -> PathBuf {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            let fragment = &id[id.len() - ID_LEN..];
            let path = self
                .dir
                .join(format!("{}{}{}", CACHE_PREFIX, fragment, CACHE_SUFFIX));
            if !path.exists() {
                return path;
            }
        }
    }
}
