//! Durable record of files already processed successfully.
//!
//! The history is a set of (filename, size) pairs persisted as a single
//! JSON file in the working directory. Discovery uses it to skip files
//! on repeated runs; the scheduler appends to it as jobs complete. Only
//! successes are ever recorded, which is what makes a failed job retry
//! naturally on the next invocation.

use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info};

/// Name of the history file inside the working directory.
pub const HISTORY_FILENAME: &str = ".history";

/// One successfully processed file. Identity is (filename, size); there
/// is no content hash, so an in-place rewrite at the same size is not
/// detected. That is a known limitation of the identity contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub filename: PathBuf,
    pub file_size: u64,
}

impl HistoryEntry {
    pub fn new<P: Into<PathBuf>>(filename: P, file_size: u64) -> Self {
        Self {
            filename: filename.into(),
            file_size,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    entries: Vec<HistoryEntry>,
}

/// Sibling temp file that `save` writes before the atomic rename.
fn temp_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}.tmp", HISTORY_FILENAME))
}

/// Thread-safe store over the persisted history set.
///
/// `add` and `prune` may be called while a save is in flight from the
/// reaping path, so the entry set lives behind a mutex.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: Mutex<Vec<HistoryEntry>>,
    /// Cleared permanently when the file on disk could not be read or
    /// parsed. Better to silently skip persistence than to overwrite a
    /// history we could not understand.
    will_save: AtomicBool,
}

impl HistoryStore {
    /// Load the history from `<dir>/.history`.
    ///
    /// A missing file yields an empty set. An unreadable or corrupt file
    /// yields an empty set and disables saving for the process lifetime.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(HISTORY_FILENAME);

        // A crash between writing the temp file and the rename in
        // `save` leaves it behind; the next save would overwrite it
        // anyway, so it is safe to discard here.
        let tmp = temp_path(&path);
        if tmp.exists() {
            if let Err(e) = std::fs::remove_file(&tmp) {
                error!("Unable to delete stale history temp file {:?}: {}", tmp, e);
            }
        }

        if !path.exists() {
            return Self::empty(path, true);
        }

        info!("Reading in history file..");
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) => {
                error!(
                    "Error reading in history: {}. Continuing with new history. \
                     Won't save history. Remove {} file to reset.",
                    e, HISTORY_FILENAME
                );
                return Self::empty(path, false);
            }
        };

        match serde_json::from_str::<HistoryFile>(&json) {
            Ok(file) => Self {
                path,
                entries: Mutex::new(file.entries),
                will_save: AtomicBool::new(true),
            },
            Err(e) => {
                error!(
                    "Error deserializing history: {}. Won't save. Remove {} file to reset.",
                    e, HISTORY_FILENAME
                );
                Self::empty(path, false)
            }
        }
    }

    fn empty(path: PathBuf, will_save: bool) -> Self {
        Self {
            path,
            entries: Mutex::new(Vec::new()),
            will_save: AtomicBool::new(will_save),
        }
    }

    /// Whether a (path, size) pair is recorded.
    pub fn contains(&self, filename: &Path, file_size: u64) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .any(|h| h.filename == filename && h.file_size == file_size)
    }

    /// Record a processed file.
    pub fn add(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Whether saves are enabled for this run.
    pub fn persistence_enabled(&self) -> bool {
        self.will_save.load(Ordering::Relaxed)
    }

    /// Persist the whole set, atomically replacing the history file.
    ///
    /// A save error is logged and otherwise ignored; losing history is
    /// acceptable, losing a library file is not. No-op when a corrupt
    /// load disabled persistence.
    pub fn save(&self) {
        if !self.will_save.load(Ordering::Relaxed) {
            return;
        }

        let json = {
            let entries = self.entries.lock().unwrap();
            match serde_json::to_string(&HistoryFile {
                entries: entries.clone(),
            }) {
                Ok(json) => json,
                Err(e) => {
                    error!("Error serializing history: {}", e);
                    return;
                }
            }
        };

        let tmp = temp_path(&self.path);
        if let Err(e) = std::fs::write(&tmp, &json) {
            error!("Error writing history file: {}", e);
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            error!("Error replacing history file: {}", e);
        }
    }

    /// Remove entries whose file is verifiably absent from disk.
    ///
    /// `candidates` is the full discovered file set for this run; entries
    /// matching a current candidate by path and size are live and kept.
    /// Of the rest, an entry is removed only when the stat reports
    /// `NotFound`. A file that still exists with a different size, or a
    /// stat that fails for any other reason, is ambiguous and the entry
    /// is conservatively retained. Saves immediately when anything was
    /// removed.
    pub fn prune(&self, candidates: &[Job]) -> usize {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|h| {
                let live = candidates
                    .iter()
                    .any(|j| j.input_path == h.filename && j.input_size_bytes == h.file_size);
                if live {
                    return true;
                }
                match std::fs::metadata(&h.filename) {
                    Err(e) if e.kind() == ErrorKind::NotFound => false,
                    _ => true,
                }
            });
            before - entries.len()
        };

        if removed != 0 {
            self.save();
            info!(
                "Removed {} history records for files that no longer exist",
                removed
            );
        }
        removed
    }
}
