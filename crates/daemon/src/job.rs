//! Job model for the re-encoding pipeline.
//!
//! A job represents one library file moving through the
//! cache -> encode -> delivery stages. Jobs are created by discovery in
//! the `Waiting` state and advanced by the scheduler and the background
//! task it launches for them.

use crate::cache;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// State of a job in the pipeline.
///
/// `Completed` and `Canceled` are terminal. Any non-terminal state may
/// transition to `Canceled` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting to be admitted into the local cache.
    Waiting,
    /// Input file is being copied into the scratch directory.
    CopyingToCache,
    /// Cached copy is ready to be encoded.
    InCache,
    /// Encoder subprocess is running.
    Encoding,
    /// Encode output is being delivered back into the library.
    CopyingBackToLibrary,
    /// Job finished successfully.
    Completed,
    /// Job failed or was abandoned.
    Canceled,
}

impl JobState {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Canceled)
    }

    /// Whether the job currently occupies scratch disk.
    ///
    /// This counts the job's full input size from the moment the copy is
    /// admitted, so the total is a conservative upper bound on bytes
    /// actually written to the cache, not an exact measurement.
    pub fn holds_cache(self) -> bool {
        matches!(
            self,
            JobState::CopyingToCache
                | JobState::InCache
                | JobState::Encoding
                | JobState::CopyingBackToLibrary
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::CopyingToCache => "copying_to_cache",
            JobState::InCache => "in_cache",
            JobState::Encoding => "encoding",
            JobState::CopyingBackToLibrary => "copying_back_to_library",
            JobState::Completed => "completed",
            JobState::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// One file under consideration for re-encoding.
#[derive(Debug)]
pub struct Job {
    /// Current state in the pipeline.
    pub state: JobState,
    /// Path to the source file in the library.
    pub input_path: PathBuf,
    /// Size of the source file at discovery time.
    pub input_size_bytes: u64,
    /// Library destination for the re-encoded file. Discovery computes it
    /// by replacing the extension; delivery may adjust it on collision.
    pub output_path: PathBuf,
    /// Scratch copy location. Assigned exactly once, when the job is
    /// admitted into the copy phase, and stable afterwards.
    pub cache_path: Option<PathBuf>,
    /// Size of the delivered output. Meaningful only in `Completed`.
    pub output_size_bytes: u64,
    /// When the encoder subprocess was started.
    pub encode_start: Option<DateTime<Local>>,
    /// When the encoder subprocess exited.
    pub encode_end: Option<DateTime<Local>>,
}

impl Job {
    /// Create a job in the `Waiting` state.
    pub fn new(input_path: PathBuf, input_size_bytes: u64, output_path: PathBuf) -> Self {
        Self {
            state: JobState::Waiting,
            input_path,
            input_size_bytes,
            output_path,
            cache_path: None,
            output_size_bytes: 0,
            encode_start: None,
            encode_end: None,
        }
    }

    /// Encode output path, derived from the cache path. Never generated
    /// independently.
    pub fn encode_path(&self) -> Option<PathBuf> {
        self.cache_path.as_deref().map(cache::encode_path)
    }
}

/// A job shared between the scheduler and the one background task that
/// is currently working on it. The scheduler owns the task handle; the
/// task holds only this state handle, so there is no reference cycle.
pub type SharedJob = Arc<Mutex<Job>>;

/// Wrap a job for sharing with a background task.
pub fn shared(job: Job) -> SharedJob {
    Arc::new(Mutex::new(job))
}
