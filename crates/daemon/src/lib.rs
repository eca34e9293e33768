//! Batch re-encoding pipeline.
//!
//! Discovers video files under configured library roots, stages each one
//! through a scratch cache, runs a single HandBrakeCLI encode at a time,
//! and delivers the result back into the library. Completed files are
//! recorded in a history file so repeated runs skip them.

pub mod cache;
pub mod encode;
pub mod history;
pub mod job;
pub mod scan;
pub mod scheduler;

pub use cache::CacheDir;
pub use encode::EncoderSupervisor;
pub use history::{HistoryEntry, HistoryStore};
pub use job::{Job, JobState, SharedJob};
pub use scan::{discover_jobs, ScanError};
pub use scheduler::Scheduler;
