//! Job scheduler: the polling control loop.
//!
//! Each tick admits waiting jobs into the cache-copy phase under the
//! disk budget and copy ceiling, keeps exactly one encode running when
//! work is available, and reaps terminal jobs (history recording and
//! scratch cleanup). Background work is observed only through each
//! job's state field on a later tick; the loop never blocks on a task.

use crate::cache::CacheDir;
use crate::encode::EncoderSupervisor;
use crate::history::{HistoryEntry, HistoryStore};
use crate::job::{shared, Job, JobState, SharedJob};
use rebrake_config::Config;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Sleep between scheduler ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Admission check for the copy-to-cache phase.
///
/// A new copy may start only while the scratch disk estimate is under
/// budget and the number of in-flight copies is under the ceiling.
/// A budget of zero means unlimited.
pub fn copy_admission_allowed(
    cache_in_use: u64,
    cache_budget: u64,
    copying: usize,
    copy_ceiling: usize,
) -> bool {
    (cache_budget == 0 || cache_in_use < cache_budget) && copying < copy_ceiling
}

/// One live job plus the handle of the background task working on it,
/// if any. The scheduler owns the handle; the task only holds the
/// shared job state.
struct ActiveJob {
    job: SharedJob,
    task: Option<JoinHandle<()>>,
}

impl ActiveJob {
    fn state(&self) -> JobState {
        self.job.lock().unwrap().state
    }

    fn input_size(&self) -> u64 {
        self.job.lock().unwrap().input_size_bytes
    }
}

/// The polling control loop driving all jobs of one run.
pub struct Scheduler {
    config: Config,
    cache: CacheDir,
    history: Arc<HistoryStore>,
    supervisor: Arc<EncoderSupervisor>,
    cancel: CancellationToken,
    tick: Duration,
}

impl Scheduler {
    pub fn new(config: Config, history: Arc<HistoryStore>, cancel: CancellationToken) -> Self {
        let cache = CacheDir::new(config.working_dir.clone());
        let supervisor = Arc::new(EncoderSupervisor::new(&config));
        Self {
            config,
            cache,
            history,
            supervisor,
            cancel,
            tick: TICK_INTERVAL,
        }
    }

    /// Override the tick interval. Used by tests to speed up runs.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Drive the job set to completion.
    ///
    /// Returns once every job has been reaped or cancellation was
    /// observed. On cancellation all in-flight tasks are aborted, which
    /// kills the running encoder subprocess; leftover cache files are
    /// cleaned up by the next run's startup purge.
    pub async fn run(&self, jobs: Vec<Job>) {
        let mut active: Vec<ActiveJob> = jobs
            .into_iter()
            .map(|job| ActiveJob {
                job: shared(job),
                task: None,
            })
            .collect();

        loop {
            if active.is_empty() {
                break;
            }
            if self.cancel.is_cancelled() {
                info!("Quitting..");
                // Abort in-flight work rather than draining it. The
                // encoder child has kill_on_drop set, so aborting its
                // task still terminates the subprocess.
                for entry in &mut active {
                    if let Some(task) = entry.task.take() {
                        task.abort();
                    }
                }
                break;
            }

            self.admit_copies(&mut active);
            self.admit_encode(&mut active);
            self.reap(&mut active);

            tokio::time::sleep(self.tick).await;
        }

        info!("Done!");
    }

    /// Admit waiting jobs into the copy phase while the budget and
    /// ceiling allow. Admitted jobs are re-counted before the next
    /// admission, so a single tick can fill every free slot without
    /// overshooting either limit.
    fn admit_copies(&self, active: &mut [ActiveJob]) {
        loop {
            let cache_in_use: u64 = active
                .iter()
                .filter(|e| e.state().holds_cache())
                .map(|e| e.input_size())
                .sum();
            let copying = active
                .iter()
                .filter(|e| e.state() == JobState::CopyingToCache)
                .count();
            if !copy_admission_allowed(
                cache_in_use,
                self.config.cache_budget_bytes,
                copying,
                self.config.max_copy_tasks,
            ) {
                return;
            }

            let Some(entry) = active.iter_mut().find(|e| e.state() == JobState::Waiting) else {
                return;
            };

            let cache_path = self.cache.new_cache_path();
            {
                let mut job = entry.job.lock().unwrap();
                job.cache_path = Some(cache_path.clone());
                job.state = JobState::CopyingToCache;
                info!(
                    "Beginning copy of '{:?}', from '{:?}' to '{:?}'",
                    job.input_path.file_name().unwrap_or_default(),
                    job.input_path.parent().unwrap_or_else(|| Path::new("")),
                    cache_path
                );
            }

            let job = entry.job.clone();
            entry.task = Some(tokio::spawn(async move {
                let input_path = job.lock().unwrap().input_path.clone();
                match tokio::fs::copy(&input_path, &cache_path).await {
                    Ok(_) => {
                        job.lock().unwrap().state = JobState::InCache;
                    }
                    Err(e) => {
                        error!("Failed to copy file '{:?}': {}", input_path, e);
                        job.lock().unwrap().state = JobState::Canceled;
                    }
                }
            }));
        }
    }

    /// Make sure something is encoding, if anything can. At most one
    /// job may be `Encoding` system-wide, independent of configuration.
    fn admit_encode(&self, active: &mut [ActiveJob]) {
        if active.iter().any(|e| e.state() == JobState::Encoding) {
            return;
        }
        let Some(entry) = active.iter_mut().find(|e| e.state() == JobState::InCache) else {
            return;
        };

        entry.job.lock().unwrap().state = JobState::Encoding;
        let task = tokio::spawn(
            self.supervisor
                .clone()
                .encode(entry.job.clone(), self.cancel.clone()),
        );
        entry.task = Some(task);
    }

    /// Remove terminal jobs from the active set.
    ///
    /// Completed jobs record two history entries (input and output) and
    /// trigger a save before their scratch files are deleted. Canceled
    /// jobs get the same file cleanup but no history, so the next run
    /// rediscovers and retries them.
    fn reap(&self, active: &mut Vec<ActiveJob>) {
        active.retain(|entry| {
            let (state, input_path, input_size, output_path, output_size, cache_path, encode_path) = {
                let job = entry.job.lock().unwrap();
                (
                    job.state,
                    job.input_path.clone(),
                    job.input_size_bytes,
                    job.output_path.clone(),
                    job.output_size_bytes,
                    job.cache_path.clone(),
                    job.encode_path(),
                )
            };

            match state {
                JobState::Completed => {
                    self.history.add(HistoryEntry::new(input_path, input_size));
                    self.history.add(HistoryEntry::new(output_path, output_size));
                    self.history.save();
                    remove_artifact(cache_path.as_deref(), "cache");
                    remove_artifact(encode_path.as_deref(), "encode");
                    false
                }
                JobState::Canceled => {
                    remove_artifact(cache_path.as_deref(), "cache");
                    remove_artifact(encode_path.as_deref(), "encode");
                    false
                }
                _ => true,
            }
        });
    }
}

/// Best-effort deletion of a finished job's scratch file.
fn remove_artifact(path: Option<&Path>, what: &str) {
    let Some(path) = path else {
        return;
    };
    if !path.exists() {
        return;
    }
    info!("Removing old {} file '{:?}'", what, path);
    if let Err(e) = std::fs::remove_file(path) {
        error!("Unable to delete old {} file '{:?}': {}", what, path, e);
    }
}
