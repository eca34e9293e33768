//! Job discovery: library scanning and exclusion.
//!
//! Enumerates the configured library roots, builds one `Waiting` job per
//! eligible file, drops files with unsupported extensions or a matching
//! history record, prunes the history, and orders the result by size.

use crate::history::HistoryStore;
use crate::job::Job;
use rebrake_config::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;

/// Input extensions eligible for re-encoding (case-insensitive matching).
pub const INPUT_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mkv", "mov", "mpg", "mpeg", "avi", "wmv", "flv", "webm",
];

/// Container extension of re-encoded output files.
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Error type for discovery. A bad library root is a configuration
/// mistake and aborts the run before any job starts.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Library root missing or not a directory
    #[error("Library path does not exist or is not a directory: {0}")]
    InvalidRoot(PathBuf),

    /// IO error while walking a library root
    #[error("Failed to scan library: {0}")]
    Io(#[from] walkdir::Error),
}

/// Whether a file has a supported input extension (case-insensitive).
pub fn is_supported_input(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_lowercase();
            INPUT_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Library destination for a re-encoded file: the input path with its
/// extension replaced by the output container extension.
pub fn output_path_for(input: &Path) -> PathBuf {
    input.with_extension(OUTPUT_EXTENSION)
}

/// Discover the job set for this run.
///
/// Walks each library root (only its top level unless recursion is
/// configured), creates one job per regular file, then applies the two
/// exclusion passes in order: unsupported extension, then history match
/// on (path, size). Prunes stale history entries against the full
/// pre-exclusion candidate set before returning, and sorts the surviving
/// jobs by input size in the configured direction.
pub fn discover_jobs(config: &Config, history: &HistoryStore) -> Result<Vec<Job>, ScanError> {
    info!("Finding files to be re-encoded..");

    let mut candidates = Vec::new();
    for root in &config.library_paths {
        if !root.is_dir() {
            return Err(ScanError::InvalidRoot(root.clone()));
        }

        let max_depth = if config.recurse { usize::MAX } else { 1 };
        for entry in WalkDir::new(root).max_depth(max_depth) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let path = entry.path().to_path_buf();
            let output = output_path_for(&path);
            candidates.push(Job::new(path, metadata.len(), output));
        }
    }

    info!(
        "Found {} files to potentially be re-encoded, totaling {} bytes",
        candidates.len(),
        candidates.iter().map(|j| j.input_size_bytes).sum::<u64>()
    );

    let mut jobs: Vec<Job> = Vec::new();
    let mut skipped_extension = 0usize;
    let mut skipped_history = 0usize;
    for job in &candidates {
        if !is_supported_input(&job.input_path) {
            skipped_extension += 1;
            continue;
        }
        if history.contains(&job.input_path, job.input_size_bytes) {
            skipped_history += 1;
            continue;
        }
        jobs.push(Job::new(
            job.input_path.clone(),
            job.input_size_bytes,
            job.output_path.clone(),
        ));
    }
    info!("Skipping {} files due to extension..", skipped_extension);
    info!("Skipping {} files due to history..", skipped_history);

    history.prune(&candidates);

    if config.ascending_order {
        jobs.sort_by_key(|j| j.input_size_bytes);
    } else {
        jobs.sort_by_key(|j| std::cmp::Reverse(j.input_size_bytes));
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryEntry;
    use crate::job::JobState;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        Config {
            library_paths: vec![root.to_path_buf()],
            working_dir: root.to_path_buf(),
            ..Config::default()
        }
    }

    fn write_file(path: &Path, len: usize) {
        fs::write(path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn test_is_supported_input() {
        assert!(is_supported_input(Path::new("/media/movie.mkv")));
        assert!(is_supported_input(Path::new("/media/movie.MKV")));
        assert!(is_supported_input(Path::new("/media/movie.WebM")));
        assert!(is_supported_input(Path::new("/media/movie.mpeg")));
        assert!(!is_supported_input(Path::new("/media/movie.srt")));
        assert!(!is_supported_input(Path::new("/media/movie.ts")));
        assert!(!is_supported_input(Path::new("/media/movie")));
    }

    #[test]
    fn test_output_path_replaces_extension() {
        assert_eq!(
            output_path_for(Path::new("/media/movies/film.mkv")),
            PathBuf::from("/media/movies/film.mp4")
        );
        assert_eq!(
            output_path_for(Path::new("/media/movies/film.2024.avi")),
            PathBuf::from("/media/movies/film.2024.mp4")
        );
    }

    #[test]
    fn test_invalid_root_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let history = HistoryStore::open(temp_dir.path());

        let mut config = config_for(temp_dir.path());
        config.library_paths = vec![PathBuf::from("/nonexistent/library")];

        let result = discover_jobs(&config, &history);
        assert!(matches!(result, Err(ScanError::InvalidRoot(_))));
    }

    #[test]
    fn test_discovery_builds_waiting_jobs_with_mp4_output() {
        let temp_dir = TempDir::new().unwrap();
        let history = HistoryStore::open(temp_dir.path());
        write_file(&temp_dir.path().join("film.mkv"), 100);

        let jobs = discover_jobs(&config_for(temp_dir.path()), &history).unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Waiting);
        assert_eq!(jobs[0].input_size_bytes, 100);
        assert_eq!(jobs[0].output_path, temp_dir.path().join("film.mp4"));
    }

    #[test]
    fn test_discovery_excludes_unsupported_extensions() {
        let temp_dir = TempDir::new().unwrap();
        let history = HistoryStore::open(temp_dir.path());
        write_file(&temp_dir.path().join("film.mkv"), 100);
        write_file(&temp_dir.path().join("subtitles.srt"), 10);
        write_file(&temp_dir.path().join("notes.txt"), 10);

        let jobs = discover_jobs(&config_for(temp_dir.path()), &history).unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].input_path, temp_dir.path().join("film.mkv"));
    }

    #[test]
    fn test_discovery_excludes_history_matches_by_path_and_size() {
        let temp_dir = TempDir::new().unwrap();
        let seen = temp_dir.path().join("seen.mkv");
        let changed = temp_dir.path().join("changed.mkv");
        write_file(&seen, 100);
        write_file(&changed, 200);

        let history = HistoryStore::open(temp_dir.path());
        history.add(HistoryEntry::new(&seen, 100));
        // Recorded at a different size, so it is a candidate again.
        history.add(HistoryEntry::new(&changed, 150));

        let jobs = discover_jobs(&config_for(temp_dir.path()), &history).unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].input_path, changed);
    }

    #[test]
    fn test_history_exclusion_is_size_based_not_content_based() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("film.mkv");
        write_file(&file, 100);

        let history = HistoryStore::open(temp_dir.path());
        history.add(HistoryEntry::new(&file, 100));

        // Rewrite the content without changing the size.
        fs::write(&file, vec![1u8; 100]).unwrap();

        let jobs = discover_jobs(&config_for(temp_dir.path()), &history).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_non_recursive_scan_ignores_subdirectories() {
        let temp_dir = TempDir::new().unwrap();
        let history = HistoryStore::open(temp_dir.path());
        write_file(&temp_dir.path().join("top.mkv"), 100);
        let sub = temp_dir.path().join("season1");
        fs::create_dir(&sub).unwrap();
        write_file(&sub.join("nested.mkv"), 100);

        let mut config = config_for(temp_dir.path());
        config.recurse = false;
        let jobs = discover_jobs(&config, &history).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].input_path, temp_dir.path().join("top.mkv"));

        config.recurse = true;
        let jobs = discover_jobs(&config, &history).unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn test_ordering_ascending_and_descending() {
        let temp_dir = TempDir::new().unwrap();
        let history = HistoryStore::open(temp_dir.path());
        write_file(&temp_dir.path().join("mid.mkv"), 200);
        write_file(&temp_dir.path().join("small.mkv"), 50);
        write_file(&temp_dir.path().join("big.mkv"), 400);

        let mut config = config_for(temp_dir.path());
        config.ascending_order = true;
        let jobs = discover_jobs(&config, &history).unwrap();
        let sizes: Vec<u64> = jobs.iter().map(|j| j.input_size_bytes).collect();
        assert_eq!(sizes, vec![50, 200, 400]);

        config.ascending_order = false;
        let jobs = discover_jobs(&config, &history).unwrap();
        let sizes: Vec<u64> = jobs.iter().map(|j| j.input_size_bytes).collect();
        assert_eq!(sizes, vec![400, 200, 50]);
    }

    #[test]
    fn test_discovery_idempotent_against_unchanged_library() {
        let temp_dir = TempDir::new().unwrap();
        let seen = temp_dir.path().join("seen.mkv");
        let fresh = temp_dir.path().join("fresh.mkv");
        write_file(&seen, 100);
        write_file(&fresh, 200);

        let history = HistoryStore::open(temp_dir.path());
        history.add(HistoryEntry::new(&seen, 100));

        let config = config_for(temp_dir.path());
        let first: Vec<PathBuf> = discover_jobs(&config, &history)
            .unwrap()
            .into_iter()
            .map(|j| j.input_path)
            .collect();
        let second: Vec<PathBuf> = discover_jobs(&config, &history)
            .unwrap()
            .into_iter()
            .map(|j| j.input_path)
            .collect();

        assert_eq!(first, vec![fresh.clone()]);
        assert_eq!(first, second);
    }

    // *For any* mix of supported and unsupported extensions, discovery
    // SHALL construct jobs exactly for the supported ones.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,16}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("mp4"), Just("Mp4"),
                Just("m4v"), Just("mov"), Just("mpg"), Just("mpeg"),
                Just("avi"), Just("wmv"), Just("flv"), Just("webm"),
                Just("txt"), Just("srt"), Just("jpg"), Just("nfo"),
                Just("ts"), Just("iso"),
            ],
        ) {
            let temp_dir = TempDir::new().unwrap();
            let history = HistoryStore::open(temp_dir.path());
            let path = temp_dir.path().join(format!("{}.{}", basename, ext));
            write_file(&path, 10);

            let jobs = discover_jobs(&config_for(temp_dir.path()), &history).unwrap();

            let expected = INPUT_EXTENSIONS.contains(&ext.to_lowercase().as_str());
            prop_assert_eq!(jobs.len(), usize::from(expected));
        }
    }
}
