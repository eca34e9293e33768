//! Encoder supervisor: subprocess lifecycle and library delivery.
//!
//! Launches HandBrakeCLI against a job's cached copy, streams its
//! combined output through the progress filter, maps the exit code to
//! success or failure, and on success delivers the encode output back
//! into the library under a collision-avoided name.

use crate::cache;
use crate::encode::progress::ProgressFilter;
use crate::job::{JobState, SharedJob};
use chrono::Local;
use rebrake_config::{Config, EncoderConfig};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Find a library path that is not yet occupied by appending `_` before
/// the extension until the name is free.
/// `/media/film.mp4` -> `/media/film_.mp4` -> `/media/film__.mp4` ...
pub fn next_free_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while candidate.exists() {
        let stem = candidate
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match candidate.extension() {
            Some(ext) => format!("{}_.{}", stem, ext.to_string_lossy()),
            None => format!("{}_", stem),
        };
        candidate.set_file_name(name);
    }
    candidate
}

/// Supervises the external encoder subprocess for one scheduler run.
///
/// Owns the progress filter state; with the system-wide limit of one
/// concurrent encode, all filtered lines belong to the one subprocess
/// that may be running.
pub struct EncoderSupervisor {
    encoder: EncoderConfig,
    overwrite_original: bool,
    delete_original: bool,
    filter: Arc<Mutex<ProgressFilter>>,
}

impl EncoderSupervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            encoder: config.encoder.clone(),
            overwrite_original: config.overwrite_original,
            delete_original: config.delete_original,
            filter: Arc::new(Mutex::new(ProgressFilter::new())),
        }
    }

    /// Build the encoder invocation for one job.
    ///
    /// The argument grammar is fixed apart from the input path, output
    /// path, and the four quality knobs from configuration.
    pub fn build_command(&self, cache_path: &Path, encode_path: &Path) -> Command {
        let mut cmd = Command::new(&self.encoder.encoder_path);

        cmd.arg("-i").arg(cache_path);
        cmd.arg("-o").arg(encode_path);

        // Container and filters
        cmd.arg("-f").arg("mp4");
        cmd.arg("-O");
        cmd.arg("--decomb");
        cmd.arg("--modulus").arg("16");

        // Video
        cmd.arg("-e").arg("x264");
        cmd.arg("-q").arg("32");
        cmd.arg("--vfr");

        // Audio and subtitles
        cmd.arg("-E").arg("ac3");
        cmd.arg("-6").arg("ac3");
        cmd.arg("-R").arg("Auto");
        cmd.arg("-B").arg("48");
        cmd.arg("-D").arg("1");
        cmd.arg("--all-audio");
        cmd.arg("--all-subtitles");
        cmd.arg("--gain").arg("0");
        cmd.arg("--audio-fallback").arg("ffac3");

        // Quality knobs
        cmd.arg(format!("--x264-preset={}", self.encoder.x264_preset));
        cmd.arg(format!("--x264-profile={}", self.encoder.x264_profile));
        cmd.arg(format!("--x264-tune={}", self.encoder.x264_tune));
        cmd.arg(format!("--h264-level={}", self.encoder.h264_level));

        cmd
    }

    /// Run the encoder for a job already in the `Encoding` state.
    ///
    /// Blocks (asynchronously) until the subprocess exits or the
    /// cancellation token fires, in which case the subprocess is killed
    /// and the job is canceled. On exit code 0 the encode output is
    /// delivered to the library and the job completes; any other outcome
    /// cancels the job. All failures are contained here; nothing
    /// propagates past the job.
    pub async fn encode(self: Arc<Self>, job: SharedJob, cancel: CancellationToken) {
        let (input_path, input_size, cache_path, encode_path, output_path) = {
            let mut job = job.lock().unwrap();
            let Some(cache_path) = job.cache_path.clone() else {
                error!("Job for '{:?}' has no cache file", job.input_path);
                job.state = JobState::Canceled;
                return;
            };
            let encode_path = cache::encode_path(&cache_path);
            (
                job.input_path.clone(),
                job.input_size_bytes,
                cache_path,
                encode_path,
                job.output_path.clone(),
            )
        };

        let mut cmd = self.build_command(&cache_path, &encode_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        info!(
            "Running {:?} with arguments: {:?}",
            self.encoder.encoder_path,
            cmd.as_std().get_args().collect::<Vec<_>>()
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Error running {:?}: {}", self.encoder.encoder_path, e);
                set_state(&job, JobState::Canceled);
                return;
            }
        };

        {
            let mut job = job.lock().unwrap();
            job.encode_start = Some(Local::now());
        }
        info!(
            "Beginning encoding for '{:?}'.. Output to follow:",
            input_path.file_name().unwrap_or_default()
        );

        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_reader(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_output_reader(stderr);
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                info!("Killing {:?} due to cancellation", self.encoder.encoder_path);
                match child.kill().await {
                    Ok(()) => info!("Killed"),
                    Err(e) => error!("Error killing process: {}", e),
                }
                set_state(&job, JobState::Canceled);
                return;
            }
        };

        {
            let mut job = job.lock().unwrap();
            job.encode_end = Some(Local::now());
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                error!("Error waiting for {:?}: {}", self.encoder.encoder_path, e);
                set_state(&job, JobState::Canceled);
                return;
            }
        };
        if !status.success() {
            error!(
                "{:?} returned non-zero exit code - {:?}..",
                self.encoder.encoder_path,
                status.code()
            );
            set_state(&job, JobState::Canceled);
            return;
        }

        set_state(&job, JobState::CopyingBackToLibrary);

        let final_path = match self.deliver(&encode_path, &output_path, &input_path).await {
            Ok(path) => path,
            Err(e) => {
                error!("Error delivering '{:?}' to library: {}", encode_path, e);
                set_state(&job, JobState::Canceled);
                return;
            }
        };

        let output_size = match tokio::fs::metadata(&final_path).await {
            Ok(m) => m.len(),
            Err(e) => {
                error!("Error reading delivered file '{:?}': {}", final_path, e);
                set_state(&job, JobState::Canceled);
                return;
            }
        };

        let (start, end) = {
            let mut job = job.lock().unwrap();
            job.output_path = final_path.clone();
            job.output_size_bytes = output_size;
            job.state = JobState::Completed;
            (job.encode_start, job.encode_end)
        };

        let saved = input_size as i64 - output_size as i64;
        let percent = if input_size > 0 {
            100.0 * (1.0 - output_size as f64 / input_size as f64)
        } else {
            0.0
        };
        let took = match (start, end) {
            (Some(start), Some(end)) => format!("{}", end - start),
            _ => "unknown".to_string(),
        };
        info!(
            "Stats for '{:?}': in {} bytes, out {} bytes, saved {} bytes ({:.2}%), took {}",
            input_path.file_name().unwrap_or_default(),
            input_size,
            output_size,
            saved,
            percent,
            took
        );
    }

    /// Copy the encode output into the library.
    ///
    /// The copy first lands under a collision-avoided name. If the
    /// canonical output name is occupied and overwrite/delete is
    /// configured, the original input is deleted to free it; otherwise
    /// the suffixed copy stays and becomes the final output path. When
    /// the canonical name ends up free the copy is renamed onto it.
    async fn deliver(
        &self,
        encode_path: &Path,
        output_path: &Path,
        input_path: &Path,
    ) -> std::io::Result<PathBuf> {
        let tmp = next_free_path(output_path);
        tokio::fs::copy(encode_path, &tmp).await?;

        let mut final_path = output_path.to_path_buf();
        if output_path.exists() {
            if self.overwrite_original || self.delete_original {
                info!("Deleting original file '{:?}'", input_path);
                match tokio::fs::remove_file(input_path).await {
                    Ok(()) => {
                        if tmp != *output_path && output_path.exists() {
                            info!(
                                "Output file already exists, leaving new copy with suffix - '{:?}'",
                                tmp
                            );
                            final_path = tmp.clone();
                        }
                    }
                    Err(e) => {
                        error!(
                            "Error deleting original file '{:?}', leaving new copy with suffix - '{:?}': {}",
                            input_path, tmp, e
                        );
                        final_path = tmp.clone();
                    }
                }
            } else if tmp != *output_path {
                info!(
                    "Output file already exists, leaving new copy with suffix - '{:?}'",
                    tmp
                );
                final_path = tmp.clone();
            }
        }

        if !final_path.exists() {
            info!("Renaming temp file to real filename '{:?}'", final_path);
            tokio::fs::rename(&tmp, &final_path).await?;
        }

        Ok(final_path)
    }

    fn spawn_output_reader<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let filter = self.filter.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let emit = filter.lock().unwrap().should_emit(&line);
                if emit {
                    info!("OUT --> {}", line);
                }
            }
        });
    }
}

fn set_state(job: &SharedJob, state: JobState) {
    let mut job = job.lock().unwrap();
    job.state = state;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebrake_config::Config;
    use std::ffi::OsStr;
    use std::fs::File;
    use tempfile::TempDir;

    fn supervisor_for(config: &Config) -> EncoderSupervisor {
        EncoderSupervisor::new(config)
    }

    fn command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_build_command_fixed_grammar() {
        let config = Config {
            library_paths: vec![PathBuf::from("/media")],
            ..Config::default()
        };
        let supervisor = supervisor_for(&config);
        let cmd = supervisor.build_command(
            Path::new("/scratch/cache_0123456789ab.tmp"),
            Path::new("/scratch/cache_0123456789ab.tmp.mp4"),
        );

        assert_eq!(cmd.as_std().get_program(), OsStr::new("HandBrakeCLI"));

        let args = command_args(&cmd);
        assert!(has_flag_with_value(
            &args,
            "-i",
            "/scratch/cache_0123456789ab.tmp"
        ));
        assert!(has_flag_with_value(
            &args,
            "-o",
            "/scratch/cache_0123456789ab.tmp.mp4"
        ));
        assert!(has_flag_with_value(&args, "-f", "mp4"));
        assert!(has_flag_with_value(&args, "-e", "x264"));
        assert!(has_flag_with_value(&args, "-q", "32"));
        assert!(has_flag_with_value(&args, "-E", "ac3"));
        assert!(has_flag_with_value(&args, "--audio-fallback", "ffac3"));
        assert!(args.iter().any(|a| a == "--decomb"));
        assert!(args.iter().any(|a| a == "--vfr"));
        assert!(args.iter().any(|a| a == "--all-audio"));
        assert!(args.iter().any(|a| a == "--all-subtitles"));
    }

    #[test]
    fn test_build_command_applies_quality_knobs() {
        let mut config = Config {
            library_paths: vec![PathBuf::from("/media")],
            ..Config::default()
        };
        config.encoder.x264_preset = "fast".to_string();
        config.encoder.x264_profile = "main".to_string();
        config.encoder.x264_tune = "film".to_string();
        config.encoder.h264_level = "5.1".to_string();

        let supervisor = supervisor_for(&config);
        let cmd = supervisor.build_command(Path::new("in.tmp"), Path::new("in.tmp.mp4"));
        let args = command_args(&cmd);

        assert!(args.iter().any(|a| a == "--x264-preset=fast"));
        assert!(args.iter().any(|a| a == "--x264-profile=main"));
        assert!(args.iter().any(|a| a == "--x264-tune=film"));
        assert!(args.iter().any(|a| a == "--h264-level=5.1"));
    }

    #[test]
    fn test_next_free_path_returns_input_when_unoccupied() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("film.mp4");
        assert_eq!(next_free_path(&target), target);
    }

    #[test]
    fn test_next_free_path_appends_suffix_until_free() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("film.mp4");
        File::create(&target).unwrap();
        File::create(temp_dir.path().join("film_.mp4")).unwrap();

        assert_eq!(next_free_path(&target), temp_dir.path().join("film__.mp4"));
    }

    #[test]
    fn test_next_free_path_keeps_inner_dots() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("film.2024.mp4");
        File::create(&target).unwrap();

        assert_eq!(
            next_free_path(&target),
            temp_dir.path().join("film.2024_.mp4")
        );
    }

    #[tokio::test]
    async fn test_deliver_renames_onto_free_canonical_name() {
        let temp_dir = TempDir::new().unwrap();
        let encode = temp_dir.path().join("cache_0123456789ab.tmp.mp4");
        std::fs::write(&encode, b"encoded").unwrap();
        let input = temp_dir.path().join("film.mkv");
        std::fs::write(&input, b"original").unwrap();
        let output = temp_dir.path().join("film.mp4");

        let config = Config {
            library_paths: vec![temp_dir.path().to_path_buf()],
            ..Config::default()
        };
        let supervisor = supervisor_for(&config);

        let final_path = supervisor.deliver(&encode, &output, &input).await.unwrap();

        assert_eq!(final_path, output);
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded");
        // Without the delete flag, the original stays.
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_deliver_collision_without_overwrite_keeps_suffixed_copy() {
        let temp_dir = TempDir::new().unwrap();
        let encode = temp_dir.path().join("cache_0123456789ab.tmp.mp4");
        std::fs::write(&encode, b"encoded").unwrap();
        // Input already carries the output container name.
        let input = temp_dir.path().join("film.mp4");
        std::fs::write(&input, b"original").unwrap();
        let output = temp_dir.path().join("film.mp4");

        let config = Config {
            library_paths: vec![temp_dir.path().to_path_buf()],
            ..Config::default()
        };
        let supervisor = supervisor_for(&config);

        let final_path = supervisor.deliver(&encode, &output, &input).await.unwrap();

        assert_eq!(final_path, temp_dir.path().join("film_.mp4"));
        assert_eq!(std::fs::read(&final_path).unwrap(), b"encoded");
        // The occupied name keeps its original content.
        assert_eq!(std::fs::read(&output).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_deliver_collision_with_overwrite_replaces_original() {
        let temp_dir = TempDir::new().unwrap();
        let encode = temp_dir.path().join("cache_0123456789ab.tmp.mp4");
        std::fs::write(&encode, b"encoded").unwrap();
        let input = temp_dir.path().join("film.mp4");
        std::fs::write(&input, b"original").unwrap();
        let output = temp_dir.path().join("film.mp4");

        let config = Config {
            library_paths: vec![temp_dir.path().to_path_buf()],
            overwrite_original: true,
            ..Config::default()
        };
        let supervisor = supervisor_for(&config);

        let final_path = supervisor.deliver(&encode, &output, &input).await.unwrap();

        assert_eq!(final_path, output);
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded");
        assert!(!temp_dir.path().join("film_.mp4").exists());
    }

    #[tokio::test]
    async fn test_deliver_missing_encode_output_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let encode = temp_dir.path().join("cache_0123456789ab.tmp.mp4");
        let input = temp_dir.path().join("film.mkv");
        let output = temp_dir.path().join("film.mp4");

        let config = Config {
            library_paths: vec![temp_dir.path().to_path_buf()],
            ..Config::default()
        };
        let supervisor = supervisor_for(&config);

        let result = supervisor.deliver(&encode, &output, &input).await;
        assert!(result.is_err());
    }
}
