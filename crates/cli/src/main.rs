//! CLI entry point for the rebrake batch re-encoder.
//!
//! Builds the run configuration from an optional TOML file plus command
//! line overrides, sets up logging, and drives one full pipeline run.

use clap::Parser;
use rebrake::{discover_jobs, CacheDir, HistoryStore, Scheduler};
use rebrake_config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// rebrake - batch re-encode a video library with HandBrakeCLI
#[derive(Parser, Debug)]
#[command(name = "rebrake")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Command line flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Library roots to search for files. At least one is required.
    #[arg(short, long = "library")]
    library: Vec<PathBuf>,

    /// Recurse through subdirectories of each library root
    #[arg(short, long)]
    recurse: bool,

    /// Working directory for cache files and temporary encode output
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Upper bound in bytes on scratch disk held by in-flight jobs. 0 = unlimited.
    #[arg(long)]
    cache_budget_bytes: Option<u64>,

    /// Maximum copy-to-cache tasks to run in parallel
    #[arg(long)]
    max_copy_tasks: Option<usize>,

    /// Encode smaller files first
    #[arg(short, long)]
    ascending: bool,

    /// Overwrite the original file if necessary
    #[arg(long)]
    overwrite_original: bool,

    /// Delete the original file after a successful encode
    #[arg(long)]
    delete_original: bool,

    /// Log file path. If omitted, logs go to the console only.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// x264 preset
    #[arg(long)]
    x264_preset: Option<String>,

    /// x264 profile
    #[arg(long)]
    x264_profile: Option<String>,

    /// x264 tune
    #[arg(long)]
    x264_tune: Option<String>,

    /// h264 level
    #[arg(long)]
    h264_level: Option<String>,
}

impl Args {
    /// Resolve the effective configuration: file values first, then any
    /// flag that was given on the command line on top.
    fn into_config(self) -> Result<Config, rebrake_config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };

        if !self.library.is_empty() {
            config.library_paths = self.library;
        }
        if self.recurse {
            config.recurse = true;
        }
        if let Some(dir) = self.working_dir {
            config.working_dir = dir;
        }
        if let Some(budget) = self.cache_budget_bytes {
            config.cache_budget_bytes = budget;
        }
        if let Some(max) = self.max_copy_tasks {
            config.max_copy_tasks = max;
        }
        if self.ascending {
            config.ascending_order = true;
        }
        if self.overwrite_original {
            config.overwrite_original = true;
        }
        if self.delete_original {
            config.delete_original = true;
        }
        if let Some(path) = self.log_file {
            config.log_file = Some(path);
        }
        if let Some(preset) = self.x264_preset {
            config.encoder.x264_preset = preset;
        }
        if let Some(profile) = self.x264_profile {
            config.encoder.x264_profile = profile;
        }
        if let Some(tune) = self.x264_tune {
            config.encoder.x264_tune = tune;
        }
        if let Some(level) = self.h264_level {
            config.encoder.h264_level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Console logging, plus a non-blocking file layer when configured.
/// The returned guard must stay alive for the run so buffered lines
/// reach the file.
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| "rebrake.log".as_ref());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Cancellation requested..");
                cancel.cancel();
            }
        });
    }

    // Clear out cache and encode files left behind by an interrupted run.
    let cache = CacheDir::new(config.working_dir.clone());
    cache.purge_stale();

    let history = Arc::new(HistoryStore::open(&config.working_dir));

    let jobs = match discover_jobs(&config, &history) {
        Ok(jobs) => jobs,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    Scheduler::new(config, history, cancel).run(jobs).await;

    ExitCode::SUCCESS
}
