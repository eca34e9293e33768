//! Core configuration structures, loading, and validation

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Known x264 preset names, slowest last.
pub const X264_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

/// Known x264 profile names.
pub const X264_PROFILES: &[&str] = &["auto", "baseline", "main", "high"];

/// Known x264 tune names.
pub const X264_TUNES: &[&str] = &[
    "film",
    "animation",
    "grain",
    "stillimage",
    "fastdecode",
    "zerolatency",
    "psnr",
    "ssim",
];

/// Known h264 level names.
pub const H264_LEVELS: &[&str] = &[
    "1.0", "1b", "1.1", "1.2", "1.3", "2.0", "2.1", "2.2", "3.0", "3.1", "3.2", "4.0", "4.1",
    "4.2", "5.0", "5.1", "5.2", "6.0", "6.1", "6.2",
];

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// No library paths configured
    #[error("At least one library path is required")]
    NoLibraryPaths,

    /// An encoder quality knob holds an unknown value
    #[error("Unknown {knob} value '{value}'")]
    UnknownKnobValue { knob: &'static str, value: String },
}

/// Encoder quality knobs passed through to HandBrakeCLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable to invoke
    #[serde(default = "default_encoder_path")]
    pub encoder_path: PathBuf,
    /// x264 preset
    #[serde(default = "default_x264_preset")]
    pub x264_preset: String,
    /// x264 profile
    #[serde(default = "default_x264_profile")]
    pub x264_profile: String,
    /// x264 tune
    #[serde(default = "default_x264_tune")]
    pub x264_tune: String,
    /// h264 level
    #[serde(default = "default_h264_level")]
    pub h264_level: String,
}

fn default_encoder_path() -> PathBuf {
    PathBuf::from("HandBrakeCLI")
}

fn default_x264_preset() -> String {
    "veryslow".to_string()
}

fn default_x264_profile() -> String {
    "high".to_string()
}

fn default_x264_tune() -> String {
    "animation".to_string()
}

fn default_h264_level() -> String {
    "4.1".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            encoder_path: default_encoder_path(),
            x264_preset: default_x264_preset(),
            x264_profile: default_x264_profile(),
            x264_tune: default_x264_tune(),
            h264_level: default_h264_level(),
        }
    }
}

/// Main configuration structure for one re-encoding run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Library roots to search for files
    #[serde(default)]
    pub library_paths: Vec<PathBuf>,
    /// Recurse through subdirectories, or only process each root
    #[serde(default)]
    pub recurse: bool,
    /// Working directory for cache files and temporary encode output
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Upper bound on scratch disk consumed by in-flight jobs. 0 = unlimited.
    #[serde(default)]
    pub cache_budget_bytes: u64,
    /// Maximum copy-to-cache tasks to run in parallel
    #[serde(default = "default_max_copy_tasks")]
    pub max_copy_tasks: usize,
    /// Encode smaller files first
    #[serde(default)]
    pub ascending_order: bool,
    /// Overwrite the original file if necessary
    #[serde(default)]
    pub overwrite_original: bool,
    /// Delete original file. Relevant if the file extension changes
    #[serde(default)]
    pub delete_original: bool,
    /// Log file path. If omitted, no logs are saved to disk
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_copy_tasks() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_paths: Vec::new(),
            recurse: false,
            working_dir: default_working_dir(),
            cache_budget_bytes: 0,
            max_copy_tasks: default_max_copy_tasks(),
            ascending_order: false,
            overwrite_original: false,
            delete_original: false,
            log_file: None,
            encoder: EncoderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// Checks that at least one library path is configured and that the
    /// four encoder quality knobs hold known values. The knobs are opaque
    /// strings as far as the pipeline is concerned; they are only checked
    /// here, before any job runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.library_paths.is_empty() {
            return Err(ConfigError::NoLibraryPaths);
        }

        let knobs: [(&'static str, &str, &[&str]); 4] = [
            ("x264_preset", &self.encoder.x264_preset, X264_PRESETS),
            ("x264_profile", &self.encoder.x264_profile, X264_PROFILES),
            ("x264_tune", &self.encoder.x264_tune, X264_TUNES),
            ("h264_level", &self.encoder.h264_level, H264_LEVELS),
        ];
        for (knob, value, known) in knobs {
            if !known.contains(&value) {
                return Err(ConfigError::UnknownKnobValue {
                    knob,
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Load configuration from file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
