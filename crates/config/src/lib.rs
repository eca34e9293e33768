//! Configuration module for rebrake
//!
//! Handles loading and validating the re-encoding run configuration.

pub mod config;

pub use config::*;
