//! Encoder subprocess supervision and output filtering.

pub mod handbrake;
pub mod progress;

pub use handbrake::{next_free_path, EncoderSupervisor};
pub use progress::ProgressFilter;
