//! Rate limiting for encoder progress output.
//!
//! HandBrakeCLI repeats `Encoding: task <n> of <m>, <percent> % (...)`
//! lines many times per second. The filter passes one through only when
//! the percentage changed and enough time has passed, so logs stay
//! readable over multi-hour encodes. Non-progress lines always pass.

use regex::Regex;
use std::time::{Duration, Instant};

/// Minimum gap between progress emissions when the percentage changes.
const REPEAT_INTERVAL: Duration = Duration::from_secs(10);
/// After this long a progress line is emitted unconditionally.
const FORCE_INTERVAL: Duration = Duration::from_secs(600);

/// Stateful filter over one encoder's interleaved output lines.
///
/// The percent/timestamp state is shared across whatever the supervisor
/// is currently encoding; since at most one encode runs at a time, the
/// lines can only belong to one subprocess.
#[derive(Debug)]
pub struct ProgressFilter {
    pattern: Regex,
    last_percent: Option<String>,
    last_emit: Option<Instant>,
}

impl ProgressFilter {
    pub fn new() -> Self {
        Self {
            // Encoding: task 1 of 1, 94.89 % (24.66 fps, avg 14.76 fps, ETA 00h11m31s)
            pattern: Regex::new(r"^Encoding: task \d+ of \d+, (\S+) %")
                .expect("progress pattern compiles"),
            last_percent: None,
            last_emit: None,
        }
    }

    /// Decide whether `line` should be logged, using the wall clock.
    pub fn should_emit(&mut self, line: &str) -> bool {
        self.check(line, Instant::now())
    }

    /// Decide whether `line` should be logged as of `now`.
    ///
    /// Progress lines pass when the percentage differs from the last
    /// emission and at least ten seconds elapsed, or unconditionally
    /// after ten minutes of suppression. Any other line passes and
    /// resets the progress state.
    pub fn check(&mut self, line: &str, now: Instant) -> bool {
        let Some(caps) = self.pattern.captures(line) else {
            self.last_percent = None;
            self.last_emit = None;
            return true;
        };

        let percent = caps[1].to_string();
        let since_last = |interval: Duration| {
            self.last_emit
                .map_or(true, |at| now.duration_since(at) > interval)
        };

        let changed = self.last_percent.as_deref() != Some(percent.as_str());
        if (changed && since_last(REPEAT_INTERVAL)) || since_last(FORCE_INTERVAL) {
            self.last_percent = Some(percent);
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}

impl Default for ProgressFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_line(percent: &str) -> String {
        format!(
            "Encoding: task 1 of 1, {} % (24.66 fps, avg 14.76 fps, ETA 00h11m31s)",
            percent
        )
    }

    #[test]
    fn test_first_progress_line_emits() {
        let mut filter = ProgressFilter::new();
        assert!(filter.check(&progress_line("10.00"), Instant::now()));
    }

    #[test]
    fn test_non_progress_lines_always_emit() {
        let mut filter = ProgressFilter::new();
        let now = Instant::now();
        assert!(filter.check("Scanning title 1 of 1", now));
        assert!(filter.check("Scanning title 1 of 1", now));
        assert!(filter.check("", now));
    }

    #[test]
    fn test_repeated_percent_is_suppressed() {
        let mut filter = ProgressFilter::new();
        let start = Instant::now();
        assert!(filter.check(&progress_line("10.00"), start));

        // Same percent, even after the repeat interval.
        let later = start + Duration::from_secs(30);
        assert!(!filter.check(&progress_line("10.00"), later));
    }

    #[test]
    fn test_changed_percent_within_interval_is_suppressed() {
        let mut filter = ProgressFilter::new();
        let start = Instant::now();
        assert!(filter.check(&progress_line("10.00"), start));

        let soon = start + Duration::from_secs(5);
        assert!(!filter.check(&progress_line("10.50"), soon));
    }

    #[test]
    fn test_changed_percent_after_interval_emits() {
        let mut filter = ProgressFilter::new();
        let start = Instant::now();
        assert!(filter.check(&progress_line("10.00"), start));

        let later = start + Duration::from_secs(11);
        assert!(filter.check(&progress_line("10.50"), later));
    }

    #[test]
    fn test_unchanged_percent_emits_after_force_interval() {
        let mut filter = ProgressFilter::new();
        let start = Instant::now();
        assert!(filter.check(&progress_line("99.99"), start));

        let much_later = start + Duration::from_secs(601);
        assert!(filter.check(&progress_line("99.99"), much_later));
    }

    #[test]
    fn test_non_progress_line_resets_throttle_state() {
        let mut filter = ProgressFilter::new();
        let start = Instant::now();
        assert!(filter.check(&progress_line("10.00"), start));

        let soon = start + Duration::from_secs(1);
        assert!(filter.check("Muxing: this may take awhile...", soon));

        // The reset makes the next progress line emit immediately.
        assert!(filter.check(&progress_line("10.00"), soon));
    }
}
