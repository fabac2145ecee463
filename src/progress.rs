//! Progress reporting infrastructure

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::borrow::Cow;

/// CLI progress report of ongoing operations
///
/// To avoid corrupted terminal output, you should not write anything to stdout
/// or stderr yourself as long as a report is being displayed. Please use logs
/// for debug messages and [`println()`](Self::println) for status messages.
#[derive(Clone, Debug, Default)]
pub struct ProgressReport(MultiProgress);
//
impl ProgressReport {
    /// Prepare to report progress on the cli
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress report that is never displayed
    #[cfg(test)]
    pub fn hidden() -> Self {
        Self(MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ))
    }

    /// Prepare to report on a new operation
    pub fn add(&self, what: impl Into<Cow<'static, str>>, work: Work) -> ProgressTracker {
        let trailer = match work {
            Work::Steps(_) => "{pos}/{len} ({per_sec})",
            Work::Bytes(_) => "{decimal_bytes}/{decimal_total_bytes} ({decimal_bytes_per_sec}, ~{eta} left)",
        };
        let bar = ProgressBar::new(work.into()).with_prefix(what).with_style(
            ProgressStyle::with_template(&format!("{{prefix}} {{wide_bar}} {trailer}"))
                .expect("all styles above should be valid indicatif styles"),
        );
        ProgressTracker(self.0.add(bar))
    }

    /// Print a status message above the progress bars
    pub fn println(&self, message: impl AsRef<str>) {
        if let Err(e) = self.0.println(message.as_ref()) {
            log::warn!("Failed to print status message {:?}: {e}", message.as_ref());
        }
    }
}

/// Work whose progression can be tracked
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Work {
    /// Steps to be taken
    Steps(u64),

    /// Bytes to be processed
    Bytes(u64),
}
//
impl From<Work> for u64 {
    fn from(value: Work) -> Self {
        match value {
            Work::Steps(s) => s,
            Work::Bytes(b) => b,
        }
    }
}

/// Mechanism to track the progress of one operation
#[derive(Clone, Debug)]
pub struct ProgressTracker(ProgressBar);
//
impl ProgressTracker {
    /// Show that a certain amount of progress has been made
    pub fn make_progress(&self, progress: u64) {
        self.0.inc(progress);
    }

    /// Show that a certain point of the work has been reached
    pub fn set_progress(&self, position: u64) {
        self.0.set_position(position);
    }

    /// Hide the progress bar once the operation is over
    pub fn finish(&self) {
        self.0.finish_and_clear();
    }
}
