use std::time::Duration;

/// What the live indicator counts. Remote copies may not know their byte totals upfront,
/// so those are tracked by file count instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressUnit {
    Bytes,
    Files,
}

/// The state accumulated between reports. Mutated under a single lock by the tracker.
#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    /// Bytes moved since the start of the current trailing window.
    pub window_bytes: u64,

    /// When the current trailing window started.
    pub window_start: tokio::time::Instant,

    /// Files that reached a terminal successful state (completed or skipped).
    pub completed_files: u64,

    /// Files that were found already present at the destination.
    pub skipped_files: u64,

    /// Files that ended in a recorded failure.
    pub failed_files: u64,

    /// Bytes moved over the whole run.
    pub total_bytes_transferred: u64,
}

impl ProgressSnapshot {
    pub(crate) fn new() -> Self {
        Self {
            window_bytes: 0,
            window_start: tokio::time::Instant::now(),
            completed_files: 0,
            skipped_files: 0,
            failed_files: 0,
            total_bytes_transferred: 0,
        }
    }
}

/// A single report emitted by the tracker to a [crate::ProgressReporter].
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressReport {
    pub unit: ProgressUnit,

    /// Files completed so far (including skipped ones) and the total known so far.
    pub files_completed: u64,
    pub files_total: u64,

    /// Bytes moved so far and the total known so far, if the unit is bytes.
    pub bytes_completed: u64,
    pub bytes_total: Option<u64>,

    /// Bytes moved in the trailing window this report closes, and how long that window was.
    pub window_bytes: u64,
    pub window_elapsed: Duration,

    /// True for the last report of a run.
    pub is_final: bool,
}

impl ProgressReport {
    /// Throughput over the trailing window, in bytes per second.
    pub fn window_throughput(&self) -> f64 {
        let secs = self.window_elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            0.0
        } else {
            self.window_bytes as f64 / secs
        }
    }

    /// Fraction complete in [0, 1], measured in the report's unit.
    pub fn fraction_complete(&self) -> f64 {
        match (self.unit, self.bytes_total) {
            (ProgressUnit::Bytes, Some(total)) if total > 0 => (self.bytes_completed as f64 / total as f64).min(1.0),
            _ if self.files_total > 0 => (self.files_completed as f64 / self.files_total as f64).min(1.0),
            _ => 0.0,
        }
    }
}
