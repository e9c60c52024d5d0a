use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::{ProgressReport, ProgressReporter, ProgressSnapshot, ProgressUnit};

#[derive(Debug)]
struct TrackerState {
    snapshot: ProgressSnapshot,
    files_total: u64,
    bytes_total: Option<u64>,
}

enum FileOutcome {
    Completed,
    Skipped,
    Failed,
}

/// Accumulates byte and file counters for a whole run. Every `report_every_n_files` completed
/// files a [ProgressReport] covering the trailing window is sent to the reporter and the window
/// is reset.
///
/// All counter updates happen under one lock; the reporter is always called after the lock is
/// released.
#[derive(Debug)]
pub struct ProgressTracker {
    unit: ProgressUnit,
    report_every_n_files: u64,
    state: Mutex<TrackerState>,
    reporter: Arc<dyn ProgressReporter>,
}

impl ProgressTracker {
    pub fn new(unit: ProgressUnit, report_every_n_files: u64, reporter: Arc<dyn ProgressReporter>) -> Arc<Self> {
        let bytes_total = match unit {
            ProgressUnit::Bytes => Some(0),
            ProgressUnit::Files => None,
        };
        Arc::new(Self {
            unit,
            report_every_n_files: report_every_n_files.max(1),
            state: Mutex::new(TrackerState {
                snapshot: ProgressSnapshot::new(),
                files_total: 0,
                bytes_total,
            }),
            reporter,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn unit(&self) -> ProgressUnit {
        self.unit
    }

    /// Grows the known totals. Enumeration is lazy, so totals arrive batch by batch.
    pub fn register_totals(&self, n_files: u64, n_bytes: u64) {
        let mut state = self.lock_state();
        state.files_total += n_files;
        if let Some(total) = state.bytes_total.as_mut() {
            *total += n_bytes;
        }
    }

    /// Records bytes moved over the network or disk.
    pub fn record_bytes(&self, n_bytes: u64) {
        if n_bytes == 0 {
            return;
        }
        let mut state = self.lock_state();
        state.snapshot.window_bytes += n_bytes;
        state.snapshot.total_bytes_transferred += n_bytes;
    }

    pub async fn record_completed(&self) {
        self.finish_file(FileOutcome::Completed).await
    }

    pub async fn record_skipped(&self) {
        self.finish_file(FileOutcome::Skipped).await
    }

    pub async fn record_failed(&self) {
        self.finish_file(FileOutcome::Failed).await
    }

    async fn finish_file(&self, outcome: FileOutcome) {
        let maybe_report = {
            let mut state = self.lock_state();
            match outcome {
                FileOutcome::Completed => state.snapshot.completed_files += 1,
                FileOutcome::Skipped => {
                    state.snapshot.completed_files += 1;
                    state.snapshot.skipped_files += 1;
                },
                FileOutcome::Failed => state.snapshot.failed_files += 1,
            }

            let is_report_point = !matches!(outcome, FileOutcome::Failed)
                && state.snapshot.completed_files % self.report_every_n_files == 0;

            is_report_point.then(|| self.take_window_report(&mut state, false))
        };

        if let Some(report) = maybe_report {
            self.reporter.register_report(report).await;
        }
    }

    /// Builds a report from the current window and starts a new one.
    fn take_window_report(&self, state: &mut TrackerState, is_final: bool) -> ProgressReport {
        let now = Instant::now();
        let report = ProgressReport {
            unit: self.unit,
            files_completed: state.snapshot.completed_files,
            files_total: state.files_total,
            bytes_completed: state.snapshot.total_bytes_transferred,
            bytes_total: state.bytes_total,
            window_bytes: state.snapshot.window_bytes,
            window_elapsed: now.duration_since(state.snapshot.window_start),
            is_final,
        };
        state.snapshot.window_bytes = 0;
        state.snapshot.window_start = now;
        report
    }

    /// A copy of the current counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock_state().snapshot.clone()
    }

    /// Emits the closing report for the run and returns it.
    pub async fn finish(&self) -> ProgressReport {
        let report = {
            let mut state = self.lock_state();
            self.take_window_report(&mut state, true)
        };
        self.reporter.register_report(report.clone()).await;
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Default)]
    struct CollectingReporter {
        reports: Mutex<Vec<ProgressReport>>,
    }

    #[async_trait]
    impl ProgressReporter for CollectingReporter {
        async fn register_report(&self, report: ProgressReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_every_n_files_and_resets_window() {
        let reporter = Arc::new(CollectingReporter::default());
        let tracker = ProgressTracker::new(ProgressUnit::Bytes, 2, reporter.clone());
        tracker.register_totals(5, 500);

        tracker.record_bytes(100);
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.record_completed().await;
        assert!(reporter.reports.lock().unwrap().is_empty());

        tracker.record_bytes(100);
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.record_completed().await;

        {
            let reports = reporter.reports.lock().unwrap();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].files_completed, 2);
            assert_eq!(reports[0].files_total, 5);
            assert_eq!(reports[0].window_bytes, 200);
            assert_eq!(reports[0].window_elapsed, Duration::from_secs(2));
            assert_eq!(reports[0].window_throughput(), 100.0);
        }

        // The window was reset by the report.
        assert_eq!(tracker.snapshot().window_bytes, 0);
        assert_eq!(tracker.snapshot().total_bytes_transferred, 200);
    }

    #[tokio::test]
    async fn test_skips_and_failures_are_counted() {
        let reporter = Arc::new(CollectingReporter::default());
        let tracker = ProgressTracker::new(ProgressUnit::Files, 50, reporter.clone());
        tracker.register_totals(3, 0);

        tracker.record_skipped().await;
        tracker.record_failed().await;
        tracker.record_completed().await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed_files, 2);
        assert_eq!(snapshot.skipped_files, 1);
        assert_eq!(snapshot.failed_files, 1);

        let last = tracker.finish().await;
        assert!(last.is_final);
        assert_eq!(last.bytes_total, None);
        assert_eq!(last.fraction_complete(), 2.0 / 3.0);
        assert_eq!(reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let tracker = ProgressTracker::new(ProgressUnit::Bytes, 7, Arc::new(CollectingReporter::default()));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_bytes(10);
                tracker.record_completed().await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed_files, 64);
        assert_eq!(snapshot.total_bytes_transferred, 640);
    }
}
