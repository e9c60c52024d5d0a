use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{ProgressReport, ProgressUnit};

/// Receives the periodic reports produced by [crate::ProgressTracker]. This drives whatever
/// live indicator the caller wants; the tracker never holds its lock while calling it.
#[async_trait]
pub trait ProgressReporter: Debug + Send + Sync {
    async fn register_report(&self, report: ProgressReport);
}

#[derive(Debug, Default)]
pub struct NoOpProgressReporter;

impl NoOpProgressReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

#[async_trait]
impl ProgressReporter for NoOpProgressReporter {
    async fn register_report(&self, _report: ProgressReport) {}
}

/// Writes each report as a structured log line.
#[derive(Debug, Default)]
pub struct LoggingProgressReporter;

impl LoggingProgressReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

#[async_trait]
impl ProgressReporter for LoggingProgressReporter {
    async fn register_report(&self, report: ProgressReport) {
        let percent = report.fraction_complete() * 100.0;
        let mb_per_sec = report.window_throughput() / (1024.0 * 1024.0);
        match report.unit {
            ProgressUnit::Bytes => info!(
                files_completed = report.files_completed,
                files_total = report.files_total,
                bytes_completed = report.bytes_completed,
                window_bytes = report.window_bytes,
                window_secs = report.window_elapsed.as_secs_f64(),
                final_report = report.is_final,
                "Transfer progress: {percent:.1}% ({mb_per_sec:.2} MiB/s)"
            ),
            ProgressUnit::Files => info!(
                files_completed = report.files_completed,
                files_total = report.files_total,
                window_secs = report.window_elapsed.as_secs_f64(),
                final_report = report.is_final,
                "Copy progress: {}/{} files ({percent:.1}%)",
                report.files_completed,
                report.files_total
            ),
        }
    }
}
