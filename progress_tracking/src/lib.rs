#![cfg_attr(feature = "strict", deny(warnings))]

pub mod errors;
mod failure_collector;
mod progress_info;
mod progress_tracker;
mod update_interfaces;

pub use errors::ProgressTrackingError;
pub use failure_collector::{FailureCollector, FailureRecord, canonical_locator, read_manifest};
pub use progress_info::{ProgressReport, ProgressSnapshot, ProgressUnit};
pub use progress_tracker::ProgressTracker;
pub use update_interfaces::{LoggingProgressReporter, NoOpProgressReporter, ProgressReporter};
