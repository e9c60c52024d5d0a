use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use error_printer::ErrorPrinter;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::Result;

/// One failed file as seen by the collector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    /// The canonical remote locator; this is what goes into the retry manifest.
    pub locator: String,
    pub file_id: String,
    /// The failure classification, e.g. "NotFound" or "Forbidden".
    pub kind: String,
    pub message: String,
}

/// Collects per-file failures for a run.
///
/// Failures are deduplicated by canonical locator. Each newly observed failure is appended to
/// the retry manifest right away, so a crash mid-run still leaves a usable partial manifest.
/// The manifest is truncated when the collector is created; it describes one run only.
#[derive(Debug)]
pub struct FailureCollector {
    manifest_path: PathBuf,
    seen: Mutex<HashSet<String>>,
    records: Mutex<Vec<FailureRecord>>,
    manifest: tokio::sync::Mutex<File>,
}

/// Strips trailing slashes and surrounding whitespace so the same object reported through
/// different paths is counted once.
pub fn canonical_locator(locator: &str) -> String {
    locator.trim().trim_end_matches('/').to_owned()
}

impl FailureCollector {
    pub fn new(manifest_path: impl AsRef<Path>) -> Result<Self> {
        let manifest_path = manifest_path.as_ref().to_path_buf();
        if let Some(parent) = manifest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manifest = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&manifest_path)?;

        Ok(Self {
            manifest_path,
            seen: Mutex::new(HashSet::new()),
            records: Mutex::new(Vec::new()),
            manifest: tokio::sync::Mutex::new(File::from_std(manifest)),
        })
    }

    /// Records a failure. Returns true if this locator had not failed before in this run.
    pub async fn record(&self, locator: &str, file_id: &str, kind: &str, message: &str) -> Result<bool> {
        let locator = canonical_locator(locator);

        let is_new = self.seen.lock().unwrap_or_else(PoisonError::into_inner).insert(locator.clone());
        if !is_new {
            debug!(locator = locator.as_str(), "Failure already recorded for this locator; ignoring duplicate.");
            return Ok(false);
        }

        let record = FailureRecord {
            locator: locator.clone(),
            file_id: file_id.to_owned(),
            kind: kind.to_owned(),
            message: message.to_owned(),
        };
        warn!(locator = locator.as_str(), file_id, kind = record.kind.as_str(), "Transfer failed: {}", record.message);
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);

        let mut manifest = self.manifest.lock().await;
        let appended = match manifest.write_all(format!("{locator}\n").as_bytes()).await {
            Ok(()) => manifest.flush().await,
            Err(e) => Err(e),
        };
        appended.log_error(format!("Error appending {locator} to retry manifest {:?}", self.manifest_path))?;

        Ok(true)
    }

    pub fn failure_count(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of failures per classification.
    pub fn counts_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for r in self.records.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            *counts.entry(r.kind.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// A ready-to-use hint for re-running only the failed files, or None if nothing failed.
    pub fn retry_hint(&self) -> Option<String> {
        (self.failure_count() > 0).then(|| {
            format!(
                "{} file(s) failed; re-run with `--file-list {}` to retry only those files.",
                self.failure_count(),
                self.manifest_path.display()
            )
        })
    }
}

/// Reads a retry manifest back into a list of locators, skipping blank lines.
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}
