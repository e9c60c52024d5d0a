//! The persisted job ledger.
//!
//! `jobs.csv` holds one row per job: its id and the normalized parameters it was started with.
//! Each job then has an append-only `<job_id>_progress_report.csv` of completed files, which is
//! what makes a re-run skip work already done.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use error_printer::ErrorPrinter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use transfer_client::{FileDescriptor, FileSelection, TransferDirection};
use ulid::Ulid;

use crate::configurations::TransferConfig;
use crate::constants::JOBS_FILE_NAME;
use crate::errors::{BulkTransferError, Result};

/// The parameters that decide whether two invocations are the same job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobIdentity {
    pub direction: TransferDirection,
    pub destination: String,
    pub selection: FileSelection,
    pub name_filter: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct JobRow {
    job_id: String,
    direction: String,
    destination: String,
    selection_mode: String,
    selection_value: String,
    name_filter: String,
    created_at: String,
}

impl JobIdentity {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            direction: config.direction,
            destination: config.destination_label(),
            selection: config.selection.clone(),
            name_filter: config.name_filter.clone(),
        }
    }

    fn selection_value(&self) -> String {
        match &self.selection {
            FileSelection::Collection(id) | FileSelection::Subset(id) => id.trim().to_owned(),
            FileSelection::Paths(paths) => serde_json::to_string(paths).unwrap_or_default(),
        }
    }

    fn to_row(&self, job_id: String) -> JobRow {
        JobRow {
            job_id,
            direction: self.direction.as_str().to_owned(),
            destination: normalize_destination(&self.destination),
            selection_mode: self.selection.mode().to_owned(),
            selection_value: self.selection_value(),
            name_filter: self.name_filter.clone().unwrap_or_default(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Field-by-field comparison against a stored row.
    fn matches(&self, row: &JobRow) -> bool {
        if row.direction != self.direction.as_str()
            || normalize_destination(&row.destination) != normalize_destination(&self.destination)
            || row.selection_mode != self.selection.mode()
            || row.name_filter != self.name_filter.clone().unwrap_or_default()
        {
            return false;
        }
        match &self.selection {
            FileSelection::Collection(id) | FileSelection::Subset(id) => ids_equal(id, &row.selection_value),
            FileSelection::Paths(paths) => match serde_json::from_str::<Vec<String>>(&row.selection_value) {
                Ok(stored) => basename_set(&stored) == basename_set(paths),
                Err(_) => false,
            },
        }
    }
}

/// Numeric ids compare as integers so "007" and "7" name the same collection.
fn ids_equal(a: &str, b: &str) -> bool {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}

fn basename_set(paths: &[String]) -> BTreeSet<String> {
    paths
        .iter()
        .map(|p| {
            let p = p.trim().trim_end_matches('/');
            p.rsplit('/').next().unwrap_or(p).to_owned()
        })
        .collect()
}

/// Lexically normalizes a local path (absolute, no `.` or `..`, no trailing separator) or trims
/// the trailing slashes of a store locator.
pub fn normalize_destination(destination: &str) -> String {
    let destination = destination.trim();
    if destination.contains("://") {
        return progress_tracking::canonical_locator(destination);
    }
    let path = std::path::absolute(destination).unwrap_or_else(|_| PathBuf::from(destination));
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                normalized.pop();
            },
            c => normalized.push(c.as_os_str()),
        }
    }
    normalized.to_string_lossy().into_owned()
}

/// One completed file. Rows are written once and never changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub file_id: String,
    pub locator: String,
    /// True when the destination already held the file and nothing was transferred.
    pub exists: bool,
    pub expected_size: u64,
    pub actual_size: u64,
    pub checksum: String,
    pub completed_at: String,
}

impl TransferRecord {
    pub fn new(file: &FileDescriptor, exists: bool, actual_size: u64, checksum: Option<String>) -> Self {
        Self {
            file_id: file.file_id.clone(),
            locator: file.locator.to_string(),
            exists,
            expected_size: file.expected_size,
            actual_size,
            checksum: checksum.unwrap_or_default(),
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Zero-byte outcomes are only recorded for files that are meant to be empty.
    pub fn is_recordable(&self) -> bool {
        self.actual_size > 0 || self.expected_size == 0
    }
}

pub struct JobLedger {
    dir: PathBuf,
    job_id: String,
    is_new_job: bool,
    completed: HashMap<String, TransferRecord>,
}

impl JobLedger {
    /// Resolves the job for `identity`, reusing a matching row in `jobs.csv` or appending a
    /// new one, and loads the files the job has already completed.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path, identity: &JobIdentity) -> Result<Self> {
        std::fs::create_dir_all(dir).log_error(format!("creating ledger directory {dir:?}"))?;
        let jobs_path = dir.join(JOBS_FILE_NAME);
        let rows = read_job_rows(&jobs_path)?;

        let (job_id, is_new_job) = match rows.iter().find(|row| identity.matches(row)) {
            Some(row) => {
                info!(job_id = row.job_id.as_str(), "resuming existing job");
                (row.job_id.clone(), false)
            },
            None => {
                let row = identity.to_row(Ulid::new().to_string());
                append_job_row(&jobs_path, &row)?;
                info!(job_id = row.job_id.as_str(), "created new job");
                (row.job_id, true)
            },
        };

        let mut ledger = Self {
            dir: dir.to_path_buf(),
            job_id,
            is_new_job,
            completed: HashMap::new(),
        };
        ledger.completed = load_records(&ledger.progress_report_path())?;
        debug!(n_completed = ledger.completed.len(), "loaded completed records");
        Ok(ledger)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_new_job(&self) -> bool {
        self.is_new_job
    }

    /// Completed records keyed by file id.
    pub fn completed(&self) -> &HashMap<String, TransferRecord> {
        &self.completed
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.completed.keys().cloned().collect()
    }

    pub fn progress_report_path(&self) -> PathBuf {
        self.dir.join(format!("{}_progress_report.csv", self.job_id))
    }

    pub fn retry_manifest_path(&self) -> PathBuf {
        self.dir.join(format!("{}_retry_manifest.txt", self.job_id))
    }

    /// Starts the single task that appends records to the progress report. The task ends once
    /// every [LedgerWriter] clone has been dropped and returns the number of rows written.
    pub fn start_writer(&self, capacity: usize) -> (LedgerWriter, JoinHandle<Result<u64>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let path = self.progress_report_path();
        let handle = tokio::spawn(run_writer(path, rx));
        (LedgerWriter { tx }, handle)
    }
}

fn read_job_rows(path: &Path) -> Result<Vec<JobRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<JobRow>() {
        match row {
            Ok(r) => rows.push(r),
            Err(e) => warn!("skipping unreadable row in {path:?}: {e}"),
        }
    }
    Ok(rows)
}

fn append_job_row(path: &Path, row: &JobRow) -> Result<()> {
    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
    terminate_torn_line(&mut file)?;
    let mut writer = csv::WriterBuilder::new().has_headers(needs_header).from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}

/// Ends a half-written last line so the next appended row starts on its own line.
fn terminate_torn_line(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("terminating torn last row before appending");
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Loads completed records. A half-written last line left by a crash is skipped.
fn load_records(path: &Path) -> Result<HashMap<String, TransferRecord>> {
    let mut completed = HashMap::new();
    if !path.exists() {
        return Ok(completed);
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    for record in reader.deserialize::<TransferRecord>() {
        match record {
            Ok(r) if r.is_recordable() => {
                completed.insert(r.file_id.clone(), r);
            },
            Ok(r) => debug!(file_id = r.file_id.as_str(), "ignoring zero-size record"),
            Err(e) => warn!("skipping unreadable row in {path:?}: {e}"),
        }
    }
    Ok(completed)
}

async fn run_writer(path: PathBuf, mut rx: mpsc::Receiver<TransferRecord>) -> Result<u64> {
    let needs_header = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(&path)
        .log_error(format!("opening progress report {path:?}"))?;
    terminate_torn_line(&mut file).log_error(format!("repairing progress report {path:?}"))?;
    let mut writer = csv::WriterBuilder::new().has_headers(needs_header).from_writer(file);

    let mut written = 0;
    while let Some(record) = rx.recv().await {
        if !record.is_recordable() {
            warn!(
                file_id = record.file_id.as_str(),
                expected_size = record.expected_size,
                "not recording zero-byte outcome for a non-empty file"
            );
            continue;
        }
        writer.serialize(&record).log_error("writing progress record")?;
        // Flushed per row so a crash loses at most the row being written.
        writer.flush()?;
        written += 1;
    }
    debug!(written, "ledger writer finished");
    Ok(written)
}

/// Handle for sending completed records to the writer task.
#[derive(Clone)]
pub struct LedgerWriter {
    tx: mpsc::Sender<TransferRecord>,
}

impl LedgerWriter {
    pub async fn record(&self, record: TransferRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|e| BulkTransferError::LedgerError(format!("ledger writer stopped; lost record for {}", e.0.file_id)))
    }
}
