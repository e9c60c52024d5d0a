use std::path::{Path, PathBuf};

use transfer_client::{Credentials, FileSelection, ObjectLocator, TransferDirection};

use crate::constants::*;
use crate::errors::{BulkTransferError, Result};

/// Part sizing and the thresholds above which multipart sessions are used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartConfig {
    pub max_parts: u64,
    pub min_part_size: u64,
    pub upload_threshold: u64,
    pub copy_threshold: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            max_parts: *MAX_PARTS_PER_SESSION,
            min_part_size: *MIN_PART_SIZE,
            upload_threshold: *MULTIPART_UPLOAD_THRESHOLD,
            copy_threshold: *MULTIPART_COPY_THRESHOLD,
        }
    }
}

/// Where a remote copy writes to: a prefix in an external store and the long-lived credentials
/// for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDestination {
    pub prefix: ObjectLocator,
    pub credentials: Credentials,
}

/// Everything one invocation of the engine needs to know.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub direction: TransferDirection,
    /// Download destination or upload source.
    pub local_root: PathBuf,
    /// Required for remote copies.
    pub remote_destination: Option<RemoteDestination>,
    pub selection: FileSelection,
    /// Regular expression matched against each file's relative path.
    pub name_filter: Option<String>,
    pub num_workers: usize,
    pub batch_size: usize,
    /// Holds the job table, progress reports and retry manifests.
    pub ledger_dir: PathBuf,
    pub verify_only: bool,
    pub stream_chunk_size: usize,
    pub multipart: MultipartConfig,
    pub credential_batch_limit: usize,
    pub report_every_n_files: u64,
}

/// `clamp(cores - 1, 1, MAX_DEFAULT_WORKERS)`.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    cores.saturating_sub(1).clamp(1, (*MAX_DEFAULT_WORKERS).max(1))
}

/// The per-user data directory, or a hidden directory below `local_root` when there is none.
pub fn default_ledger_dir(local_root: &Path) -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bulk_xfer"))
        .unwrap_or_else(|| local_root.join(".bulk_xfer"))
}

impl TransferConfig {
    pub fn new(direction: TransferDirection, local_root: impl Into<PathBuf>, selection: FileSelection) -> Self {
        let local_root = local_root.into();
        Self {
            direction,
            ledger_dir: default_ledger_dir(&local_root),
            local_root,
            remote_destination: None,
            selection,
            name_filter: None,
            num_workers: default_worker_count(),
            batch_size: *DEFAULT_BATCH_SIZE,
            verify_only: false,
            stream_chunk_size: *TRANSFER_CHUNK_SIZE,
            multipart: MultipartConfig::default(),
            credential_batch_limit: *CREDENTIAL_BATCH_LIMIT,
            report_every_n_files: *PROGRESS_REPORT_INTERVAL,
        }
    }

    pub fn with_remote_destination(mut self, prefix: ObjectLocator, credentials: Credentials) -> Self {
        self.remote_destination = Some(RemoteDestination { prefix, credentials });
        self
    }

    pub fn with_name_filter(mut self, filter: impl Into<String>) -> Self {
        self.name_filter = Some(filter.into());
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_ledger_dir(mut self, ledger_dir: impl Into<PathBuf>) -> Self {
        self.ledger_dir = ledger_dir.into();
        self
    }

    pub fn with_verify_only(mut self, verify_only: bool) -> Self {
        self.verify_only = verify_only;
        self
    }

    pub fn with_stream_chunk_size(mut self, stream_chunk_size: usize) -> Self {
        self.stream_chunk_size = stream_chunk_size;
        self
    }

    pub fn with_multipart(mut self, multipart: MultipartConfig) -> Self {
        self.multipart = multipart;
        self
    }

    pub fn with_credential_batch_limit(mut self, limit: usize) -> Self {
        self.credential_batch_limit = limit;
        self
    }

    pub fn with_report_interval(mut self, every_n_files: u64) -> Self {
        self.report_every_n_files = every_n_files;
        self
    }

    /// Rejects configurations that cannot run. Called before any work starts.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(BulkTransferError::ConfigurationError(msg));
        if self.num_workers == 0 {
            return fail("worker count must be at least 1".to_owned());
        }
        if self.batch_size == 0 {
            return fail("batch size must be at least 1".to_owned());
        }
        if self.stream_chunk_size == 0 {
            return fail("stream chunk size must be at least 1".to_owned());
        }
        if self.credential_batch_limit == 0 {
            return fail("credential batch limit must be at least 1".to_owned());
        }
        if self.multipart.max_parts < 2 {
            return fail(format!("part ceiling {} must be at least 2", self.multipart.max_parts));
        }
        if let Some(filter) = &self.name_filter {
            regex::Regex::new(filter)?;
        }
        match self.direction {
            TransferDirection::RemoteCopy if self.remote_destination.is_none() => {
                fail("a remote copy needs a destination prefix and credentials".to_owned())
            },
            TransferDirection::Upload if !self.local_root.is_dir() => {
                fail(format!("upload source {:?} is not a directory", self.local_root))
            },
            _ => Ok(()),
        }
    }

    /// The destination as it appears in the job identity.
    pub fn destination_label(&self) -> String {
        match (&self.direction, &self.remote_destination) {
            (TransferDirection::RemoteCopy, Some(dest)) => dest.prefix.to_string(),
            _ => self.local_root.to_string_lossy().into_owned(),
        }
    }
}
