use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use progress_tracking::{FailureCollector, LoggingProgressReporter, ProgressReporter, ProgressTracker, ProgressUnit};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use transfer_client::{MetadataService, ObjectStore, TransferDirection};

use crate::configurations::TransferConfig;
use crate::credentials::CredentialBroker;
use crate::enumerator::BatchEnumerator;
use crate::errors::{BulkTransferError, Result};
use crate::ledger::{JobIdentity, JobLedger};
use crate::multipart::MultipartUploadManager;
use crate::transfer_task::{TaskContext, TaskMode};
use crate::worker_pool::TransferWorkerPool;

/// What a run did, reported once it ends.
#[derive(Clone, Debug)]
pub struct TransferSummary {
    pub job_id: String,
    /// Files handed to the workers in this run.
    pub requested: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Files left out because an earlier run of the same job completed them.
    pub previously_completed: u64,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub manifest_path: PathBuf,
    pub retry_hint: Option<String>,
}

impl TransferSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// The context for one invocation: configuration plus the services it talks to. Nothing is
/// global; build one engine per run.
pub struct TransferEngine {
    config: TransferConfig,
    metadata: Arc<dyn MetadataService>,
    store: Arc<dyn ObjectStore>,
    destination_store: Option<Arc<dyn ObjectStore>>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl TransferEngine {
    pub fn new(config: TransferConfig, metadata: Arc<dyn MetadataService>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            metadata,
            store,
            destination_store: None,
            reporter: LoggingProgressReporter::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The external store remote copies write to. Defaults to the managed store.
    pub fn with_destination_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.destination_store = Some(store);
        self
    }

    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Cancelling this token stops the run at the next file boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transfers every selected file not already completed by an earlier run of the same job.
    /// Runs in verify mode instead when the configuration asks for it.
    #[instrument(skip_all, fields(direction = %self.config.direction, destination = %self.config.destination_label()))]
    pub async fn run(&self) -> Result<TransferSummary> {
        let mode = if self.config.verify_only {
            TaskMode::VerifyOnly
        } else {
            TaskMode::Transfer
        };
        self.execute(mode).await
    }

    /// Checks every selected file against the destination without transferring anything.
    /// Mismatches are written to the retry manifest.
    #[instrument(skip_all, fields(direction = %self.config.direction, destination = %self.config.destination_label()))]
    pub async fn verify(&self) -> Result<TransferSummary> {
        self.execute(TaskMode::VerifyOnly).await
    }

    async fn execute(&self, mode: TaskMode) -> Result<TransferSummary> {
        let config = &self.config;
        config.validate()?;
        let start = Instant::now();

        let ledger = JobLedger::open(&config.ledger_dir, &JobIdentity::from_config(config))?;
        let failures = Arc::new(FailureCollector::new(ledger.retry_manifest_path())?);

        let unit = match config.direction {
            TransferDirection::RemoteCopy => ProgressUnit::Files,
            _ => ProgressUnit::Bytes,
        };
        let progress = ProgressTracker::new(unit, config.report_every_n_files, self.reporter.clone());
        let broker = Arc::new(CredentialBroker::new(
            self.metadata.clone(),
            config.direction,
            config.credential_batch_limit,
        ));

        // Parts are written to whichever store receives the file.
        let destination_store = self.destination_store.clone().unwrap_or_else(|| self.store.clone());
        let part_store = match config.direction {
            TransferDirection::RemoteCopy => destination_store.clone(),
            _ => self.store.clone(),
        };
        let multipart =
            MultipartUploadManager::new(part_store, config.multipart.clone()).with_progress(progress.clone());

        // Verification re-checks everything and records nothing.
        let (completed, ledger_writer, writer_handle) = match mode {
            TaskMode::Transfer => {
                let (writer, handle) = ledger.start_writer(config.batch_size);
                (ledger.completed_ids(), Some(writer), Some(handle))
            },
            TaskMode::VerifyOnly => (HashSet::new(), None, None),
        };

        let context = Arc::new(TaskContext {
            direction: config.direction,
            mode,
            local_root: config.local_root.clone(),
            remote_destination: config.remote_destination.clone(),
            source_store: self.store.clone(),
            destination_store,
            broker: broker.clone(),
            multipart,
            progress: progress.clone(),
            failures: failures.clone(),
            ledger: ledger_writer,
            stream_chunk_size: config.stream_chunk_size,
        });

        let mut enumerator = BatchEnumerator::new(
            self.metadata.clone(),
            config.selection.clone(),
            config.name_filter.as_deref(),
            config.batch_size,
            completed,
        )?;

        info!(
            job_id = ledger.job_id(),
            resumed = !ledger.is_new_job(),
            previously_completed = ledger.completed().len(),
            num_workers = config.num_workers,
            batch_size = config.batch_size,
            ?mode,
            "starting run"
        );

        let pool = TransferWorkerPool::start(context.clone(), config.num_workers, config.batch_size, self.cancel.clone());
        let needs_credentials = !(mode == TaskMode::VerifyOnly && config.direction == TransferDirection::Download);

        while !pool.is_cancelled() {
            let batch = match enumerator.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    pool.abort_with(e);
                    break;
                },
            };

            if needs_credentials {
                let ids: Vec<String> = batch.iter().map(|f| f.file_id.clone()).collect();
                if let Err(e) = broker.prefetch(&ids).await {
                    pool.abort_with(e);
                    break;
                }
            }

            progress.register_totals(batch.len() as u64, batch.iter().map(|f| f.expected_size).sum());
            for file in batch {
                if pool.submit(file).await.is_err() {
                    break;
                }
            }
        }

        let pool_result = pool.finish().await;

        // The writer task ends once the last sender, held by the context, is gone.
        drop(context);
        let rows_written = match writer_handle {
            Some(handle) => handle.await??,
            None => 0,
        };

        let report = progress.finish().await;
        let snapshot = progress.snapshot();
        let stats = enumerator.stats();

        let summary = TransferSummary {
            job_id: ledger.job_id().to_owned(),
            requested: stats.yielded,
            succeeded: snapshot.completed_files.saturating_sub(snapshot.skipped_files),
            skipped: snapshot.skipped_files,
            failed: snapshot.failed_files,
            previously_completed: stats.already_complete,
            bytes_transferred: snapshot.total_bytes_transferred,
            elapsed: start.elapsed(),
            manifest_path: failures.manifest_path().to_path_buf(),
            retry_hint: failures.retry_hint(),
        };

        if let Err(e) = pool_result {
            if matches!(e, BulkTransferError::Cancelled) {
                warn!(requested = summary.requested, "run cancelled");
            }
            return Err(e);
        }

        info!(
            job_id = summary.job_id.as_str(),
            requested = summary.requested,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            previously_completed = summary.previously_completed,
            bytes = summary.bytes_transferred,
            rows_written,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            throughput = report.window_throughput(),
            "run finished"
        );
        for (kind, count) in failures.counts_by_kind() {
            warn!(kind = kind.as_str(), count, "failures by kind");
        }
        if let Some(hint) = &summary.retry_hint {
            warn!("{hint}");
        }
        Ok(summary)
    }
}
