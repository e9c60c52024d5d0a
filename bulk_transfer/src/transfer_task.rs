//! The work done for one file, and how its outcome is reported.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use progress_tracking::{FailureCollector, ProgressTracker};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use transfer_client::checksum::ChecksumBuilder;
use transfer_client::{
    Credentials, FileDescriptor, ObjectHead, ObjectLocator, ObjectStore, TransferClientError, TransferDirection,
};

use crate::configurations::RemoteDestination;
use crate::constants::PARTIAL_SUFFIX;
use crate::credentials::CredentialBroker;
use crate::errors::{BulkTransferError, Result};
use crate::ledger::{LedgerWriter, TransferRecord};
use crate::multipart::{MultipartUploadManager, PartSource};

/// Per-file lifecycle, logged at debug level as a file moves through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Skipped,
    Resuming,
    Starting,
    Transferring,
    Complete,
    FailedRetryable,
    FailedFatal,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn transition(file: &FileDescriptor, state: FileState) {
    debug!(file_id = file.file_id.as_str(), %state, "file state");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskMode {
    Transfer,
    /// Compare destination sizes with expectations; never transfer.
    VerifyOnly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Transferred(TransferRecord),
    /// The destination already held the file.
    Skipped(TransferRecord),
    Verified,
}

/// Everything a worker needs to process files. Shared by all workers of a run.
pub struct TaskContext {
    pub direction: TransferDirection,
    pub mode: TaskMode,
    pub local_root: PathBuf,
    pub remote_destination: Option<RemoteDestination>,
    /// The managed store files are read from or uploaded to.
    pub source_store: Arc<dyn ObjectStore>,
    /// The external store remote copies write to.
    pub destination_store: Arc<dyn ObjectStore>,
    pub broker: Arc<CredentialBroker>,
    pub multipart: MultipartUploadManager,
    pub progress: Arc<ProgressTracker>,
    pub failures: Arc<FailureCollector>,
    pub ledger: Option<LedgerWriter>,
    pub stream_chunk_size: usize,
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

async fn file_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => Ok(Some(m.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn checksum_file(path: &Path, buffer_size: usize) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = ChecksumBuilder::new();
    let mut buf = vec![0u8; buffer_size.clamp(4096, 8 * 1024 * 1024)];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(hasher.finalize());
        }
        hasher.update(&buf[..n]);
    }
}

/// HEAD that treats a missing object as `None`.
async fn head_if_exists(
    store: &dyn ObjectStore,
    locator: &ObjectLocator,
    creds: &Credentials,
) -> Result<Option<ObjectHead>> {
    match store.head_object(locator, creds).await {
        Ok(head) => Ok(Some(head)),
        Err(TransferClientError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl TaskContext {
    /// Local path for a file's alias. Aliases that would escape the root are rejected.
    fn local_path(&self, file: &FileDescriptor) -> Result<PathBuf> {
        let relative = Path::new(file.alias.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path {:?} leaves the transfer root", file.alias),
            )
            .into());
        }
        Ok(self.local_root.join(relative))
    }

    fn remote_destination(&self) -> Result<&RemoteDestination> {
        self.remote_destination
            .as_ref()
            .ok_or_else(|| BulkTransferError::ConfigurationError("remote copy without a destination".to_owned()))
    }

    #[instrument(skip_all, fields(file_id = file.file_id.as_str()))]
    pub async fn process(&self, file: &FileDescriptor) -> Result<FileOutcome> {
        transition(file, FileState::Pending);
        match (self.mode, self.direction) {
            (TaskMode::VerifyOnly, _) => self.verify(file).await,
            (TaskMode::Transfer, TransferDirection::Download) => self.download(file).await,
            (TaskMode::Transfer, TransferDirection::Upload) => self.upload(file).await,
            (TaskMode::Transfer, TransferDirection::RemoteCopy) => self.remote_copy(file).await,
        }
    }

    /// Feeds an outcome to the ledger, progress tracker and failure collector. Returns the
    /// error back only when it must end the run.
    pub async fn report(&self, file: &FileDescriptor, result: Result<FileOutcome>) -> Option<BulkTransferError> {
        self.broker.release(&file.file_id);
        let result = match result {
            Ok(FileOutcome::Transferred(record)) => self.record(record).await.map(|_| false),
            Ok(FileOutcome::Skipped(record)) => self.record(record).await.map(|_| true),
            Ok(FileOutcome::Verified) => Ok(false),
            Err(e) => Err(e),
        };

        match result {
            Ok(skipped) => {
                if skipped {
                    self.progress.record_skipped().await;
                } else {
                    transition(file, FileState::Complete);
                    self.progress.record_completed().await;
                }
                None
            },
            Err(e) if e.is_fatal_for_run() => {
                transition(file, FileState::FailedFatal);
                Some(e)
            },
            Err(e) => {
                let kind = e.kind();
                transition(file, FileState::FailedRetryable);
                let recorded = self
                    .failures
                    .record(&file.locator.to_string(), &file.file_id, &kind.to_string(), &e.to_string())
                    .await;
                if let Err(manifest_err) = recorded {
                    warn!(file_id = file.file_id.as_str(), "could not record failure: {manifest_err}");
                }
                self.progress.record_failed().await;
                None
            },
        }
    }

    async fn record(&self, record: TransferRecord) -> Result<()> {
        match &self.ledger {
            Some(ledger) => ledger.record(record).await,
            None => Ok(()),
        }
    }

    async fn download(&self, file: &FileDescriptor) -> Result<FileOutcome> {
        let final_path = self.local_path(file)?;
        if let Some(len) = file_len(&final_path).await?
            && len == file.expected_size
        {
            transition(file, FileState::Skipped);
            return Ok(FileOutcome::Skipped(TransferRecord::new(file, true, len, None)));
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&final_path);
        if let Some(len) = file_len(&partial).await?
            && len > file.expected_size
        {
            warn!(file_id = file.file_id.as_str(), len, "partial download is longer than the object; discarding");
            tokio::fs::remove_file(&partial).await?;
        }

        let partial_ref = &partial;
        self.broker
            .with_refresh(&file.file_id, |creds| self.fetch_into(file, partial_ref, creds))
            .await?;

        let len = file_len(&partial).await?.unwrap_or(0);
        if len != file.expected_size {
            if len > file.expected_size {
                tokio::fs::remove_file(&partial).await?;
            }
            return Err(BulkTransferError::IntegrityMismatch(format!(
                "{}: received {len} bytes, expected {}",
                file.locator, file.expected_size
            )));
        }

        tokio::fs::rename(&partial, &final_path).await?;
        let checksum = checksum_file(&final_path, self.stream_chunk_size).await?;
        Ok(FileOutcome::Transferred(TransferRecord::new(file, false, len, Some(checksum))))
    }

    /// Streams the object into `partial`, starting from however much of it is already there.
    async fn fetch_into(&self, file: &FileDescriptor, partial: &Path, creds: Arc<Credentials>) -> Result<()> {
        let offset = file_len(partial).await?.unwrap_or(0);
        if offset > 0 && offset == file.expected_size {
            return Ok(());
        }
        transition(file, if offset > 0 { FileState::Resuming } else { FileState::Starting });

        let locator = creds.source.clone().unwrap_or_else(|| file.locator.clone());
        let mut stream = self.source_store.get_object(&locator, &creds, offset).await?;

        transition(file, FileState::Transferring);
        let out = tokio::fs::OpenOptions::new().create(true).append(true).open(partial).await?;
        let mut writer = BufWriter::with_capacity(self.stream_chunk_size, out);
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    // Keep what arrived so the next attempt resumes after it.
                    writer.flush().await?;
                    return Err(e.into());
                },
            };
            writer.write_all(&chunk).await?;
            self.progress.record_bytes(chunk.len() as u64);
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        Ok(())
    }

    async fn upload(&self, file: &FileDescriptor) -> Result<FileOutcome> {
        let path = self.local_path(file)?;
        let size = tokio::fs::metadata(&path).await?.len();
        if size != file.expected_size {
            return Err(BulkTransferError::IntegrityMismatch(format!(
                "{path:?} is {size} bytes, expected {}",
                file.expected_size
            )));
        }

        let store = self.source_store.as_ref();
        let existing = self
            .broker
            .with_refresh(&file.file_id, |creds| async move {
                let destination = creds.destination.clone().unwrap_or_else(|| file.locator.clone());
                head_if_exists(store, &destination, &creds).await
            })
            .await?;
        if let Some(head) = existing
            && head.size == file.expected_size
        {
            transition(file, FileState::Skipped);
            return Ok(FileOutcome::Skipped(TransferRecord::new(file, true, head.size, head.checksum)));
        }

        transition(file, FileState::Starting);
        let path_ref = &path;
        let checksum = if size > 0 && size >= self.multipart.config().upload_threshold {
            transition(file, FileState::Transferring);
            self.broker
                .with_refresh(&file.file_id, |creds| async move {
                    let destination = creds.destination.clone().unwrap_or_else(|| file.locator.clone());
                    self.multipart
                        .transfer(PartSource::LocalFile(path_ref), size, &destination, &creds)
                        .await
                })
                .await?
                .head
                .checksum
        } else {
            let data = bytes::Bytes::from(tokio::fs::read(&path).await?);
            transition(file, FileState::Transferring);
            let checksum = self
                .broker
                .with_refresh(&file.file_id, |creds| {
                    let data = data.clone();
                    async move {
                        let destination = creds.destination.clone().unwrap_or_else(|| file.locator.clone());
                        Ok(store.put_object(&destination, &creds, data).await?)
                    }
                })
                .await?;
            self.progress.record_bytes(size);
            Some(checksum)
        };

        Ok(FileOutcome::Transferred(TransferRecord::new(file, false, size, checksum)))
    }

    async fn remote_copy(&self, file: &FileDescriptor) -> Result<FileOutcome> {
        let target = self.remote_destination()?;
        let destination = target.prefix.join(&file.alias);
        let dest_creds = &target.credentials;
        let dest_store = self.destination_store.as_ref();

        if let Some(head) = head_if_exists(dest_store, &destination, dest_creds).await?
            && head.size == file.expected_size
        {
            transition(file, FileState::Skipped);
            return Ok(FileOutcome::Skipped(TransferRecord::new(file, true, head.size, head.checksum)));
        }

        transition(file, FileState::Starting);
        let size = file.expected_size;
        let use_multipart = size > 0 && size >= self.multipart.config().copy_threshold;
        let destination_ref = &destination;
        let head = self
            .broker
            .with_refresh(&file.file_id, |creds| async move {
                transition(file, FileState::Transferring);
                let source = creds.source.clone().unwrap_or_else(|| file.locator.clone());
                if use_multipart {
                    let part_source = PartSource::RemoteObject {
                        locator: &source,
                        credentials: &creds,
                    };
                    Ok(self
                        .multipart
                        .transfer(part_source, size, destination_ref, dest_creds)
                        .await?
                        .head)
                } else {
                    Ok(dest_store.copy_object(&source, &creds, destination_ref, dest_creds).await?)
                }
            })
            .await?;

        if head.size != file.expected_size {
            return Err(BulkTransferError::IntegrityMismatch(format!(
                "{destination}: copied {} bytes, expected {}",
                head.size, file.expected_size
            )));
        }
        Ok(FileOutcome::Transferred(TransferRecord::new(file, false, head.size, head.checksum)))
    }

    async fn verify(&self, file: &FileDescriptor) -> Result<FileOutcome> {
        let (what, actual) = match self.direction {
            TransferDirection::Download => {
                let path = self.local_path(file)?;
                (path.display().to_string(), file_len(&path).await?)
            },
            TransferDirection::Upload => {
                let store = self.source_store.as_ref();
                let head = self
                    .broker
                    .with_refresh(&file.file_id, |creds| async move {
                        let destination = creds.destination.clone().unwrap_or_else(|| file.locator.clone());
                        head_if_exists(store, &destination, &creds).await
                    })
                    .await?;
                (file.locator.to_string(), head.map(|h| h.size))
            },
            TransferDirection::RemoteCopy => {
                let target = self.remote_destination()?;
                let destination = target.prefix.join(&file.alias);
                let head = head_if_exists(self.destination_store.as_ref(), &destination, &target.credentials).await?;
                (destination.to_string(), head.map(|h| h.size))
            },
        };

        match actual {
            Some(size) if size == file.expected_size => Ok(FileOutcome::Verified),
            Some(size) => Err(BulkTransferError::IntegrityMismatch(format!(
                "{what} holds {size} bytes, expected {}",
                file.expected_size
            ))),
            None => Err(BulkTransferError::IntegrityMismatch(format!("{what} is missing"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(partial_path(Path::new("/a/b/c.txt")), PathBuf::from("/a/b/c.txt.partial"));
    }

    #[tokio::test]
    async fn test_checksum_file_matches_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();
        assert_eq!(
            checksum_file(&path, 1).await.unwrap(),
            transfer_client::checksum::compute_checksum(&data)
        );
        assert_eq!(file_len(&path).await.unwrap(), Some(100_000));
        assert_eq!(file_len(&dir.path().join("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settled_files_release_their_credentials() {
        use progress_tracking::{NoOpProgressReporter, ProgressUnit};
        use transfer_client::simulation::{MemoryMetadataService, MemoryObjectStore};

        use crate::configurations::MultipartConfig;

        let dir = tempfile::tempdir().unwrap();
        let metadata = MemoryMetadataService::new(10);
        let store = MemoryObjectStore::new();
        let files: Vec<FileDescriptor> = (0..3)
            .map(|i| FileDescriptor {
                file_id: i.to_string(),
                alias: format!("{i}.bin"),
                expected_size: 64,
                locator: ObjectLocator::new("b", format!("{i}.bin")),
            })
            .collect();
        // The first two exist remotely; the third fails with NotFound.
        for file in &files[..2] {
            store.insert_object(file.locator.clone(), vec![7u8; 64]).await;
        }
        for file in &files {
            metadata.add_file("c", &[], file.clone());
        }

        let progress = ProgressTracker::new(ProgressUnit::Bytes, 10, NoOpProgressReporter::new());
        let broker = Arc::new(CredentialBroker::new(metadata, TransferDirection::Download, 10));
        let context = TaskContext {
            direction: TransferDirection::Download,
            mode: TaskMode::Transfer,
            local_root: dir.path().join("out"),
            remote_destination: None,
            source_store: store.clone(),
            destination_store: store.clone(),
            broker: broker.clone(),
            multipart: MultipartUploadManager::new(store.clone(), MultipartConfig::default()),
            progress,
            failures: Arc::new(FailureCollector::new(dir.path().join("retry.txt")).unwrap()),
            ledger: None,
            stream_chunk_size: 16,
        };

        let ids: Vec<String> = files.iter().map(|f| f.file_id.clone()).collect();
        broker.prefetch(&ids).await.unwrap();
        assert_eq!(broker.held_count(), 3);

        for file in &files {
            let result = context.process(file).await;
            assert!(context.report(file, result).await.is_none());
        }
        assert_eq!(broker.held_count(), 0);
        assert_eq!(context.failures.failure_count(), 1);
    }
}
