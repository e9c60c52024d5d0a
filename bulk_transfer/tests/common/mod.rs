#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bulk_transfer::{TransferConfig, TransferEngine, TransferRecord};
use progress_tracking::NoOpProgressReporter;
use tempfile::TempDir;
use transfer_client::simulation::{MemoryMetadataService, MemoryObjectStore};
use transfer_client::{FileDescriptor, FileSelection, ObjectLocator, TransferDirection};

pub const COLLECTION: &str = "collection-1";
pub const BUCKET: &str = "managed";

/// Deterministic contents for file `i`.
pub fn payload(i: usize, size: usize) -> Vec<u8> {
    (0..size).map(|b| ((b + i * 7) % 251) as u8).collect()
}

pub fn descriptor(i: usize, size: u64) -> FileDescriptor {
    let alias = format!("data/part_{}/file_{i:04}.bin", i % 3);
    FileDescriptor {
        file_id: (1000 + i).to_string(),
        locator: ObjectLocator::new(BUCKET, alias.clone()),
        alias,
        expected_size: size,
    }
}

/// A managed store and metadata service plus scratch directories for one test.
pub struct Fixture {
    pub metadata: Arc<MemoryMetadataService>,
    pub store: Arc<MemoryObjectStore>,
    pub files: Vec<FileDescriptor>,
    pub local: TempDir,
    pub ledger: TempDir,
}

impl Fixture {
    pub fn empty() -> Self {
        Self {
            metadata: MemoryMetadataService::new(37),
            store: MemoryObjectStore::new(),
            files: Vec::new(),
            local: tempfile::tempdir().unwrap(),
            ledger: tempfile::tempdir().unwrap(),
        }
    }

    /// `n` files of the given sizes, present in the store and the catalog.
    pub async fn with_remote_files(n: usize, size_of: impl Fn(usize) -> usize) -> Self {
        let mut fx = Self::empty();
        for i in 0..n {
            let size = size_of(i);
            let file = descriptor(i, size as u64);
            fx.store.insert_object(file.locator.clone(), payload(i, size)).await;
            fx.metadata.add_file(COLLECTION, &[], file.clone());
            fx.files.push(file);
        }
        fx
    }

    /// `n` files present only in the local directory and the catalog.
    pub async fn with_local_files(n: usize, size_of: impl Fn(usize) -> usize) -> Self {
        let mut fx = Self::empty();
        for i in 0..n {
            let size = size_of(i);
            let file = descriptor(i, size as u64);
            let path = fx.local_path(&file);
            tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            tokio::fs::write(&path, payload(i, size)).await.unwrap();
            fx.metadata.add_file(COLLECTION, &[], file.clone());
            fx.files.push(file);
        }
        fx
    }

    pub fn local_path(&self, file: &FileDescriptor) -> PathBuf {
        self.local.path().join(&file.alias)
    }

    pub fn config(&self, direction: TransferDirection) -> TransferConfig {
        TransferConfig::new(direction, self.local.path(), FileSelection::Collection(COLLECTION.to_owned()))
            .with_ledger_dir(self.ledger.path())
            .with_num_workers(4)
            .with_batch_size(50)
            .with_stream_chunk_size(16 * 1024)
            .with_report_interval(10)
    }

    pub fn engine(&self, config: TransferConfig) -> TransferEngine {
        TransferEngine::new(config, self.metadata.clone(), self.store.clone())
            .with_progress_reporter(NoOpProgressReporter::new())
    }
}

/// Every row of a job's progress report.
pub fn ledger_rows(ledger_dir: &Path, job_id: &str) -> Vec<TransferRecord> {
    let path = ledger_dir.join(format!("{job_id}_progress_report.csv"));
    if !path.exists() {
        return Vec::new();
    }
    csv::Reader::from_path(path)
        .unwrap()
        .deserialize::<TransferRecord>()
        .map(|r| r.unwrap())
        .collect()
}

pub fn manifest_lines(path: &Path) -> Vec<String> {
    progress_tracking::read_manifest(path).unwrap()
}
