#![cfg_attr(feature = "strict", deny(warnings))]

pub mod configurations;
pub mod constants;
pub mod credentials;
pub mod engine;
pub mod enumerator;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod multipart;
pub mod transfer_task;
pub mod worker_pool;

pub use configurations::{MultipartConfig, RemoteDestination, TransferConfig};
pub use credentials::CredentialBroker;
pub use engine::{TransferEngine, TransferSummary};
pub use enumerator::{BatchEnumerator, EnumerationStats};
pub use errors::{BulkTransferError, Result};
pub use ledger::{JobIdentity, JobLedger, LedgerWriter, TransferRecord};
pub use multipart::{MultipartOutcome, MultipartUploadManager, PartLayout, PartSource, compute_chunk_size};
pub use transfer_task::{FileOutcome, FileState, TaskContext, TaskMode};
pub use worker_pool::TransferWorkerPool;
