use progress_tracking::ProgressTrackingError;
use thiserror::Error;
use tokio::task::JoinError;
use transfer_client::{FailureKind, TransferClientError};

#[derive(Error, Debug)]
pub enum BulkTransferError {
    #[error("Transfer client error: {0}")]
    TransferClientError(#[from] TransferClientError),

    #[error("Progress tracking error: {0}")]
    ProgressTrackingError(#[from] ProgressTrackingError),

    #[error("Infrastructure unresponsive: {0}")]
    InfrastructureUnresponsive(String),

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("No credentials issued for file {0}")]
    MissingCredentials(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Ledger error: {0}")]
    LedgerError(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Invalid name filter: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] JoinError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, BulkTransferError>;

impl BulkTransferError {
    /// How this error is reported for the file it happened on.
    pub fn kind(&self) -> FailureKind {
        match self {
            BulkTransferError::TransferClientError(e) => e.kind(),
            BulkTransferError::InfrastructureUnresponsive(_) => FailureKind::InfrastructureUnresponsive,
            BulkTransferError::IntegrityMismatch(_) => FailureKind::IntegrityMismatch,
            BulkTransferError::MissingCredentials(_) => FailureKind::Forbidden,
            BulkTransferError::IOError(_) | BulkTransferError::CsvError(_) | BulkTransferError::LedgerError(_) => {
                FailureKind::LocalIo
            },
            BulkTransferError::ProgressTrackingError(ProgressTrackingError::IoError(_)) => FailureKind::LocalIo,
            _ => FailureKind::Other,
        }
    }

    pub fn is_fatal_for_run(&self) -> bool {
        self.kind().is_fatal_for_run()
    }
}
