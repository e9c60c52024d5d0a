use std::fmt;

use thiserror::Error;
use tokio::task::JoinError;

/// How a failure affects the run. Everything except `InfrastructureUnresponsive` is isolated to
/// the file it happened on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// The remote object does not exist.
    NotFound,
    /// The scoped credentials expired; refresh and retry once.
    ExpiredCredential,
    /// A genuine permission or bucket-policy denial.
    Forbidden,
    /// The credential-issuing service cannot be reached at all. Aborts the run.
    InfrastructureUnresponsive,
    /// Previously uploaded data no longer matches the local file.
    IntegrityMismatch,
    /// Local permission, disk full, rename failure and the like.
    LocalIo,
    /// Anything else the remote side rejected.
    Other,
}

impl FailureKind {
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, FailureKind::InfrastructureUnresponsive)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NotFound => "NotFound",
            FailureKind::ExpiredCredential => "ExpiredCredential",
            FailureKind::Forbidden => "Forbidden",
            FailureKind::InfrastructureUnresponsive => "InfrastructureUnresponsive",
            FailureKind::IntegrityMismatch => "IntegrityMismatch",
            FailureKind::LocalIo => "LocalIo",
            FailureKind::Other => "Other",
        };
        f.write_str(s)
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransferClientError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Credentials expired: {0}")]
    ExpiredCredential(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid response from service: {0}")]
    InvalidResponse(String),

    #[error("Configuration Error: {0}")]
    ConfigurationError(String),

    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Parse Error: {0}")]
    ParseError(#[from] url::ParseError),

    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("ReqwestMiddleware Error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),

    #[error("Reqwest Error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] JoinError),

    #[error("Error : {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransferClientError>;

impl TransferClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferClientError::NotFound(_) => FailureKind::NotFound,
            TransferClientError::ExpiredCredential(_) => FailureKind::ExpiredCredential,
            TransferClientError::Forbidden(_) => FailureKind::Forbidden,
            TransferClientError::IOError(_) => FailureKind::LocalIo,
            _ => FailureKind::Other,
        }
    }

    /// True when the service could not be reached or kept failing after transport-level retries.
    pub fn is_unreachable(&self) -> bool {
        match self {
            TransferClientError::ServiceUnavailable(_) => true,
            TransferClientError::ReqwestError(e) => e.is_connect() || e.is_timeout(),
            TransferClientError::ReqwestMiddlewareError(reqwest_middleware::Error::Reqwest(e)) => {
                e.is_connect() || e.is_timeout()
            },
            _ => false,
        }
    }
}

/// Markers in a 401/403 body that mean the signature or token expired rather than that access
/// is genuinely denied.
const EXPIRED_CREDENTIAL_MARKERS: &[&str] = &[
    "expiredtoken",
    "tokenrefreshrequired",
    "request has expired",
    "invalidtoken",
    "signature expired",
];

/// Classifies a 401/403 response by inspecting its body.
pub fn classify_denied(context: &str, body: &str) -> TransferClientError {
    let lowered = body.to_ascii_lowercase();
    if EXPIRED_CREDENTIAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        TransferClientError::ExpiredCredential(format!("{context}: {body}"))
    } else {
        TransferClientError::Forbidden(format!("{context}: {body}"))
    }
}
