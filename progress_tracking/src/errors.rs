use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProgressTrackingError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProgressTrackingError>;
