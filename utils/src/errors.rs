use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error, Clone)]
pub enum SingleflightError {
    #[error("Singleflight leader dropped: {0}")]
    LeaderDropped(String),
}
