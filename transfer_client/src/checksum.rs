//! Content checksums shared by every store implementation: lowercase hex SHA-256.

use sha2::{Digest, Sha256};

pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

pub fn compute_checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Incremental variant for data that arrives in chunks.
#[derive(Default)]
pub struct ChecksumBuilder {
    hasher: Sha256,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}
