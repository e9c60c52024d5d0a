use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use progress_tracking::ProgressTracker;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};
use transfer_client::checksum::compute_checksum;
use transfer_client::{
    CompletedPart, Credentials, MultipartSession, ObjectHead, ObjectLocator, ObjectStore, PartInfo,
};

use crate::configurations::MultipartConfig;
use crate::errors::{BulkTransferError, Result};

/// `ceil(object_size / (max_parts - 1))`, never less than one byte.
pub fn compute_chunk_size(object_size: u64, max_parts: u64) -> u64 {
    let divisor = max_parts.saturating_sub(1).max(1);
    object_size.div_ceil(divisor).max(1)
}

/// How an object is split into parts. All parts are `chunk_size` long except possibly the last.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartLayout {
    pub object_size: u64,
    pub chunk_size: u64,
    pub total_parts: u32,
}

impl PartLayout {
    /// The default layout: computed chunk size raised to the minimum part size, or a single
    /// part when the object fits in one chunk.
    pub fn plan(object_size: u64, config: &MultipartConfig) -> Self {
        let chunk_size = compute_chunk_size(object_size, config.max_parts).max(config.min_part_size);
        Self::with_chunk_size(object_size, chunk_size)
    }

    pub fn with_chunk_size(object_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        if chunk_size >= object_size {
            return Self {
                object_size,
                chunk_size: object_size,
                total_parts: 1,
            };
        }
        let total_parts = object_size.div_ceil(chunk_size);
        Self {
            object_size,
            chunk_size,
            total_parts: u32::try_from(total_parts).unwrap_or(u32::MAX),
        }
    }

    /// Byte range of the 1-based `part_number`.
    pub fn part_range(&self, part_number: u32) -> Range<u64> {
        let start = (part_number.saturating_sub(1) as u64).saturating_mul(self.chunk_size);
        let end = start.saturating_add(self.chunk_size).min(self.object_size);
        start.min(end)..end
    }
}

/// Where part data comes from.
#[derive(Clone, Copy, Debug)]
pub enum PartSource<'a> {
    /// Parts are read from a local file and uploaded.
    LocalFile(&'a Path),
    /// Parts are copied server-side from an object in the managed store.
    RemoteObject {
        locator: &'a ObjectLocator,
        credentials: &'a Credentials,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartOutcome {
    pub upload_id: String,
    pub head: ObjectHead,
    pub layout: PartLayout,
    pub parts_uploaded: u32,
    pub parts_reused: u32,
}

/// Drives resumable multipart sessions.
///
/// Open sessions for the destination are resumed. Parts already held are verified against the
/// source rather than re-sent: by checksum of the local byte range for uploads and by size for
/// server-side copies. A mismatch fails the file with an integrity error. If completion fails
/// the session stays open so the next run can pick it up.
pub struct MultipartUploadManager {
    store: Arc<dyn ObjectStore>,
    config: MultipartConfig,
    progress: Option<Arc<ProgressTracker>>,
}

impl MultipartUploadManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: MultipartConfig) -> Self {
        Self {
            store,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    #[instrument(skip_all, fields(destination = %destination, object_size))]
    pub async fn transfer(
        &self,
        source: PartSource<'_>,
        object_size: u64,
        destination: &ObjectLocator,
        creds: &Credentials,
    ) -> Result<MultipartOutcome> {
        let (session, existing) = self.resolve_session(destination, creds).await?;
        let (layout, existing) = self.resume_layout(object_size, existing);
        if layout.total_parts as u64 > self.config.max_parts {
            return Err(BulkTransferError::InternalError(format!(
                "{destination}: {} parts exceed the ceiling of {}",
                layout.total_parts, self.config.max_parts
            )));
        }
        debug!(
            upload_id = session.upload_id.as_str(),
            chunk_size = layout.chunk_size,
            total_parts = layout.total_parts,
            existing_parts = existing.len(),
            "multipart layout"
        );

        let mut completed = Vec::with_capacity(layout.total_parts as usize);
        let mut parts_uploaded = 0;
        let mut parts_reused = 0;
        for part_number in 1..=layout.total_parts {
            let range = layout.part_range(part_number);
            let part = match existing.get(&part_number) {
                Some(held) => {
                    self.verify_existing(source, held, &range, destination).await?;
                    parts_reused += 1;
                    held.clone()
                },
                None => {
                    let part = self.send_part(source, &session, part_number, range.clone(), creds).await?;
                    if let Some(p) = &self.progress {
                        p.record_bytes(range.end - range.start);
                    }
                    parts_uploaded += 1;
                    part
                },
            };
            completed.push(CompletedPart::from(&part));
        }

        let head = self
            .store
            .complete_multipart_session(&session, &completed, creds)
            .await
            .inspect_err(|e| {
                warn!(upload_id = session.upload_id.as_str(), "completion failed, session left open: {e}")
            })?;
        info!(upload_id = session.upload_id.as_str(), parts_uploaded, parts_reused, "multipart session complete");

        Ok(MultipartOutcome {
            upload_id: session.upload_id,
            head,
            layout,
            parts_uploaded,
            parts_reused,
        })
    }

    /// Picks the session to continue. With several open sessions for the same key, the one with
    /// the most parts (newest on a tie) is kept and the others are aborted.
    async fn resolve_session(
        &self,
        destination: &ObjectLocator,
        creds: &Credentials,
    ) -> Result<(MultipartSession, Vec<PartInfo>)> {
        let sessions = self.store.list_multipart_sessions(destination, creds).await?;
        if sessions.is_empty() {
            let session = self.store.create_multipart_session(destination, creds).await?;
            return Ok((session, Vec::new()));
        }

        let mut candidates = Vec::with_capacity(sessions.len());
        for session in sessions {
            let parts = self.store.list_parts(&session, creds).await?;
            candidates.push((session, parts));
        }
        candidates.sort_by_key(|(s, p)| (p.len(), s.initiated));
        let Some((keep, parts)) = candidates.pop() else {
            return Err(BulkTransferError::InternalError(format!("{destination}: no session to resume")));
        };

        for (orphan, _) in candidates {
            warn!(upload_id = orphan.upload_id.as_str(), kept = keep.upload_id.as_str(), "aborting duplicate session");
            if let Err(e) = self.store.abort_multipart_session(&orphan, creds).await {
                warn!(upload_id = orphan.upload_id.as_str(), "could not abort duplicate session: {e}");
            }
        }
        info!(upload_id = keep.upload_id.as_str(), existing_parts = parts.len(), "resuming multipart session");
        Ok((keep, parts))
    }

    /// Chooses the layout given the parts already held.
    ///
    /// No parts: the default layout. Exactly one part: its size says nothing reliable about the
    /// chunk size, so it is discarded and the session restarts from part 1. More than one: the
    /// first part's size is the chunk size.
    fn resume_layout(&self, object_size: u64, existing: Vec<PartInfo>) -> (PartLayout, HashMap<u32, PartInfo>) {
        let default = || (PartLayout::plan(object_size, &self.config), HashMap::new());
        match existing.len() {
            0 => default(),
            1 => {
                info!("discarding the single existing part and restarting from part 1");
                default()
            },
            _ => {
                let Some(first) = existing.iter().min_by_key(|p| p.part_number) else {
                    return default();
                };
                let layout = PartLayout::with_chunk_size(object_size, first.size);
                if layout.total_parts as u64 > self.config.max_parts {
                    warn!(chunk_size = first.size, "existing parts imply too many parts; restarting");
                    return default();
                }
                let held = existing
                    .into_iter()
                    .filter(|p| p.part_number >= 1 && p.part_number <= layout.total_parts)
                    .map(|p| (p.part_number, p))
                    .collect();
                (layout, held)
            },
        }
    }

    async fn verify_existing(
        &self,
        source: PartSource<'_>,
        held: &PartInfo,
        range: &Range<u64>,
        destination: &ObjectLocator,
    ) -> Result<()> {
        let expected_len = range.end - range.start;
        if held.size != expected_len {
            return Err(BulkTransferError::IntegrityMismatch(format!(
                "{destination}: part {} holds {} bytes, expected {expected_len}",
                held.part_number, held.size
            )));
        }
        if let PartSource::LocalFile(path) = source {
            let data = read_range(path, range.clone()).await?;
            if compute_checksum(&data) != held.checksum {
                return Err(BulkTransferError::IntegrityMismatch(format!(
                    "{destination}: part {} no longer matches {path:?}",
                    held.part_number
                )));
            }
        }
        debug!(part_number = held.part_number, "existing part verified");
        Ok(())
    }

    async fn send_part(
        &self,
        source: PartSource<'_>,
        session: &MultipartSession,
        part_number: u32,
        range: Range<u64>,
        creds: &Credentials,
    ) -> Result<PartInfo> {
        let part = match source {
            PartSource::LocalFile(path) => {
                let data = read_range(path, range).await?;
                self.store.upload_part(session, part_number, data, creds).await?
            },
            PartSource::RemoteObject { locator, credentials } => {
                self.store
                    .upload_part_copy(session, part_number, locator, credentials, range, creds)
                    .await?
            },
        };
        Ok(part)
    }
}

/// Reads `range` of the file at `path`.
pub async fn read_range(path: &Path, range: Range<u64>) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
