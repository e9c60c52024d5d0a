use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::checksum::compute_checksum;
use crate::error::{Result, TransferClientError};
use crate::interface::{ByteStream, ObjectStore};
use crate::types::{CompletedPart, Credentials, MultipartSession, ObjectHead, ObjectLocator, PartInfo};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

struct StoredPart {
    data: Bytes,
    checksum: String,
}

struct StoredSession {
    locator: ObjectLocator,
    initiated: u64,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Default)]
struct Faults {
    /// Per locator, the 1-based request numbers that fail with expired credentials.
    expire_on_request: HashMap<ObjectLocator, HashSet<u64>>,
    denied: HashSet<ObjectLocator>,
}

#[derive(Default)]
struct Accounting {
    request_counts: HashMap<ObjectLocator, u64>,
    range_starts: Vec<(ObjectLocator, u64)>,
    uploaded_parts: Vec<(String, u32)>,
    aborted_sessions: Vec<String>,
}

/// Object store held entirely in memory.
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectLocator, Bytes>>,
    sessions: RwLock<HashMap<String, StoredSession>>,
    /// Where server-side copies read from; `None` means this store.
    copy_source: Option<Arc<MemoryObjectStore>>,
    clock: AtomicU64,
    bytes_served: AtomicU64,
    bytes_received: AtomicU64,
    put_count: AtomicU64,
    copy_count: AtomicU64,
    api_delay_ms: AtomicU64,
    faults: Mutex<Faults>,
    accounting: Mutex<Accounting>,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// A store whose server-side copies read from `source`, modeling an external destination.
    pub fn linked_to(source: Arc<MemoryObjectStore>) -> Arc<Self> {
        Arc::new(Self::build(Some(source)))
    }

    fn build(copy_source: Option<Arc<MemoryObjectStore>>) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            copy_source,
            clock: AtomicU64::new(1),
            bytes_served: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            put_count: AtomicU64::new(0),
            copy_count: AtomicU64::new(0),
            api_delay_ms: AtomicU64::new(0),
            faults: Mutex::new(Faults::default()),
            accounting: Mutex::new(Accounting::default()),
        }
    }

    pub async fn insert_object(&self, locator: ObjectLocator, data: impl Into<Bytes>) {
        self.objects.write().await.insert(locator, data.into());
    }

    pub async fn object(&self, locator: &ObjectLocator) -> Option<Bytes> {
        self.objects.read().await.get(locator).cloned()
    }

    pub async fn num_objects(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Opens a session on `locator` already holding `parts`, as a crashed earlier run would
    /// have left it.
    pub async fn seed_session(&self, locator: &ObjectLocator, parts: Vec<(u32, Bytes)>) -> MultipartSession {
        let session = self.open_session(locator).await;
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get_mut(&session.upload_id) {
            for (n, data) in parts {
                let checksum = compute_checksum(&data);
                stored.parts.insert(n, StoredPart { data, checksum });
            }
        }
        session
    }

    pub async fn open_sessions(&self, locator: &ObjectLocator) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<_> = sessions
            .iter()
            .filter(|(_, s)| &s.locator == locator)
            .map(|(id, s)| (s.initiated, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// The `nth` request (1-based, counted per locator) touching `locator` fails as if its
    /// credentials had expired.
    pub fn inject_expiry(&self, locator: &ObjectLocator, nth: u64) {
        self.faults()
            .expire_on_request
            .entry(locator.clone())
            .or_default()
            .insert(nth);
    }

    /// Every request touching `locator` is denied.
    pub fn deny(&self, locator: &ObjectLocator) {
        self.faults().denied.insert(locator.clone());
    }

    pub fn set_api_delay(&self, delay: Duration) {
        self.api_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> u64 {
        self.put_count.load(Ordering::Relaxed)
    }

    pub fn copy_count(&self) -> u64 {
        self.copy_count.load(Ordering::Relaxed)
    }

    pub fn range_starts(&self) -> Vec<(ObjectLocator, u64)> {
        self.accounting().range_starts.clone()
    }

    /// (upload id, part number) for every part written, in order.
    pub fn uploaded_parts(&self) -> Vec<(String, u32)> {
        self.accounting().uploaded_parts.clone()
    }

    pub fn aborted_sessions(&self) -> Vec<String> {
        self.accounting().aborted_sessions.clone()
    }

    pub fn request_count(&self, locator: &ObjectLocator) -> u64 {
        self.accounting().request_counts.get(locator).copied().unwrap_or(0)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accounting(&self) -> std::sync::MutexGuard<'_, Accounting> {
        self.accounting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the request and applies any injected fault for it.
    async fn admit(&self, locator: &ObjectLocator, operation: &str) -> Result<()> {
        let delay = self.api_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let n = {
            let mut acct = self.accounting();
            let count = acct.request_counts.entry(locator.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let faults = self.faults();
        if faults.denied.contains(locator) {
            return Err(TransferClientError::Forbidden(format!("{operation} {locator}: AccessDenied")));
        }
        if faults.expire_on_request.get(locator).is_some_and(|s| s.contains(&n)) {
            info!(%locator, request = n, "injected credential expiry");
            return Err(TransferClientError::ExpiredCredential(format!("{operation} {locator}: ExpiredToken")));
        }
        Ok(())
    }

    async fn open_session(&self, locator: &ObjectLocator) -> MultipartSession {
        let initiated = self.clock.fetch_add(1, Ordering::Relaxed);
        let upload_id = format!("upload-{initiated}");
        self.sessions.write().await.insert(
            upload_id.clone(),
            StoredSession {
                locator: locator.clone(),
                initiated,
                parts: BTreeMap::new(),
            },
        );
        MultipartSession {
            upload_id,
            locator: locator.clone(),
            initiated,
        }
    }

    async fn store_part(&self, session: &MultipartSession, part_number: u32, data: Bytes) -> Result<PartInfo> {
        if part_number == 0 {
            return Err(TransferClientError::Other("part numbers start at 1".to_owned()));
        }
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| TransferClientError::NotFound(format!("upload {}", session.upload_id)))?;
        let info = PartInfo {
            part_number,
            size: data.len() as u64,
            checksum: compute_checksum(&data),
        };
        stored.parts.insert(
            part_number,
            StoredPart {
                data,
                checksum: info.checksum.clone(),
            },
        );
        self.accounting().uploaded_parts.push((session.upload_id.clone(), part_number));
        Ok(info)
    }

    async fn read_copy_source(&self, source: &ObjectLocator) -> Result<Bytes> {
        let store = self.copy_source.as_deref().unwrap_or(self);
        store.admit(source, "COPY SOURCE").await?;
        let data = store
            .object(source)
            .await
            .ok_or_else(|| TransferClientError::NotFound(source.to_string()))?;
        store.bytes_served.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_object(&self, locator: &ObjectLocator, _creds: &Credentials) -> Result<ObjectHead> {
        self.admit(locator, "HEAD").await?;
        let objects = self.objects.read().await;
        let data = objects
            .get(locator)
            .ok_or_else(|| TransferClientError::NotFound(locator.to_string()))?;
        Ok(ObjectHead {
            size: data.len() as u64,
            checksum: Some(compute_checksum(data)),
        })
    }

    async fn get_object(&self, locator: &ObjectLocator, _creds: &Credentials, offset: u64) -> Result<ByteStream> {
        self.admit(locator, "GET").await?;
        let data = self
            .object(locator)
            .await
            .ok_or_else(|| TransferClientError::NotFound(locator.to_string()))?;
        if offset > data.len() as u64 {
            return Err(TransferClientError::Other(format!(
                "GET {locator}: range start {offset} beyond object size {}",
                data.len()
            )));
        }
        self.accounting().range_starts.push((locator.clone(), offset));

        let remainder = data.slice(offset as usize..);
        self.bytes_served.fetch_add(remainder.len() as u64, Ordering::Relaxed);
        debug!(%locator, offset, n_bytes = remainder.len(), "serving object");

        let chunks: Vec<Result<Bytes>> = (0..remainder.len())
            .step_by(STREAM_CHUNK_SIZE)
            .map(|start| Ok(remainder.slice(start..(start + STREAM_CHUNK_SIZE).min(remainder.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn put_object(&self, locator: &ObjectLocator, _creds: &Credentials, data: Bytes) -> Result<String> {
        self.admit(locator, "PUT").await?;
        let checksum = compute_checksum(&data);
        self.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.put_count.fetch_add(1, Ordering::Relaxed);
        self.objects.write().await.insert(locator.clone(), data);
        Ok(checksum)
    }

    async fn copy_object(
        &self,
        source: &ObjectLocator,
        _source_creds: &Credentials,
        destination: &ObjectLocator,
        _creds: &Credentials,
    ) -> Result<ObjectHead> {
        self.admit(destination, "COPY").await?;
        let data = self.read_copy_source(source).await?;
        let head = ObjectHead {
            size: data.len() as u64,
            checksum: Some(compute_checksum(&data)),
        };
        self.copy_count.fetch_add(1, Ordering::Relaxed);
        self.objects.write().await.insert(destination.clone(), data);
        Ok(head)
    }

    async fn create_multipart_session(&self, locator: &ObjectLocator, _creds: &Credentials) -> Result<MultipartSession> {
        self.admit(locator, "CREATE SESSION").await?;
        Ok(self.open_session(locator).await)
    }

    async fn list_multipart_sessions(
        &self,
        locator: &ObjectLocator,
        _creds: &Credentials,
    ) -> Result<Vec<MultipartSession>> {
        self.admit(locator, "LIST SESSIONS").await?;
        let sessions = self.sessions.read().await;
        let mut open: Vec<_> = sessions
            .iter()
            .filter(|(_, s)| &s.locator == locator)
            .map(|(id, s)| MultipartSession {
                upload_id: id.clone(),
                locator: s.locator.clone(),
                initiated: s.initiated,
            })
            .collect();
        open.sort_by_key(|s| s.initiated);
        Ok(open)
    }

    async fn list_parts(&self, session: &MultipartSession, _creds: &Credentials) -> Result<Vec<PartInfo>> {
        self.admit(&session.locator, "LIST PARTS").await?;
        let sessions = self.sessions.read().await;
        let stored = sessions
            .get(&session.upload_id)
            .ok_or_else(|| TransferClientError::NotFound(format!("upload {}", session.upload_id)))?;
        Ok(stored
            .parts
            .iter()
            .map(|(n, p)| PartInfo {
                part_number: *n,
                size: p.data.len() as u64,
                checksum: p.checksum.clone(),
            })
            .collect())
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        data: Bytes,
        _creds: &Credentials,
    ) -> Result<PartInfo> {
        self.admit(&session.locator, "UPLOAD PART").await?;
        self.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.store_part(session, part_number, data).await
    }

    async fn upload_part_copy(
        &self,
        session: &MultipartSession,
        part_number: u32,
        source: &ObjectLocator,
        _source_creds: &Credentials,
        range: Range<u64>,
        _creds: &Credentials,
    ) -> Result<PartInfo> {
        self.admit(&session.locator, "COPY PART").await?;
        let data = self.read_copy_source(source).await?;
        if range.is_empty() || range.end > data.len() as u64 {
            return Err(TransferClientError::Other(format!(
                "COPY PART {part_number}: invalid range {range:?} of {source} ({} bytes)",
                data.len()
            )));
        }
        self.store_part(session, part_number, data.slice(range.start as usize..range.end as usize))
            .await
    }

    async fn complete_multipart_session(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
        _creds: &Credentials,
    ) -> Result<ObjectHead> {
        self.admit(&session.locator, "COMPLETE").await?;
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get(&session.upload_id)
            .ok_or_else(|| TransferClientError::NotFound(format!("upload {}", session.upload_id)))?;

        let mut assembled = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if part.part_number as usize != i + 1 {
                return Err(TransferClientError::Other(format!(
                    "COMPLETE {}: parts must be contiguous from 1, got {} at position {i}",
                    session.locator, part.part_number
                )));
            }
            let held = stored.parts.get(&part.part_number).ok_or_else(|| {
                TransferClientError::Other(format!("COMPLETE {}: part {} missing", session.locator, part.part_number))
            })?;
            if held.checksum != part.checksum {
                return Err(TransferClientError::Other(format!(
                    "COMPLETE {}: checksum mismatch on part {}",
                    session.locator, part.part_number
                )));
            }
            assembled.extend_from_slice(&held.data);
        }

        sessions.remove(&session.upload_id);
        drop(sessions);

        let data = Bytes::from(assembled);
        let head = ObjectHead {
            size: data.len() as u64,
            checksum: Some(compute_checksum(&data)),
        };
        self.objects.write().await.insert(session.locator.clone(), data);
        Ok(head)
    }

    async fn abort_multipart_session(&self, session: &MultipartSession, _creds: &Credentials) -> Result<()> {
        self.admit(&session.locator, "ABORT").await?;
        if self.sessions.write().await.remove(&session.upload_id).is_none() {
            return Err(TransferClientError::NotFound(format!("upload {}", session.upload_id)));
        }
        self.accounting().aborted_sessions.push(session.upload_id.clone());
        Ok(())
    }
}
