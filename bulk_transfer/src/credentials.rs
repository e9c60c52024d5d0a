use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use error_printer::OptionPrinter;
use tracing::{debug, info, warn};
use transfer_client::{Credentials, FailureKind, MetadataService, TransferClientError, TransferDirection};
use utils::SingleFlight;

use crate::constants::CREDENTIAL_REFRESH_RETRIES;
use crate::errors::{BulkTransferError, Result};

type RefreshResult = std::result::Result<Arc<Credentials>, (FailureKind, String)>;

/// Obtains and caches short-lived credentials per file id.
///
/// Credentials are replaced wholesale on refresh. Concurrent refreshes of the same file id
/// share one request to the issuing service, and a refresh is skipped when the cached entry
/// has already moved past the credentials the caller saw fail. Ids the service leaves out
/// of a response are remembered as denied, and entries are released once their file settles.
pub struct CredentialBroker {
    metadata: Arc<dyn MetadataService>,
    direction: TransferDirection,
    max_ids_per_request: usize,
    cache: RwLock<HashMap<String, Arc<Credentials>>>,
    denied: RwLock<HashSet<String>>,
    refresh_group: SingleFlight<RefreshResult>,
    refresh_count: AtomicU64,
}

/// Maps issuing-service errors: an unreachable service ends the run, anything else is passed on.
fn issue_error(e: TransferClientError) -> BulkTransferError {
    if e.is_unreachable() {
        BulkTransferError::InfrastructureUnresponsive(format!("credential service: {e}"))
    } else {
        e.into()
    }
}

impl CredentialBroker {
    pub fn new(metadata: Arc<dyn MetadataService>, direction: TransferDirection, max_ids_per_request: usize) -> Self {
        Self {
            metadata,
            direction,
            max_ids_per_request: max_ids_per_request.max(1),
            cache: RwLock::new(HashMap::new()),
            denied: RwLock::new(HashSet::new()),
            refresh_group: SingleFlight::new(),
            refresh_count: AtomicU64::new(0),
        }
    }

    /// Requests credentials for `file_ids`, split into calls of at most the per-call ceiling,
    /// and caches the results.
    pub async fn request(&self, file_ids: &[String]) -> Result<HashMap<String, Arc<Credentials>>> {
        let mut issued = HashMap::with_capacity(file_ids.len());
        for chunk in file_ids.chunks(self.max_ids_per_request) {
            debug!(n_ids = chunk.len(), direction = %self.direction, "requesting credentials");
            let creds = self
                .metadata
                .issue_credentials(chunk, self.direction)
                .await
                .map_err(issue_error)?;
            issued.extend(creds.into_iter().map(|(id, c)| (id, Arc::new(c))));
        }

        let withheld: Vec<&String> = file_ids.iter().filter(|id| !issued.contains_key(*id)).collect();
        if !withheld.is_empty() {
            warn!(n_ids = withheld.len(), "credential service withheld credentials for some files");
            let mut denied = self.denied.write().unwrap_or_else(PoisonError::into_inner);
            denied.extend(withheld.into_iter().cloned());
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        for (id, c) in &issued {
            cache.insert(id.clone(), c.clone());
        }
        Ok(issued)
    }

    /// Fetches credentials for the ids neither cached nor already denied.
    pub async fn prefetch(&self, file_ids: &[String]) -> Result<()> {
        let missing: Vec<String> = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            let denied = self.denied.read().unwrap_or_else(PoisonError::into_inner);
            file_ids
                .iter()
                .filter(|id| !cache.contains_key(*id) && !denied.contains(*id))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            self.request(&missing).await?;
        }
        Ok(())
    }

    fn cached(&self, file_id: &str) -> Option<Arc<Credentials>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).get(file_id).cloned()
    }

    fn is_denied(&self, file_id: &str) -> bool {
        self.denied.read().unwrap_or_else(PoisonError::into_inner).contains(file_id)
    }

    /// Cached credentials, or a single-id request on a miss. An id the service already
    /// withheld fails as forbidden without asking again.
    pub async fn credentials_for(&self, file_id: &str) -> Result<Arc<Credentials>> {
        if let Some(c) = self.cached(file_id) {
            return Ok(c);
        }
        if self.is_denied(file_id) {
            return Err(BulkTransferError::MissingCredentials(file_id.to_owned()));
        }
        self.request(&[file_id.to_owned()])
            .await?
            .remove(file_id)
            .warn_none(format!("credential service issued nothing for file {file_id}"))
            .ok_or_else(|| BulkTransferError::MissingCredentials(file_id.to_owned()))
    }

    /// Replaces `stale` with freshly issued credentials, unless another task already did.
    pub async fn refresh(&self, file_id: &str, stale: &Arc<Credentials>) -> Result<Arc<Credentials>> {
        if let Some(current) = self.cached(file_id)
            && !Arc::ptr_eq(&current, stale)
        {
            return Ok(current);
        }

        let outcome = self
            .refresh_group
            .run(file_id, || self.issue_fresh(file_id, stale))
            .await
            .map_err(|e| BulkTransferError::InternalError(e.to_string()))?;

        outcome.map_err(|(kind, msg)| match kind {
            FailureKind::InfrastructureUnresponsive => BulkTransferError::InfrastructureUnresponsive(msg),
            _ => BulkTransferError::MissingCredentials(msg),
        })
    }

    /// The body of a refresh flight.
    async fn issue_fresh(&self, file_id: &str, stale: &Arc<Credentials>) -> RefreshResult {
        // A previous flight may have finished between the caller's check and this one starting.
        if let Some(current) = self.cached(file_id)
            && !Arc::ptr_eq(&current, stale)
        {
            return Ok(current);
        }
        let ids = [file_id.to_owned()];
        let mut issued = match self.metadata.issue_credentials(&ids, self.direction).await {
            Ok(issued) => issued,
            Err(e) => {
                let e = issue_error(e);
                return Err((e.kind(), e.to_string()));
            },
        };
        let Some(fresh) = issued.remove(file_id) else {
            return Err((FailureKind::Forbidden, file_id.to_owned()));
        };
        let fresh = Arc::new(fresh);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_id.to_owned(), fresh.clone());
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
        info!(file_id, "refreshed expired credentials");
        Ok(fresh)
    }

    /// Runs `op` with the credentials for `file_id`. If it fails because the credentials
    /// expired, they are refreshed and `op` is retried; a second expiry is a hard failure.
    pub async fn with_refresh<T, F, Fut>(&self, file_id: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<Credentials>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = *CREDENTIAL_REFRESH_RETRIES;
        let mut creds = self.credentials_for(file_id).await?;
        let mut attempt = 0;
        loop {
            match op(creds.clone()).await {
                Err(e) if e.kind() == FailureKind::ExpiredCredential && attempt < max_retries => {
                    attempt += 1;
                    warn!(file_id, attempt, "credentials expired; refreshing and retrying");
                    creds = self.refresh(file_id, &creds).await?;
                },
                result => return result,
            }
        }
    }

    /// Forgets everything held for a file that has settled.
    pub fn release(&self, file_id: &str) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).remove(file_id);
        self.denied.write().unwrap_or_else(PoisonError::into_inner).remove(file_id);
    }

    /// Number of file ids with credentials or a denial currently held.
    pub fn held_count(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
            + self.denied.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of refreshes that actually reached the issuing service.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Relaxed)
    }
}
