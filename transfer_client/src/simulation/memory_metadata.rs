use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Result, TransferClientError};
use crate::interface::MetadataService;
use crate::types::{Credentials, FileDescriptor, FileSelection, ListingPage, TransferDirection};

struct CatalogEntry {
    collection: String,
    subsets: Vec<String>,
    descriptor: FileDescriptor,
}

/// The session token the memory service hands out for the `generation`-th issue (1-based) of
/// credentials for `file_id`.
pub fn session_token_for(file_id: &str, generation: u64) -> String {
    format!("token-{file_id}-{generation}")
}

/// Metadata service over an in-memory catalog.
pub struct MemoryMetadataService {
    catalog: RwLock<Vec<CatalogEntry>>,
    page_size: usize,
    unresponsive: AtomicBool,
    /// Number of ids in each `issue_credentials` call, in call order.
    issue_calls: Mutex<Vec<usize>>,
    generations: Mutex<HashMap<String, u64>>,
    withheld: Mutex<HashSet<String>>,
}

impl MemoryMetadataService {
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            catalog: RwLock::new(Vec::new()),
            page_size: page_size.max(1),
            unresponsive: AtomicBool::new(false),
            issue_calls: Mutex::new(Vec::new()),
            generations: Mutex::new(HashMap::new()),
            withheld: Mutex::new(HashSet::new()),
        })
    }

    pub fn add_file(&self, collection: &str, subsets: &[&str], descriptor: FileDescriptor) {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CatalogEntry {
                collection: collection.to_owned(),
                subsets: subsets.iter().map(|s| s.to_string()).collect(),
                descriptor,
            });
    }

    /// While set, every call fails as if the service could not be reached.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Leaves `file_id` out of every credential response, as for a file the caller may not access.
    pub fn withhold(&self, file_id: &str) {
        self.withheld
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_id.to_owned());
    }

    pub fn issue_calls(&self) -> Vec<usize> {
        self.issue_calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// How many times credentials were issued for `file_id`.
    pub fn issued_count(&self, file_id: &str) -> u64 {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_id)
            .copied()
            .unwrap_or(0)
    }

    fn check_reachable(&self, operation: &str) -> Result<()> {
        if self.unresponsive.load(Ordering::SeqCst) {
            warn!(operation, "metadata service simulated as unresponsive");
            return Err(TransferClientError::ServiceUnavailable(format!("{operation}: no response")));
        }
        Ok(())
    }
}

fn matches(entry: &CatalogEntry, selection: &FileSelection) -> bool {
    match selection {
        FileSelection::Collection(c) => &entry.collection == c,
        FileSelection::Subset(s) => entry.subsets.iter().any(|x| x == s),
        FileSelection::Paths(paths) => {
            let locator = entry.descriptor.locator.to_string();
            paths.iter().any(|p| {
                let p = p.trim().trim_end_matches('/');
                p == locator || p == entry.descriptor.alias
            })
        },
    }
}

#[async_trait]
impl MetadataService for MemoryMetadataService {
    async fn list_files(&self, selection: &FileSelection, page_token: Option<String>) -> Result<ListingPage> {
        self.check_reachable("list_files")?;
        let start = match page_token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| TransferClientError::Other(format!("bad page token {t:?}")))?,
            None => 0,
        };
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let selected: Vec<_> = catalog.iter().filter(|e| matches(e, selection)).collect();
        let end = (start + self.page_size).min(selected.len());
        let files = selected
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect();
        Ok(ListingPage {
            files,
            next_page: (end < selected.len()).then(|| end.to_string()),
        })
    }

    async fn issue_credentials(
        &self,
        file_ids: &[String],
        direction: TransferDirection,
    ) -> Result<HashMap<String, Credentials>> {
        self.check_reachable("issue_credentials")?;
        self.issue_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file_ids.len());

        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let mut generations = self.generations.lock().unwrap_or_else(PoisonError::into_inner);
        let withheld = self.withheld.lock().unwrap_or_else(PoisonError::into_inner);
        let mut issued = HashMap::with_capacity(file_ids.len());
        for id in file_ids.iter().filter(|id| !withheld.contains(*id)) {
            let Some(entry) = catalog.iter().find(|e| &e.descriptor.file_id == id) else {
                continue;
            };
            let generation = generations.entry(id.clone()).or_insert(0);
            *generation += 1;
            let mut creds = Credentials::new(
                format!("AK-{id}"),
                format!("SK-{id}-{direction}"),
                session_token_for(id, *generation),
            );
            creds.source = Some(entry.descriptor.locator.clone());
            issued.insert(id.clone(), creds);
        }
        Ok(issued)
    }
}
