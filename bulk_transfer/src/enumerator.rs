use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};
use transfer_client::{FileDescriptor, FileSelection, MetadataService};

use crate::errors::{BulkTransferError, Result};

/// Counts kept while enumerating, for the run summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnumerationStats {
    pub listed: u64,
    pub filtered_out: u64,
    pub already_complete: u64,
    pub yielded: u64,
}

/// Lazily pages through the listing for a selection and yields fixed-size batches of files
/// that still need work.
pub struct BatchEnumerator {
    metadata: Arc<dyn MetadataService>,
    selection: FileSelection,
    name_filter: Option<Regex>,
    batch_size: usize,
    completed: HashSet<String>,
    seen: HashSet<String>,
    buffer: VecDeque<FileDescriptor>,
    next_page: Option<String>,
    exhausted: bool,
    stats: EnumerationStats,
}

impl BatchEnumerator {
    /// `completed` holds file ids the ledger already records; they are never yielded.
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        selection: FileSelection,
        name_filter: Option<&str>,
        batch_size: usize,
        completed: HashSet<String>,
    ) -> Result<Self> {
        let name_filter = name_filter.map(Regex::new).transpose()?;
        Ok(Self {
            metadata,
            selection,
            name_filter,
            batch_size: batch_size.max(1),
            completed,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            next_page: None,
            exhausted: false,
            stats: EnumerationStats::default(),
        })
    }

    pub fn stats(&self) -> EnumerationStats {
        self.stats
    }

    /// The next batch, or None once the listing is exhausted. Only the last batch may be short.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<FileDescriptor>>> {
        while self.buffer.len() < self.batch_size && !self.exhausted {
            self.fetch_page().await?;
        }
        if self.buffer.is_empty() {
            info!(
                listed = self.stats.listed,
                filtered_out = self.stats.filtered_out,
                already_complete = self.stats.already_complete,
                yielded = self.stats.yielded,
                "enumeration finished"
            );
            return Ok(None);
        }
        let n = self.batch_size.min(self.buffer.len());
        let batch: Vec<_> = self.buffer.drain(..n).collect();
        self.stats.yielded += batch.len() as u64;
        debug!(batch_size = batch.len(), "yielding batch");
        Ok(Some(batch))
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let page = self
            .metadata
            .list_files(&self.selection, self.next_page.take())
            .await
            .map_err(|e| {
                if e.is_unreachable() {
                    BulkTransferError::InfrastructureUnresponsive(format!("metadata service: {e}"))
                } else {
                    e.into()
                }
            })?;

        for file in page.files {
            self.stats.listed += 1;
            if let Some(filter) = &self.name_filter
                && !filter.is_match(&file.alias)
            {
                self.stats.filtered_out += 1;
                continue;
            }
            if self.completed.contains(&file.file_id) {
                self.stats.already_complete += 1;
                continue;
            }
            // A listing may repeat a file across pages.
            if !self.seen.insert(file.file_id.clone()) {
                continue;
            }
            self.buffer.push_back(file);
        }

        match page.next_page {
            Some(token) => self.next_page = Some(token),
            None => self.exhausted = true,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use transfer_client::ObjectLocator;
    use transfer_client::simulation::MemoryMetadataService;

    use super::*;

    fn catalog(n: usize, page_size: usize) -> Arc<MemoryMetadataService> {
        let svc = MemoryMetadataService::new(page_size);
        for i in 0..n {
            let ext = if i % 3 == 0 { "txt" } else { "bin" };
            svc.add_file(
                "c",
                &[],
                FileDescriptor {
                    file_id: i.to_string(),
                    alias: format!("d/f{i}.{ext}"),
                    expected_size: 1,
                    locator: ObjectLocator::new("b", format!("d/f{i}.{ext}")),
                },
            );
        }
        svc
    }

    async fn drain(e: &mut BatchEnumerator) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(b) = e.next_batch().await.unwrap() {
            sizes.push(b.len());
        }
        sizes
    }

    #[tokio::test]
    async fn test_fixed_size_batches() {
        let svc = catalog(120, 7);
        let mut e = BatchEnumerator::new(svc, FileSelection::Collection("c".into()), None, 50, HashSet::new()).unwrap();
        assert_eq!(drain(&mut e).await, vec![50, 50, 20]);
        assert_eq!(e.stats().yielded, 120);
    }

    #[tokio::test]
    async fn test_filter_and_completed_are_removed() {
        let svc = catalog(30, 8);
        let completed: HashSet<String> = ["0", "3", "4"].iter().map(|s| s.to_string()).collect();
        let mut e =
            BatchEnumerator::new(svc, FileSelection::Collection("c".into()), Some(r"\.txt$"), 4, completed).unwrap();

        let mut ids = Vec::new();
        while let Some(batch) = e.next_batch().await.unwrap() {
            ids.extend(batch.into_iter().map(|f| f.file_id));
        }
        // txt files are every third id; 0 and 3 are already done.
        assert_eq!(ids, vec!["6", "9", "12", "15", "18", "21", "24", "27"]);
        let stats = e.stats();
        assert_eq!(stats.listed, 30);
        assert_eq!(stats.filtered_out, 20);
        assert_eq!(stats.already_complete, 2);
    }

    #[tokio::test]
    async fn test_everything_complete_yields_nothing() {
        let svc = catalog(10, 3);
        let completed = (0..10).map(|i| i.to_string()).collect();
        let mut e = BatchEnumerator::new(svc, FileSelection::Collection("c".into()), None, 50, completed).unwrap();
        assert!(e.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_listing_is_fatal() {
        let svc = catalog(10, 3);
        svc.set_unresponsive(true);
        let mut e = BatchEnumerator::new(svc, FileSelection::Collection("c".into()), None, 50, HashSet::new()).unwrap();
        assert!(e.next_batch().await.unwrap_err().is_fatal_for_run());
    }
}
