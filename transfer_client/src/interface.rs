use std::collections::HashMap;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{
    CompletedPart, Credentials, FileDescriptor, FileSelection, ListingPage, MultipartSession, ObjectHead, ObjectLocator,
    PartInfo, TransferDirection,
};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// The metadata service that knows which files a collection holds and issues scoped
/// credentials for them.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// One page of the listing for `selection`; pass the previous page's `next_page` to continue.
    async fn list_files(&self, selection: &FileSelection, page_token: Option<String>) -> Result<ListingPage>;

    /// Credentials for each of `file_ids`. Ids the service does not know are absent from the map.
    async fn issue_credentials(
        &self,
        file_ids: &[String],
        direction: TransferDirection,
    ) -> Result<HashMap<String, Credentials>>;

    /// Drains every page of the listing.
    async fn list_all_files(&self, selection: &FileSelection) -> Result<Vec<FileDescriptor>> {
        let mut files = Vec::new();
        let mut token = None;
        loop {
            let page = self.list_files(selection, token).await?;
            files.extend(page.files);
            match page.next_page {
                Some(t) => token = Some(t),
                None => return Ok(files),
            }
        }
    }
}

/// A generic object store with range-resumable reads and a multipart write API.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, locator: &ObjectLocator, creds: &Credentials) -> Result<ObjectHead>;

    /// Streams the object starting at byte `offset`.
    async fn get_object(&self, locator: &ObjectLocator, creds: &Credentials, offset: u64) -> Result<ByteStream>;

    /// Single-shot write; returns the stored checksum.
    async fn put_object(&self, locator: &ObjectLocator, creds: &Credentials, data: Bytes) -> Result<String>;

    /// Server-side copy of a whole object. `source_creds` grant read on the source.
    async fn copy_object(
        &self,
        source: &ObjectLocator,
        source_creds: &Credentials,
        destination: &ObjectLocator,
        creds: &Credentials,
    ) -> Result<ObjectHead>;

    async fn create_multipart_session(&self, locator: &ObjectLocator, creds: &Credentials) -> Result<MultipartSession>;

    /// Open sessions on `locator`, oldest first.
    async fn list_multipart_sessions(
        &self,
        locator: &ObjectLocator,
        creds: &Credentials,
    ) -> Result<Vec<MultipartSession>>;

    /// Parts already held by `session`, ordered by part number.
    async fn list_parts(&self, session: &MultipartSession, creds: &Credentials) -> Result<Vec<PartInfo>>;

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        data: Bytes,
        creds: &Credentials,
    ) -> Result<PartInfo>;

    /// Server-side copy of `range` of `source` into a part.
    async fn upload_part_copy(
        &self,
        session: &MultipartSession,
        part_number: u32,
        source: &ObjectLocator,
        source_creds: &Credentials,
        range: Range<u64>,
        creds: &Credentials,
    ) -> Result<PartInfo>;

    async fn complete_multipart_session(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
        creds: &Credentials,
    ) -> Result<ObjectHead>;

    async fn abort_multipart_session(&self, session: &MultipartSession, creds: &Credentials) -> Result<()>;
}
