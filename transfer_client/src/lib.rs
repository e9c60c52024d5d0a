#![cfg_attr(feature = "strict", deny(warnings))]

pub use error::{FailureKind, TransferClientError, classify_denied};
pub use http_client::{RetryConfig, TransientStatusStrategy, build_http_client};
pub use http_store::HttpObjectStore;
pub use interface::{ByteStream, MetadataService, ObjectStore};
pub use metadata_client::HttpMetadataService;
pub use types::{
    CompletedPart, Credentials, FileDescriptor, FileSelection, ListingPage, MultipartSession, ObjectHead,
    ObjectLocator, PartInfo, TransferDirection,
};

pub mod checksum;
pub mod constants;
pub mod error;
mod http_client;
mod http_store;
mod interface;
mod metadata_client;
pub mod simulation;
mod types;
