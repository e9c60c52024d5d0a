//! In-process stand-ins for the object store and metadata service, with fault injection and
//! request accounting. Used by tests and dry runs.

mod memory_metadata;
mod memory_store;

pub use memory_metadata::{MemoryMetadataService, session_token_for};
pub use memory_store::MemoryObjectStore;
