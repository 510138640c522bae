//! Document storage collaborator.
//!
//! Tasks refer to stored documents through a [`Locator`]; the worker fetches
//! the bytes and decodes them as text before analysis.

pub mod fs;
pub mod in_memory;

use std::sync::Arc;

use thiserror::Error;

use docflow_core::{Locator, TaskId};

pub use fs::FsDocumentStore;
pub use in_memory::InMemoryDocumentStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document is still pending upload after {attempts} checks")]
    Pending { attempts: u32 },

    #[error("invalid document path: {0}")]
    InvalidPath(String),

    #[error("document not found: {0}")]
    NotFound(Locator),

    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

pub trait DocumentStore: Send + Sync {
    fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, DocumentError>;

    /// Store `bytes` under `bucket`/`object` and return where they landed.
    fn put(&self, bucket: &str, object: &str, bytes: &[u8]) -> Result<Locator, DocumentError>;
}

impl<D> DocumentStore for Arc<D>
where
    D: DocumentStore + ?Sized,
{
    fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, DocumentError> {
        (**self).fetch(locator)
    }

    fn put(&self, bucket: &str, object: &str, bytes: &[u8]) -> Result<Locator, DocumentError> {
        (**self).put(bucket, object, bytes)
    }
}

/// Object name for an uploaded file: `{task_id}_{filename}`.
pub fn upload_object_name(task_id: TaskId, filename: &str) -> String {
    format!("{task_id}_{filename}")
}

/// Decode fetched bytes as text, replacing invalid UTF-8 sequences.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
