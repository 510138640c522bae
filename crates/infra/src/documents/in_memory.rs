use std::collections::HashMap;
use std::sync::RwLock;

use docflow_core::Locator;

use super::{DocumentError, DocumentStore};

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, DocumentError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| DocumentError::Unavailable("document store lock poisoned".to_string()))?;
        objects
            .get(&(locator.bucket.clone(), locator.object.clone()))
            .cloned()
            .ok_or_else(|| DocumentError::NotFound(locator.clone()))
    }

    fn put(&self, bucket: &str, object: &str, bytes: &[u8]) -> Result<Locator, DocumentError> {
        if bucket.is_empty() || object.is_empty() {
            return Err(DocumentError::InvalidPath(format!("{bucket}/{object}")));
        }
        self.objects
            .write()
            .map_err(|_| DocumentError::Unavailable("document store lock poisoned".to_string()))?
            .insert((bucket.to_string(), object.to_string()), bytes.to_vec());
        Ok(Locator::new(bucket, object))
    }
}
