//! Filesystem document store: `root/<bucket>/<object>`.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use docflow_core::Locator;

use super::{DocumentError, DocumentStore};

#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only plain relative components are accepted, so a locator can never
    /// resolve outside `root`.
    fn resolve(&self, bucket: &str, object: &str) -> Result<PathBuf, DocumentError> {
        let invalid = || DocumentError::InvalidPath(format!("{bucket}/{object}"));

        let bucket_path = Path::new(bucket);
        let object_path = Path::new(object);
        let mut bucket_parts = bucket_path.components();
        if !matches!(
            (bucket_parts.next(), bucket_parts.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(invalid());
        }
        if object.is_empty()
            || !object_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid());
        }

        Ok(self.root.join(bucket_path).join(object_path))
    }
}

impl DocumentStore for FsDocumentStore {
    fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, DocumentError> {
        let path = self.resolve(&locator.bucket, &locator.object)?;
        debug!(path = %path.display(), "Reading document");
        std::fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DocumentError::NotFound(locator.clone()),
            _ => DocumentError::Unavailable(format!("{}: {e}", path.display())),
        })
    }

    fn put(&self, bucket: &str, object: &str, bytes: &[u8]) -> Result<Locator, DocumentError> {
        let path = self.resolve(bucket, object)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DocumentError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| DocumentError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Locator::new(bucket, object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_under_bucket_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());

        let locator = store.put("doc-llm-bucket", "5_notes.txt", b"body").unwrap();
        assert!(dir.path().join("doc-llm-bucket/5_notes.txt").is_file());
        assert_eq!(store.fetch(&locator).unwrap(), b"body");
    }

    #[test]
    fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());

        for (bucket, object) in [
            ("..", "x"),
            ("b", "../../etc/passwd"),
            ("/abs", "x"),
            ("b/c", "x"),
            ("b", ""),
        ] {
            assert!(
                matches!(store.put(bucket, object, b""), Err(DocumentError::InvalidPath(_))),
                "{bucket}/{object} should be rejected"
            );
        }
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        let locator = Locator::new("b", "absent.txt");
        assert_eq!(store.fetch(&locator), Err(DocumentError::NotFound(locator)));
    }
}
