//! Document references stored on a task.
//!
//! The `doc` field of a task is one of three things:
//! - the pending-upload sentinel, replaced once the uploaded file is stored
//! - a storage locator (`minio://bucket/object` or `/bucket/object`)
//! - literal document text

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Reserved `doc` value meaning "awaiting a pending file upload".
pub const PENDING_UPLOAD_SENTINEL: &str = "__PENDING_FILE__";

const LOCATOR_SCHEME: &str = "minio://";

/// Address of an object in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub bucket: String,
    pub object: String,
}

impl Locator {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    /// Parse `minio://bucket/object` or `/bucket/object`.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let s = raw.trim();
        let rest = match s.strip_prefix(LOCATOR_SCHEME) {
            Some(rest) => rest,
            None => s.trim_start_matches('/'),
        };

        let (bucket, object) = rest
            .split_once('/')
            .ok_or_else(|| DomainError::invalid_document(format!("invalid locator: {raw}")))?;
        if bucket.is_empty() || object.is_empty() {
            return Err(DomainError::invalid_document(format!("invalid locator: {raw}")));
        }

        Ok(Self::new(bucket, object))
    }
}

impl core::fmt::Display for Locator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{LOCATOR_SCHEME}{}/{}", self.bucket, self.object)
    }
}

/// Interpretation of a task's `doc` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRef {
    PendingUpload,
    Stored(Locator),
    Inline(String),
}

impl DocumentRef {
    pub fn parse(doc: &str) -> DomainResult<Self> {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_document("document is empty"));
        }
        if trimmed == PENDING_UPLOAD_SENTINEL {
            return Ok(DocumentRef::PendingUpload);
        }
        if trimmed.starts_with(LOCATOR_SCHEME) || trimmed.starts_with('/') {
            return Locator::parse(trimmed).map(DocumentRef::Stored);
        }
        Ok(DocumentRef::Inline(trimmed.to_string()))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DocumentRef::PendingUpload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_pending() {
        assert_eq!(
            DocumentRef::parse(PENDING_UPLOAD_SENTINEL).unwrap(),
            DocumentRef::PendingUpload
        );
    }

    #[test]
    fn both_locator_forms_parse() {
        let expected = Locator::new("doc-llm-bucket", "15_readme.txt");
        assert_eq!(
            DocumentRef::parse("minio://doc-llm-bucket/15_readme.txt").unwrap(),
            DocumentRef::Stored(expected.clone())
        );
        assert_eq!(
            DocumentRef::parse("/doc-llm-bucket/15_readme.txt").unwrap(),
            DocumentRef::Stored(expected)
        );
    }

    #[test]
    fn object_names_may_contain_slashes() {
        let locator = Locator::parse("minio://b/dir/file.md").unwrap();
        assert_eq!(locator.bucket, "b");
        assert_eq!(locator.object, "dir/file.md");
        assert_eq!(locator.to_string(), "minio://b/dir/file.md");
    }

    #[test]
    fn malformed_locators_are_rejected() {
        assert!(matches!(
            DocumentRef::parse("minio://bucket-only"),
            Err(DomainError::InvalidDocumentRef(_))
        ));
        assert!(matches!(
            DocumentRef::parse("/bucket/"),
            Err(DomainError::InvalidDocumentRef(_))
        ));
    }

    #[test]
    fn anything_else_is_inline_text() {
        assert_eq!(
            DocumentRef::parse("  hello world ").unwrap(),
            DocumentRef::Inline("hello world".to_string())
        );
        assert!(DocumentRef::parse("   ").is_err());
    }
}
