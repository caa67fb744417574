//! Content-addressed blob storage.
//!
//! Uploaded bytes are stored once under their SHA-256 hash and never mutated;
//! re-processing a job re-reads the same bytes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Reference to a stored blob: content hash plus a storage locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    /// Hex SHA-256 of the blob contents.
    pub content_hash: String,
    /// Store-relative locator, e.g. `ab/abcdef…`.
    pub locator: String,
}

/// Filesystem-backed blob store.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Stores bytes under their content hash, returning a reference.
    ///
    /// Storing the same bytes twice is a no-op that returns the same
    /// reference.
    pub fn store(&self, bytes: &[u8]) -> Result<BlobRef, StorageError> {
        let hash = content_hash(bytes);
        let locator = format!("{}/{}", &hash[..2], &hash);
        let path = self.root.join(&locator);

        if !path.exists() {
            let parent = path.parent().unwrap_or(&self.root);
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;

            // Write to a temp name then rename so readers never observe a
            // partial blob.
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes).map_err(|e| StorageError::WriteBlob {
                path: tmp.clone(),
                source: e,
            })?;
            std::fs::rename(&tmp, &path).map_err(|e| StorageError::WriteBlob {
                path: path.clone(),
                source: e,
            })?;
        }

        Ok(BlobRef {
            content_hash: hash,
            locator,
        })
    }

    /// Reads the full contents of a stored blob.
    pub fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(&blob.locator);
        if !path.exists() {
            return Err(StorageError::NotFound(blob.content_hash.clone()));
        }
        std::fs::read(&path).map_err(|e| StorageError::ReadBlob { path, source: e })
    }

    pub fn contains(&self, blob: &BlobRef) -> bool {
        self.root.join(&blob.locator).exists()
    }
}

/// Hex SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_read() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path());

        let blob = store.store(b"inspection report body").unwrap();
        assert_eq!(blob.content_hash.len(), 64);
        assert!(blob.locator.starts_with(&blob.content_hash[..2]));

        let bytes = store.read(&blob).unwrap();
        assert_eq!(bytes, b"inspection report body");
    }

    #[test]
    fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path());

        let first = store.store(b"same bytes").unwrap();
        let second = store.store(b"same bytes").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_contents_distinct_refs() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path());

        let a = store.store(b"report a").unwrap();
        let b = store.store(b"report b").unwrap();
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_read_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path());

        let missing = BlobRef {
            content_hash: "0".repeat(64),
            locator: "00/nope".to_string(),
        };
        assert!(matches!(
            store.read(&missing),
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.contains(&missing));
    }
}
