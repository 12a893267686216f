//! Blob storage trait for raw document bundles

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;

use crate::models::{CompanyId, MessageId};

/// Key for storing/retrieving a bundle
///
/// Rendered as a relative path, `{company}/{shard}/{message}.bundle`, which
/// is what [`crate::models::ContentRef::blob_key`] records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    /// Key of the bundle downloaded for `message_id`
    pub fn bundle(company_id: CompanyId, message_id: &MessageId) -> Self {
        let name: String = message_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let shard = name.get(name.len().saturating_sub(2)..).unwrap_or("xx");
        let shard = if shard.len() == 2 { shard } else { "xx" };
        Self(format!("{}/{}/{}.bundle", company_id, shard, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, or `None` if the key could escape the store root
    pub fn segments(&self) -> Option<Vec<&str>> {
        let segments: Vec<&str> = self.0.split('/').collect();
        let safe = segments
            .iter()
            .all(|s| !s.is_empty() && *s != "." && *s != ".." && !s.contains('\\'));
        safe.then_some(segments)
    }
}

impl From<String> for BlobKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for BlobKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Trait for blob storage operations
///
/// Implementations handle compression/decompression internally. A `put`
/// either stores the whole blob or nothing.
pub trait BlobStore: Send + Sync {
    /// Store blob content, replacing any previous content
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()>;

    /// Retrieve blob content
    ///
    /// Returns None if the blob doesn't exist.
    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>>;

    /// Check if a blob exists
    fn exists(&self, key: &BlobKey) -> Result<bool>;

    /// Delete a blob
    fn delete(&self, key: &BlobKey) -> Result<()>;
}

/// In-memory blob storage (for testing)
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        self.blobs.write().unwrap().insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }

    fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blobs.read().unwrap().contains_key(key))
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        self.blobs.write().unwrap().remove(key);
        Ok(())
    }
}
