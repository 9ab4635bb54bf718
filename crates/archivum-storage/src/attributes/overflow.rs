//! Backing store for records too large to keep inline
//!
//! Bodies are keyed `node_id/file_id/nonce`. Every write gets a fresh key, so
//! a staged body never replaces the one a committed pointer names, and two
//! nodes holding the same file never share a row.

use archivum_catalog::Catalog;
use archivum_common::{FileId, NodeId, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Keyed blob storage for pointer-form record bodies
pub trait OverflowStore: Send + Sync {
    fn put(&self, key: &str, body: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Keys beginning with `prefix`
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Prefix shared by every body a node writes
#[must_use]
pub fn node_prefix(node_id: &NodeId) -> String {
    format!("{node_id}/")
}

/// Fresh key for one write of `file_id` on `node_id`
#[must_use]
pub fn new_body_key(node_id: &NodeId, file_id: &FileId) -> String {
    format!("{node_id}/{file_id}/{}", Uuid::new_v4().simple())
}

/// File a body key belongs to
#[must_use]
pub fn body_owner(key: &str) -> Option<FileId> {
    key.split('/').nth(1)?.parse().ok()
}

impl OverflowStore for Catalog {
    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        Ok(self.put_overflow(key, body)?)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_overflow(key)?)
    }

    fn delete(&self, key: &str) -> Result<()> {
        Ok(self.delete_overflow(key)?)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.list_overflow_keys(prefix)?)
    }
}

/// In-memory overflow store
#[derive(Default)]
pub struct MemoryOverflowStore {
    rows: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryOverflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl OverflowStore for MemoryOverflowStore {
    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        self.rows.write().insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.rows.write().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .rows
            .read()
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
