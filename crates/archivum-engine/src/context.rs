//! Services shared by the coordinators

use crate::events::EventBus;
use crate::node::{NodeRegistry, StorageNode};
use archivum_catalog::{Catalog, FileIndexEntry};
use archivum_common::{Clock, Config, Error, FileId, NodeId, Result};
use archivum_placement::{CapacityDirectory, StorageSelector};
use archivum_storage::AttributeRecord;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Everything a saga step, the finalizer or the collector touches
pub struct EngineContext {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub nodes: Arc<NodeRegistry>,
    pub directory: Arc<dyn CapacityDirectory>,
    pub selector: Arc<StorageSelector>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub active: ActiveFiles,
}

impl EngineContext {
    /// Find the node holding the authoritative record for `file_id`.
    ///
    /// Tries the metadata cache first and falls back to scanning nodes, so a
    /// lost or stale cache never hides a file.
    pub fn locate(&self, file_id: &FileId) -> Result<(Arc<StorageNode>, AttributeRecord)> {
        if let Some(entry) = self.catalog.get_file_index(file_id)?
            && let Ok(node) = self.nodes.get(&entry.node_id)
            && let Some(read) = node.attributes.read(file_id)?
            && read.record.storage_node_id == node.id
        {
            return Ok((node, read.record));
        }

        let mut found: Option<(Arc<StorageNode>, AttributeRecord)> = None;
        for node in self.nodes.iter() {
            if let Some(read) = node.attributes.read(file_id)?
                && read.record.storage_node_id == node.id
                && found.as_ref().is_none_or(|(_, r)| supersedes(&read.record, r))
            {
                found = Some((Arc::clone(node), read.record));
            }
        }
        found.ok_or(Error::RecordNotFound(*file_id))
    }
}

/// Whether `candidate` wins over `current` when two nodes both claim a file.
///
/// During a finalize commit the target record exists before the source is
/// switched; the finalized copy is the one commit rolls forward to.
#[must_use]
pub fn supersedes(candidate: &AttributeRecord, current: &AttributeRecord) -> bool {
    (candidate.finalized_at.is_some(), candidate.version)
        > (current.finalized_at.is_some(), current.version)
}

/// Metadata cache row for a record
#[must_use]
pub fn index_entry(record: &AttributeRecord, updated_at: chrono::DateTime<chrono::Utc>) -> FileIndexEntry {
    FileIndexEntry {
        file_id: record.file_id,
        node_id: record.storage_node_id.clone(),
        original_filename: record.original_filename.clone(),
        retention_policy: record.retention_policy,
        file_size: record.file_size,
        sha256: record.sha256.clone(),
        version: record.version,
        ttl_expires_at: record.ttl_expires_at,
        finalized_at: record.finalized_at,
        updated_at,
    }
}

/// Files with an operation in flight in this process.
///
/// One saga or finalization per file at a time; the orphan scan also
/// consults this so it never races an upload that has bytes but no record yet.
#[derive(Default)]
pub struct ActiveFiles {
    owners: DashMap<FileId, String>,
}

impl ActiveFiles {
    /// Claim `file_id` for `owner`. Re-claiming by the same owner succeeds.
    pub fn claim(&self, file_id: FileId, owner: &str) -> Result<()> {
        match self.owners.entry(file_id) {
            Entry::Occupied(e) if e.get() == owner => Ok(()),
            Entry::Occupied(e) => Err(Error::lock_contention(format!(
                "file {file_id} is busy with {}",
                e.get()
            ))),
            Entry::Vacant(e) => {
                e.insert(owner.to_string());
                Ok(())
            }
        }
    }

    /// Claim released on drop
    pub fn guard(&self, file_id: FileId, owner: &str) -> Result<ActiveGuard<'_>> {
        self.claim(file_id, owner)?;
        Ok(ActiveGuard {
            files: self,
            file_id,
        })
    }

    pub fn release(&self, file_id: &FileId) {
        self.owners.remove(file_id);
    }

    #[must_use]
    pub fn is_active(&self, file_id: &FileId) -> bool {
        self.owners.contains_key(file_id)
    }

    #[must_use]
    pub fn owner(&self, file_id: &FileId) -> Option<String> {
        self.owners.get(file_id).map(|o| o.value().clone())
    }
}

pub struct ActiveGuard<'a> {
    files: &'a ActiveFiles,
    file_id: FileId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.files.release(&self.file_id);
    }
}

/// Reservation id used for a node during finalization of `file_id`
#[must_use]
pub fn finalize_reservation_id(file_id: &FileId, target: &NodeId) -> String {
    format!("finalize/{file_id}/{target}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_files_exclusive_per_file() {
        let files = ActiveFiles::default();
        let id = FileId::new();
        files.claim(id, "saga-a").unwrap();
        files.claim(id, "saga-a").unwrap();
        assert!(matches!(
            files.claim(id, "saga-b"),
            Err(Error::LockContention { .. })
        ));
        assert_eq!(files.owner(&id).as_deref(), Some("saga-a"));

        files.release(&id);
        {
            let _guard = files.guard(id, "finalize").unwrap();
            assert!(files.is_active(&id));
        }
        assert!(!files.is_active(&id));
    }
}
