//! Persistent catalog backed by redb.
//!
//! The catalog plays the role of the external relational store: it keeps the
//! overflow half of pointer-form attribute records, the metadata cache rows,
//! and the durable logs the engine needs to resume after a crash (sagas,
//! finalization intents, scheduled source deletions, cleanup tasks).
//! Every write is its own committed redb transaction.

use crate::tables;
use crate::types::{
    CleanupTask, FileIndexEntry, FinalizeIntent, ScheduledSourceCleanup, source_cleanup_key,
};
use archivum_common::{FileId, NodeId};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::error;

/// Error type for catalog operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for CatalogError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<CatalogError> for archivum_common::Error {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Io(io) => Self::TransientIo(io),
            other => Self::Catalog(other.to_string()),
        }
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Persistent catalog backed by redb.
pub struct Catalog {
    db: Database,
}

impl Catalog {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::OVERFLOW_RECORDS)?;
            let _t = write_txn.open_table(tables::FILE_INDEX)?;
            let _t = write_txn.open_table(tables::SAGAS)?;
            let _t = write_txn.open_table(tables::FINALIZATIONS)?;
            let _t = write_txn.open_table(tables::SOURCE_CLEANUPS)?;
            let _t = write_txn.open_table(tables::CLEANUP_TASKS)?;
            let _t = write_txn.open_table(tables::PARKED_TASKS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // ---- Overflow records (raw JSON bytes) ----

    pub fn put_overflow(&self, key: &str, record_json: &[u8]) -> CatalogResult<()> {
        self.put_bytes(tables::OVERFLOW_RECORDS, key, record_json)
    }

    pub fn get_overflow(&self, key: &str) -> CatalogResult<Option<Vec<u8>>> {
        self.get_bytes(tables::OVERFLOW_RECORDS, key)
    }

    pub fn delete_overflow(&self, key: &str) -> CatalogResult<()> {
        self.delete_key(tables::OVERFLOW_RECORDS, key)
    }

    /// Overflow keys starting with `prefix`, in key order
    pub fn list_overflow_keys(&self, prefix: &str) -> CatalogResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::OVERFLOW_RECORDS)?;
        let mut keys = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, _) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    // ---- Metadata cache (bincode) ----

    pub fn put_file_index(&self, entry: &FileIndexEntry) -> CatalogResult<()> {
        self.put_bincode(tables::FILE_INDEX, &entry.file_id.to_string(), entry)
    }

    pub fn get_file_index(&self, file_id: &FileId) -> CatalogResult<Option<FileIndexEntry>> {
        self.get_bincode(tables::FILE_INDEX, &file_id.to_string())
    }

    pub fn delete_file_index(&self, file_id: &FileId) -> CatalogResult<()> {
        self.delete_key(tables::FILE_INDEX, &file_id.to_string())
    }

    pub fn load_file_index(&self) -> CatalogResult<Vec<FileIndexEntry>> {
        Ok(self
            .load_bincode_table(tables::FILE_INDEX)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Replace the whole metadata cache in one transaction (manual rebuild)
    pub fn replace_file_index(&self, entries: &[FileIndexEntry]) -> CatalogResult<()> {
        let encoded = entries
            .iter()
            .map(|e| Ok((e.file_id.to_string(), bincode::serialize(e)?)))
            .collect::<CatalogResult<Vec<_>>>()?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::FILE_INDEX)?;
            let stale: Vec<String> = table
                .iter()?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in &stale {
                table.remove(key.as_str())?;
            }
            for (key, bytes) in &encoded {
                table.insert(key.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Saga log (raw JSON bytes owned by the engine) ----

    pub fn put_saga(&self, saga_id: &str, instance_json: &[u8]) -> CatalogResult<()> {
        self.put_bytes(tables::SAGAS, saga_id, instance_json)
    }

    pub fn get_saga(&self, saga_id: &str) -> CatalogResult<Option<Vec<u8>>> {
        self.get_bytes(tables::SAGAS, saga_id)
    }

    pub fn delete_saga(&self, saga_id: &str) -> CatalogResult<()> {
        self.delete_key(tables::SAGAS, saga_id)
    }

    pub fn load_sagas(&self) -> CatalogResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::SAGAS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push((entry.0.value().to_string(), entry.1.value().to_vec()));
        }
        Ok(result)
    }

    // ---- Finalization intents (bincode) ----

    pub fn put_finalize_intent(&self, intent: &FinalizeIntent) -> CatalogResult<()> {
        self.put_bincode(tables::FINALIZATIONS, &intent.file_id.to_string(), intent)
    }

    pub fn get_finalize_intent(&self, file_id: &FileId) -> CatalogResult<Option<FinalizeIntent>> {
        self.get_bincode(tables::FINALIZATIONS, &file_id.to_string())
    }

    pub fn delete_finalize_intent(&self, file_id: &FileId) -> CatalogResult<()> {
        self.delete_key(tables::FINALIZATIONS, &file_id.to_string())
    }

    pub fn load_finalize_intents(&self) -> CatalogResult<Vec<FinalizeIntent>> {
        Ok(self
            .load_bincode_table(tables::FINALIZATIONS)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    // ---- Scheduled source cleanups (bincode, composite key "file_id/node_id") ----

    pub fn schedule_source_cleanup(&self, cleanup: &ScheduledSourceCleanup) -> CatalogResult<()> {
        self.put_bincode(tables::SOURCE_CLEANUPS, &cleanup.key(), cleanup)
    }

    pub fn delete_source_cleanup(&self, file_id: &FileId, node_id: &NodeId) -> CatalogResult<()> {
        self.delete_key(tables::SOURCE_CLEANUPS, &source_cleanup_key(file_id, node_id))
    }

    pub fn load_source_cleanups(&self) -> CatalogResult<Vec<ScheduledSourceCleanup>> {
        Ok(self
            .load_bincode_table(tables::SOURCE_CLEANUPS)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    // ---- Cleanup queue (bincode) ----

    /// Insert a task unless one with the same key is already queued or parked.
    /// Returns true if the task was inserted.
    pub fn enqueue_cleanup_task(&self, task: &CleanupTask) -> CatalogResult<bool> {
        let key = task.key();
        let bytes = bincode::serialize(task)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let parked = write_txn.open_table(tables::PARKED_TASKS)?;
            let is_parked = parked.get(key.as_str())?.is_some();
            let mut table = write_txn.open_table(tables::CLEANUP_TASKS)?;
            let exists = table.get(key.as_str())?.is_some();
            if exists || is_parked {
                false
            } else {
                table.insert(key.as_str(), bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Overwrite a queued task (attempt bookkeeping)
    pub fn put_cleanup_task(&self, task: &CleanupTask) -> CatalogResult<()> {
        self.put_bincode(tables::CLEANUP_TASKS, &task.key(), task)
    }

    pub fn delete_cleanup_task(&self, key: &str) -> CatalogResult<()> {
        self.delete_key(tables::CLEANUP_TASKS, key)
    }

    pub fn load_cleanup_tasks(&self) -> CatalogResult<Vec<CleanupTask>> {
        Ok(self
            .load_bincode_table(tables::CLEANUP_TASKS)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Move a task from the queue to the parked table in one transaction
    pub fn park_cleanup_task(&self, task: &CleanupTask) -> CatalogResult<()> {
        let key = task.key();
        let bytes = bincode::serialize(task)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut queue = write_txn.open_table(tables::CLEANUP_TASKS)?;
            queue.remove(key.as_str())?;
            let mut parked = write_txn.open_table(tables::PARKED_TASKS)?;
            parked.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_parked_tasks(&self) -> CatalogResult<Vec<CleanupTask>> {
        Ok(self
            .load_bincode_table(tables::PARKED_TASKS)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Return a parked task to the queue with a fresh attempt budget.
    /// Returns false if no task is parked under `key`.
    pub fn requeue_parked_task(
        &self,
        key: &str,
        due_at: chrono::DateTime<chrono::Utc>,
    ) -> CatalogResult<bool> {
        let write_txn = self.db.begin_write()?;
        let found = {
            let mut parked = write_txn.open_table(tables::PARKED_TASKS)?;
            let task = match parked.remove(key)? {
                Some(guard) => Some(bincode::deserialize::<CleanupTask>(guard.value())?),
                None => None,
            };
            match task {
                Some(mut task) => {
                    task.attempts = 0;
                    task.due_at = due_at;
                    task.last_error = None;
                    let bytes = bincode::serialize(&task)?;
                    let mut queue = write_txn.open_table(tables::CLEANUP_TASKS)?;
                    queue.insert(key, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(found)
    }

    // ---- Generic helpers ----

    fn put_bytes(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> CatalogResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_bytes(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> CatalogResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put_bincode<T: serde::Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> CatalogResult<()> {
        let bytes = bincode::serialize(value)?;
        self.put_bytes(table_def, key, &bytes)
    }

    fn get_bincode<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> CatalogResult<Option<T>> {
        match self.get_bytes(table_def, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_key(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> CatalogResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_bincode_table<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
    ) -> CatalogResult<Vec<(String, T)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let bytes = entry.1.value();
            match bincode::deserialize::<T>(bytes) {
                Ok(val) => result.push((key, val)),
                Err(e) => error!("Failed to decode entry '{}': {}", key, e),
            }
        }
        Ok(result)
    }
}
