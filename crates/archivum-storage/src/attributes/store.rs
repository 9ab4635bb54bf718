use super::overflow::{OverflowStore, body_owner, new_body_key, node_prefix};
use super::record::{AttributeRecord, RecordForm, SCHEMA_VERSION, StoredRecord, decode_record};
use crate::locks::{FileLockGuard, FileLocks};
use archivum_common::config::AttributeConfig;
use archivum_common::{Error, FileId, NodeId, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const RECORD_EXT: &str = ".json";
const TEMP_EXT: &str = ".tmp";
/// Pointer re-reads tolerated while concurrent writers replace the body
const POINTER_READ_ATTEMPTS: usize = 3;

/// A record as read from disk
#[derive(Clone, Debug)]
pub struct ReadRecord {
    pub record: AttributeRecord,
    pub form: RecordForm,
    /// The stored document used an older schema and was upgraded in memory
    pub migrated: bool,
    /// Overflow row holding the body of a pointer-form record
    pub overflow_key: Option<String>,
}

/// Attribute record directory of one storage node
pub struct AttributeStore {
    dir: PathBuf,
    node_id: NodeId,
    overflow: Arc<dyn OverflowStore>,
    inline_limit: usize,
    lock_wait: Duration,
    locks: FileLocks,
}

impl AttributeStore {
    /// Open (creating if needed) the record directory of `node_id` at `dir`.
    ///
    /// Overflow bodies are scoped to `node_id`, so stores of different nodes
    /// may share one overflow backend.
    pub fn open(
        dir: impl Into<PathBuf>,
        node_id: NodeId,
        overflow: Arc<dyn OverflowStore>,
        config: &AttributeConfig,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            node_id,
            overflow,
            inline_limit: config.inline_limit_bytes,
            lock_wait: config.lock_wait(),
            locks: FileLocks::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `file_id`
    #[must_use]
    pub fn record_path(&self, file_id: &FileId) -> PathBuf {
        self.dir.join(format!("{file_id}{RECORD_EXT}"))
    }

    /// Whether a writer is inside the write window for `file_id`
    #[must_use]
    pub fn is_locked(&self, file_id: &FileId) -> bool {
        self.locks.is_locked(file_id)
    }

    /// Atomically create or replace a record.
    ///
    /// A record whose version is lower than the stored one is rejected.
    pub fn write(&self, record: &AttributeRecord) -> Result<()> {
        self.stage(record)?.commit()
    }

    /// Write the new record to a temp file without publishing it.
    ///
    /// The per-file write window stays held until the returned
    /// [`StagedRecord`] is committed or dropped.
    pub fn stage(&self, record: &AttributeRecord) -> Result<StagedRecord<'_>> {
        let guard = self.locks.acquire(record.file_id, self.lock_wait)?;
        let previous = self.read(&record.file_id)?;
        if let Some(prev) = &previous
            && record.version < prev.record.version
        {
            return Err(Error::invalid_argument(format!(
                "record {} version {} is older than stored version {}",
                record.file_id, record.version, prev.record.version
            )));
        }
        self.stage_locked(guard, record, previous.and_then(|p| p.overflow_key))
    }

    /// Read the record for `file_id`, upgrading legacy schemas in memory
    pub fn read(&self, file_id: &FileId) -> Result<Option<ReadRecord>> {
        let path = self.record_path(file_id);
        let mut attempt = 0;
        let read = loop {
            attempt += 1;
            let Some(bytes) = read_optional(&path)? else {
                return Ok(None);
            };
            let (stored, migrated) = StoredRecord::decode(&bytes)?;
            match stored {
                StoredRecord::Inline(record) => {
                    break ReadRecord {
                        record,
                        form: RecordForm::Inline,
                        migrated,
                        overflow_key: None,
                    };
                }
                StoredRecord::Pointer { overflow_key, .. } => {
                    if let Some(body) = self.overflow.get(&overflow_key)? {
                        let (record, migrated) = decode_record(&body)?;
                        break ReadRecord {
                            record,
                            form: RecordForm::Pointer,
                            migrated,
                            overflow_key: Some(overflow_key),
                        };
                    }
                    // A writer may have replaced the pointer and dropped this body
                    if attempt >= POINTER_READ_ATTEMPTS
                        || read_optional(&path)?.as_deref() == Some(bytes.as_slice())
                    {
                        return Err(Error::invalid_state(format!(
                            "record {file_id} points to a missing overflow body"
                        )));
                    }
                }
            }
        };

        if read.record.file_id != *file_id {
            return Err(Error::invalid_state(format!(
                "record file for {file_id} holds {}",
                read.record.file_id
            )));
        }
        Ok(Some(read))
    }

    /// Read a record that must exist
    pub fn get(&self, file_id: &FileId) -> Result<AttributeRecord> {
        self.read(file_id)?
            .map(|r| r.record)
            .ok_or(Error::RecordNotFound(*file_id))
    }

    /// Read-modify-write under the per-file write window.
    ///
    /// The mutated record is persisted at the current schema version.
    pub fn update<F>(&self, file_id: &FileId, mutate: F) -> Result<AttributeRecord>
    where
        F: FnOnce(&mut AttributeRecord) -> Result<()>,
    {
        let guard = self.locks.acquire(*file_id, self.lock_wait)?;
        let current = self.read(file_id)?.ok_or(Error::RecordNotFound(*file_id))?;

        let mut record = current.record.clone();
        mutate(&mut record)?;
        if record.file_id != *file_id {
            return Err(Error::invalid_argument("update may not change file_id"));
        }
        if record.version < current.record.version {
            return Err(Error::invalid_argument(format!(
                "update may not lower version of {file_id}"
            )));
        }
        record.schema_version = SCHEMA_VERSION;

        self.stage_locked(guard, &record, current.overflow_key)?
            .commit()?;
        Ok(record)
    }

    /// Mark a record as being deleted. Keeps the first tombstone timestamp.
    pub fn tombstone(&self, file_id: &FileId, at: DateTime<Utc>) -> Result<AttributeRecord> {
        self.update(file_id, |record| {
            record.tombstoned_at.get_or_insert(at);
            Ok(())
        })
    }

    /// Undo [`tombstone`](Self::tombstone)
    pub fn clear_tombstone(&self, file_id: &FileId) -> Result<AttributeRecord> {
        self.update(file_id, |record| {
            record.tombstoned_at = None;
            Ok(())
        })
    }

    /// Remove the record and its overflow body. Returns whether a record existed.
    pub fn delete(&self, file_id: &FileId) -> Result<bool> {
        let _guard = self.locks.acquire(*file_id, self.lock_wait)?;
        let path = self.record_path(file_id);
        let overflow_key = read_optional(&path)?
            .and_then(|bytes| StoredRecord::decode(&bytes).ok())
            .and_then(|(stored, _)| stored.overflow_key().map(str::to_string));

        let existed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        sync_dir(&self.dir)?;
        if let Some(key) = overflow_key {
            self.overflow.delete(&key)?;
        }
        Ok(existed)
    }

    /// Ids of all committed records on this node
    pub fn list_file_ids(&self) -> Result<Vec<FileId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(RECORD_EXT)
                && let Ok(id) = stem.parse()
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove what interrupted writes left behind: temp record files and
    /// overflow bodies no committed pointer names. Skips files inside a
    /// write window.
    pub fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(file_id) = temp_owner(name) else {
                continue;
            };
            if self.locks.is_locked(&file_id) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        removed += self.sweep_overflow_bodies()?;
        if removed > 0 {
            debug!(dir = %self.dir.display(), removed, "Swept attribute write leftovers");
        }
        Ok(removed)
    }

    fn sweep_overflow_bodies(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.overflow.keys(&node_prefix(&self.node_id))? {
            let Some(file_id) = body_owner(&key) else {
                continue;
            };
            // A held window may be about to publish this body
            let Ok(_guard) = self.locks.acquire(file_id, Duration::ZERO) else {
                continue;
            };
            let referenced = read_optional(&self.record_path(&file_id))?
                .and_then(|bytes| StoredRecord::decode(&bytes).ok())
                .is_some_and(|(stored, _)| stored.overflow_key() == Some(key.as_str()));
            if !referenced {
                self.overflow.delete(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn stage_locked<'a>(
        &'a self,
        guard: FileLockGuard<'a>,
        record: &AttributeRecord,
        previous_key: Option<String>,
    ) -> Result<StagedRecord<'a>> {
        let inline = StoredRecord::Inline(record.clone()).encode()?;
        let (bytes, new_key) = if inline.len() > self.inline_limit {
            // The body must be durable before a pointer to it can be published
            let key = new_body_key(&self.node_id, &record.file_id);
            self.overflow.put(&key, &serde_json::to_vec(record)?)?;
            let pointer = StoredRecord::Pointer {
                file_id: record.file_id,
                overflow_key: key.clone(),
            };
            (pointer.encode()?, Some(key))
        } else {
            (inline, None)
        };

        let staged = StagedRecord {
            store: self,
            _guard: guard,
            file_id: record.file_id,
            temp_path: self.dir.join(format!(
                ".{}.{}{TEMP_EXT}",
                record.file_id,
                Uuid::new_v4().simple()
            )),
            new_key,
            previous_key,
            committed: false,
        };
        // Dropping `staged` on failure removes the temp file and the new body
        write_synced(&staged.temp_path, &bytes)?;
        Ok(staged)
    }
}

/// A fully written, fsynced, but not yet visible record
pub struct StagedRecord<'a> {
    store: &'a AttributeStore,
    _guard: FileLockGuard<'a>,
    file_id: FileId,
    temp_path: PathBuf,
    /// Overflow body written for this record
    new_key: Option<String>,
    /// Overflow body of the record being replaced
    previous_key: Option<String>,
    committed: bool,
}

impl StagedRecord<'_> {
    /// Publish the record with an atomic rename
    pub fn commit(mut self) -> Result<()> {
        let target = self.store.record_path(&self.file_id);
        fs::rename(&self.temp_path, &target)?;
        self.committed = true;
        sync_dir(&self.store.dir)?;

        if let Some(key) = &self.previous_key
            && let Err(e) = self.store.overflow.delete(key)
        {
            warn!(file_id = %self.file_id, error = %e, "Failed to clear replaced overflow body");
        }
        Ok(())
    }
}

impl Drop for StagedRecord<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let _ = fs::remove_file(&self.temp_path);
        if let Some(key) = &self.new_key
            && let Err(e) = self.store.overflow.delete(key)
        {
            warn!(file_id = %self.file_id, error = %e, "Failed to clear unpublished overflow body");
        }
    }
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Make a rename in `dir` durable
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

pub(crate) async fn sync_dir_async(dir: &Path) -> io::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || sync_dir(&dir))
        .await
        .map_err(io::Error::other)?
}

/// File id a temp file belongs to: `.<file_id>.<nonce>.tmp`
fn temp_owner(name: &str) -> Option<FileId> {
    let rest = name.strip_prefix('.')?.strip_suffix(TEMP_EXT)?;
    let (id, _nonce) = rest.split_once('.')?;
    id.parse().ok()
}
