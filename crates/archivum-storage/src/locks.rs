//! Advisory per-file write exclusion
//!
//! Writers to the same `file_id` are serialized so they never race on temp
//! file naming or rename ordering. Readers never take these locks: the atomic
//! rename already guarantees they observe a complete record.

use archivum_common::{Error, FileId, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Set of files currently inside a write window
#[derive(Default)]
pub struct FileLocks {
    held: Mutex<HashSet<FileId>>,
    released: Condvar,
}

impl FileLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the write window for `file_id`, waiting at most `wait`
    pub fn acquire(&self, file_id: FileId, wait: Duration) -> Result<FileLockGuard<'_>> {
        let deadline = Instant::now() + wait;
        let mut held = self.held.lock();
        while held.contains(&file_id) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&file_id)
            {
                return Err(Error::lock_contention(format!("file {file_id}")));
            }
        }
        held.insert(file_id);
        Ok(FileLockGuard {
            locks: self,
            file_id,
        })
    }

    /// Whether a writer currently holds `file_id`
    #[must_use]
    pub fn is_locked(&self, file_id: &FileId) -> bool {
        self.held.lock().contains(file_id)
    }
}

/// Releases the write window on drop
pub struct FileLockGuard<'a> {
    locks: &'a FileLocks,
    file_id: FileId,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.file_id);
        self.locks.released.notify_all();
    }
}
