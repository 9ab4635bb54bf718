//! File byte storage for one node
//!
//! Bytes are written to a temp file, fsynced and renamed into place, the
//! same way attribute records are. Every write hashes while streaming so the
//! caller learns the SHA-256 without a second pass.

use crate::attributes::sync_dir_async;
use archivum_common::{Error, FileId, Result, Sha256Calculator, checksum::digests_match};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_EXT: &str = ".part";
const READ_CHUNK: usize = 256 * 1024;

/// Size and digest of a stored file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
    pub sha256: String,
}

/// One physical file found on disk
#[derive(Clone, Debug)]
pub struct BlobEntry {
    pub file_id: FileId,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Directory of file bytes keyed by file id
pub struct BlobStore {
    dir: PathBuf,
    used: AtomicU64,
}

impl BlobStore {
    /// Open (creating if needed) the blob directory and tally its usage
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let store = Self {
            dir,
            used: AtomicU64::new(0),
        };
        let used = store.list().await?.iter().map(|e| e.size).sum();
        store.used.store(used, Ordering::Relaxed);
        Ok(store)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, file_id: &FileId) -> PathBuf {
        self.dir.join(file_id.to_string())
    }

    /// Bytes currently held by committed files
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub async fn exists(&self, file_id: &FileId) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(file_id)).await?)
    }

    pub async fn size(&self, file_id: &FileId) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(file_id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store the contents of `src` under `file_id`.
    ///
    /// Idempotent: if the file already exists with the expected digest the
    /// existing copy is kept. Fails with `ChecksumMismatch` if the bytes
    /// read from `src` do not hash to `expected_sha256`.
    pub async fn put_from_path(
        &self,
        file_id: &FileId,
        src: &Path,
        expected_sha256: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobInfo> {
        if let Some(size) = self.size(file_id).await? {
            let existing = self.sha256(file_id).await?;
            if digests_match(expected_sha256, &existing) {
                debug!(%file_id, "File bytes already present");
                return Ok(BlobInfo {
                    size,
                    sha256: existing,
                });
            }
        }

        let mut reader = File::open(src).await?;
        self.write_verified(file_id, &mut reader, READ_CHUNK, expected_sha256, cancel)
            .await
    }

    /// Copy `file_id` into `dest`, checking `cancel` between chunks.
    ///
    /// On cancellation or failure nothing is left behind on `dest`.
    pub async fn copy_to(
        &self,
        file_id: &FileId,
        dest: &Self,
        chunk_bytes: usize,
        expected_sha256: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobInfo> {
        let mut reader = File::open(self.path_for(file_id)).await?;
        dest.write_verified(file_id, &mut reader, chunk_bytes, expected_sha256, cancel)
            .await
    }

    async fn write_verified<R>(
        &self,
        file_id: &FileId,
        reader: &mut R,
        chunk_bytes: usize,
        expected_sha256: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let temp_path = self.temp_path(file_id);
        let info = match self
            .stream_to_temp(&temp_path, reader, chunk_bytes, cancel)
            .await
        {
            Ok(info) if digests_match(expected_sha256, &info.sha256) => info,
            Ok(info) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(Error::ChecksumMismatch {
                    expected: expected_sha256.to_string(),
                    actual: info.sha256,
                });
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        self.publish(file_id, &temp_path, info.size).await?;
        Ok(info)
    }

    async fn stream_to_temp<R>(
        &self,
        temp_path: &Path,
        reader: &mut R,
        chunk_bytes: usize,
        cancel: &CancellationToken,
    ) -> Result<BlobInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await?;
        let mut hasher = Sha256Calculator::new();
        let mut buf = vec![0u8; chunk_bytes.max(1)];

        loop {
            let n = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                n = reader.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(BlobInfo {
            size: hasher.bytes(),
            sha256: hasher.finalize_hex(),
        })
    }

    async fn publish(&self, file_id: &FileId, temp_path: &Path, size: u64) -> Result<()> {
        let target = self.path_for(file_id);
        let replaced = self.size(file_id).await?.unwrap_or(0);
        if let Err(e) = fs::rename(temp_path, &target).await {
            let _ = fs::remove_file(temp_path).await;
            return Err(e.into());
        }
        sync_dir_async(&self.dir).await?;
        self.used.fetch_add(size, Ordering::Relaxed);
        self.release_usage(replaced);
        Ok(())
    }

    /// Recompute the SHA-256 of a stored file
    pub async fn sha256(&self, file_id: &FileId) -> Result<String> {
        Ok(digest_file(&self.path_for(file_id)).await?.sha256)
    }

    /// Re-read the stored bytes and compare against `expected`
    pub async fn verify(&self, file_id: &FileId, expected: &str) -> Result<()> {
        let actual = self.sha256(file_id).await?;
        if digests_match(expected, &actual) {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// Remove a stored file. Returns whether it existed.
    pub async fn delete(&self, file_id: &FileId) -> Result<bool> {
        let path = self.path_for(file_id);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.release_usage(size);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All committed files on disk
    pub async fn list(&self) -> Result<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(Ok(file_id)) = name.to_str().map(str::parse::<FileId>) else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
            entries.push(BlobEntry {
                file_id,
                size: meta.len(),
                modified,
            });
        }
        Ok(entries)
    }

    /// Remove partial files left by interrupted writes.
    ///
    /// Files whose id `in_use` reports as busy belong to a write still in
    /// flight and are left alone.
    pub async fn sweep_temp_files(&self, in_use: impl Fn(&FileId) -> bool) -> Result<usize> {
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_prefix('.').filter(|n| n.ends_with(TEMP_EXT)) else {
                continue;
            };
            if stem
                .split('.')
                .next()
                .and_then(|id| id.parse::<FileId>().ok())
                .is_some_and(|id| in_use(&id))
            {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to sweep partial file"),
            }
        }
        Ok(removed)
    }

    fn temp_path(&self, file_id: &FileId) -> PathBuf {
        self.dir
            .join(format!(".{file_id}.{}{TEMP_EXT}", Uuid::new_v4().simple()))
    }

    fn release_usage(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// Size and SHA-256 of any file, read in chunks
pub async fn digest_file(path: &Path) -> Result<BlobInfo> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256Calculator::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(BlobInfo {
        size: hasher.bytes(),
        sha256: hasher.finalize_hex(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivum_common::sha256_hex;
    use tempfile::tempdir;

    async fn spool(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("upload.spool");
        fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_put_from_path_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = BlobStore::open(temp.path().join("blobs")).await.unwrap();
        let data = b"hello archive";
        let src = spool(temp.path(), data).await;
        let file_id = FileId::new();
        let sha = sha256_hex(data);
        let cancel = CancellationToken::new();

        let info = store.put_from_path(&file_id, &src, &sha, &cancel).await.unwrap();
        assert_eq!(info.size, data.len() as u64);
        assert_eq!(info.sha256, sha);
        assert_eq!(store.used_bytes(), data.len() as u64);

        store.put_from_path(&file_id, &src, &sha, &cancel).await.unwrap();
        assert_eq!(store.used_bytes(), data.len() as u64);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_digest() {
        let temp = tempdir().unwrap();
        let store = BlobStore::open(temp.path().join("blobs")).await.unwrap();
        let src = spool(temp.path(), b"abc").await;
        let file_id = FileId::new();

        let err = store
            .put_from_path(&file_id, &src, &sha256_hex(b"xyz"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!store.exists(&file_id).await.unwrap());
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_copy_to_verifies_and_cancels_cleanly() {
        let temp = tempdir().unwrap();
        let source = BlobStore::open(temp.path().join("a")).await.unwrap();
        let target = BlobStore::open(temp.path().join("b")).await.unwrap();
        let data = vec![7u8; 64 * 1024];
        let sha = sha256_hex(&data);
        let file_id = FileId::new();
        let src = spool(temp.path(), &data).await;
        source
            .put_from_path(&file_id, &src, &sha, &CancellationToken::new())
            .await
            .unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = source
            .copy_to(&file_id, &target, 4096, &sha, &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!target.exists(&file_id).await.unwrap());
        let mut leftovers = fs::read_dir(target.dir()).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());

        let info = source
            .copy_to(&file_id, &target, 4096, &sha, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.sha256, sha);
        target.verify(&file_id, &sha).await.unwrap();
        assert_eq!(target.used_bytes(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_delete_and_sweep() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("blobs");
        let store = BlobStore::open(&dir).await.unwrap();
        let file_id = FileId::new();
        let src = spool(temp.path(), b"bytes").await;
        store
            .put_from_path(&file_id, &src, &sha256_hex(b"bytes"), &CancellationToken::new())
            .await
            .unwrap();

        fs::write(dir.join(format!(".{file_id}.dead{TEMP_EXT}")), b"par")
            .await
            .unwrap();
        assert_eq!(store.sweep_temp_files(|id| *id == file_id).await.unwrap(), 0);
        assert_eq!(store.sweep_temp_files(|_| false).await.unwrap(), 1);

        assert!(store.delete(&file_id).await.unwrap());
        assert!(!store.delete(&file_id).await.unwrap());
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_open_tallies_existing_usage() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("blobs");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(FileId::new().to_string()), vec![0u8; 100])
            .await
            .unwrap();
        fs::write(dir.join("not-a-file-id"), b"ignored").await.unwrap();

        let store = BlobStore::open(&dir).await.unwrap();
        assert_eq!(store.used_bytes(), 100);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
