//! Archivum per-node storage
//!
//! A storage node keeps two things side by side: the file bytes in a
//! [`BlobStore`] and the authoritative attribute record for each file in an
//! [`AttributeStore`]. Both replace files atomically via temp file, fsync
//! and rename.

pub mod attributes;
pub mod blob;
pub mod locks;

pub use attributes::{
    AttributeRecord, AttributeStore, MemoryOverflowStore, OverflowStore, ReadRecord, RecordForm,
    SCHEMA_VERSION, StagedRecord,
};
pub use blob::{BlobEntry, BlobInfo, BlobStore, digest_file};
pub use locks::{FileLockGuard, FileLocks};
