//! Attribute records: the authoritative metadata of each file
//!
//! One JSON document per file lives beside the file bytes on the node that
//! holds them. Documents are replaced atomically, so a reader sees either
//! the previous complete record or the new one.

mod migrate;
mod overflow;
mod record;
mod store;

pub use overflow::{MemoryOverflowStore, OverflowStore};
pub use record::{AttributeRecord, RecordForm, SCHEMA_VERSION, StoredRecord, decode_record};
pub use store::{AttributeStore, ReadRecord, StagedRecord};
pub(crate) use store::sync_dir_async;

#[cfg(test)]
pub(crate) use record::sample;
