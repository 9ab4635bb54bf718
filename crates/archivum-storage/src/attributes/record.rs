//! Attribute record schema and on-disk forms

use super::migrate;
use archivum_common::{Error, FileId, NodeId, Result, RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 2;

/// Authoritative per-file metadata document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub file_id: FileId,
    pub original_filename: String,
    pub storage_filename: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub version: u64,
    pub file_size: u64,
    pub mime_type: String,
    pub sha256: String,
    pub retention_policy: RetentionPolicy,
    pub ttl_expires_at: Option<DateTime<Utc>>,
    pub storage_node_id: NodeId,
    pub finalized_at: Option<DateTime<Utc>>,
    pub schema_version: u32,
    #[serde(default)]
    pub custom_attributes: Map<String, Value>,
    /// Set by a delete saga before the record is purged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl AttributeRecord {
    /// Whether a delete is in progress for this record
    #[must_use]
    pub const fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    /// Whether the TTL of a temporary record has passed
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retention_policy == RetentionPolicy::Temporary
            && self.ttl_expires_at.is_some_and(|at| at <= now)
    }
}

/// Which form a record file holds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordForm {
    /// Full record in the record file
    Inline,
    /// Record file holds the id and an overflow key; the body lives in the overflow store
    Pointer,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordPointer {
    file_id: FileId,
    overflow_key: String,
}

/// Decoded contents of a record file
#[derive(Clone, Debug, PartialEq)]
pub enum StoredRecord {
    Inline(AttributeRecord),
    Pointer { file_id: FileId, overflow_key: String },
}

impl StoredRecord {
    /// Serialize for the record file
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Inline(record) => Ok(serde_json::to_vec_pretty(record)?),
            Self::Pointer {
                file_id,
                overflow_key,
            } => Ok(serde_json::to_vec(&RecordPointer {
                file_id: *file_id,
                overflow_key: overflow_key.clone(),
            })?),
        }
    }

    /// Overflow row a pointer names
    #[must_use]
    pub fn overflow_key(&self) -> Option<&str> {
        match self {
            Self::Inline(_) => None,
            Self::Pointer { overflow_key, .. } => Some(overflow_key),
        }
    }

    /// Parse a record file, upgrading legacy inline records.
    ///
    /// Returns the record and whether an upgrade was applied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, bool)> {
        let value: Value = serde_json::from_slice(bytes)?;
        if let Value::Object(map) = &value
            && map.len() == 2
            && map.contains_key("overflow_key")
        {
            let pointer: RecordPointer = serde_json::from_value(value)?;
            return Ok((
                Self::Pointer {
                    file_id: pointer.file_id,
                    overflow_key: pointer.overflow_key,
                },
                false,
            ));
        }
        let (record, migrated) = decode_record_value(value)?;
        Ok((Self::Inline(record), migrated))
    }
}

/// Parse a full record body (record file or overflow row)
pub fn decode_record(bytes: &[u8]) -> Result<(AttributeRecord, bool)> {
    decode_record_value(serde_json::from_slice(bytes)?)
}

fn decode_record_value(value: Value) -> Result<(AttributeRecord, bool)> {
    let (value, migrated) = migrate::upgrade(value)?;
    let record: AttributeRecord = serde_json::from_value(value)
        .map_err(|e| Error::Serialization(format!("malformed attribute record: {e}")))?;
    Ok((record, migrated))
}

#[cfg(test)]
pub(crate) fn sample(node: &str) -> AttributeRecord {
    AttributeRecord {
        file_id: FileId::new(),
        original_filename: "report.pdf".into(),
        storage_filename: "report-1.pdf".into(),
        uploaded_by: "alice".into(),
        uploaded_at: Utc::now(),
        version: 1,
        file_size: 1024,
        mime_type: "application/pdf".into(),
        sha256: archivum_common::sha256_hex(b"report"),
        retention_policy: RetentionPolicy::Temporary,
        ttl_expires_at: Some(Utc::now() + chrono::Duration::days(7)),
        storage_node_id: NodeId::new(node),
        finalized_at: None,
        schema_version: SCHEMA_VERSION,
        custom_attributes: Map::new(),
        tombstoned_at: None,
    }
}
