//! Lazy schema upgrades
//!
//! Records are upgraded in memory when read. The upgraded form is persisted
//! the next time the record is written.

use super::record::SCHEMA_VERSION;
use archivum_common::{Error, Result};
use serde_json::{Map, Value};

/// Upgrade a raw record to the current schema.
///
/// Returns the upgraded value and whether anything changed.
pub fn upgrade(mut value: Value) -> Result<(Value, bool)> {
    let Value::Object(map) = &mut value else {
        return Err(Error::Serialization(
            "attribute record is not a JSON object".into(),
        ));
    };

    let version = map
        .get("schema_version")
        .and_then(Value::as_u64)
        .map_or(1, |v| u32::try_from(v).unwrap_or(u32::MAX));

    if version > SCHEMA_VERSION {
        return Err(Error::invalid_state(format!(
            "record schema {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok((value, false));
    }

    v1_to_v2(map);
    Ok((value, true))
}

// v1 named the digest `checksum` and the node `storage_node`, and had no
// custom attributes or finalization timestamp.
fn v1_to_v2(map: &mut Map<String, Value>) {
    rename(map, "checksum", "sha256");
    rename(map, "storage_node", "storage_node_id");
    map.entry("custom_attributes")
        .or_insert_with(|| Value::Object(Map::new()));
    map.entry("finalized_at").or_insert(Value::Null);
    map.entry("ttl_expires_at").or_insert(Value::Null);
    map.insert("schema_version".into(), Value::from(2));
}

fn rename(map: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(v) = map.remove(from) {
        map.entry(to).or_insert(v);
    }
}
