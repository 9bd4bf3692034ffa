//! Primary-key remap planning.
//!
//! When remapping is enabled, records of tables whose primary key is a
//! single auto-generated column get a map entry. The replay writer inserts
//! those rows without their key column and captures the target-assigned
//! value into a session-scoped mapping table; referencing columns read the
//! captured value back. Any non-identity or composite key component
//! disqualifies the table, and its rows keep their literal keys.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{DumpError, Result};
use crate::graph::{PkValue, RecordData, RecordIdentifier};
use crate::schema::SchemaGraph;

/// One remapped record: where its captured key lives in the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapEntry {
    /// Mapping-table key: the qualified table name.
    pub table_key: String,
    /// Mapping-table key: the serialized original primary key.
    pub old_pk: String,
}

/// Remap plan for one run.
pub type PkMap = BTreeMap<RecordIdentifier, RemapEntry>;

/// Serialize a primary key tuple for the mapping table: scalar keys store
/// their plain text form, composite keys a JSON array (composite keys never
/// remap, but the serialization stays total for diagnostics).
pub fn serialize_pk(pk: &[PkValue]) -> String {
    if pk.len() == 1 {
        pk[0].to_string()
    } else {
        let parts: Vec<String> = pk.iter().map(|v| v.to_string()).collect();
        serde_json::to_string(&parts).unwrap_or_else(|_| parts.join(","))
    }
}

/// Build the remap plan. Fails when a record that must be remapped sits
/// inside a dependency cycle: the captured key for one row would depend on
/// inserting the other and vice versa.
pub fn build_pk_map(
    records: &BTreeMap<RecordIdentifier, RecordData>,
    graph: &SchemaGraph,
    cycle_members: &BTreeSet<RecordIdentifier>,
) -> Result<PkMap> {
    let mut map = PkMap::new();

    for id in records.keys() {
        let Some(table) = graph.get(&id.table) else {
            continue;
        };
        if !table.has_remappable_pk() {
            continue;
        }
        if cycle_members.contains(id) {
            return Err(DumpError::CycleDetected(id.to_string()));
        }
        map.insert(
            id.clone(),
            RemapEntry {
                table_key: id.table.qualified(),
                old_pk: serialize_pk(&id.pk),
            },
        );
    }

    debug!("Remapping {} of {} records", map.len(), records.len());
    Ok(map)
}
