use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::dynlib::DsoRecord;
use crate::error::{InternalError, Result};

/// Schema version of the metadata blob inside current artifacts. Legacy
/// blobs carry no `version` key at all and decode through
/// [SnapshotMeta::is_legacy].
pub const META_VERSION: u32 = 1;

/// What a snapshot contains, and therefore what it can be reused for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    /// Only the fixed import prelude; reusable across all workers.
    Baseline,
    /// Additionally warms the worker's own top-level imports.
    Package,
    /// Captured after the user's top-level code ran, host-object table
    /// included.
    Dedicated,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Baseline => "baseline",
            SnapshotType::Package => "package",
            SnapshotType::Dedicated => "dedicated",
        }
    }
}

impl std::fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outstanding dlopen-style handles of one library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsoHandles {
    pub handles: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub snapshot_type: SnapshotType,
    #[serde(default)]
    pub compat_flags: BTreeMap<String, bool>,
}

/// The JSON metadata blob of a snapshot artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u32,
    pub imported_modules_list: Option<Vec<String>>,
    pub hiwire: Option<serde_json::Value>,
    #[serde(default)]
    pub dso_handles: BTreeMap<String, DsoHandles>,
    #[serde(default)]
    pub load_order: Vec<String>,
    #[serde(default)]
    pub so_memory_bases: IndexMap<String, u32>,
    #[serde(default)]
    pub so_table_bases: IndexMap<String, u32>,
    pub settings: SnapshotSettings,
}

impl SnapshotMeta {
    /// Builds the metadata for a capture.
    pub fn from_record(
        record: &DsoRecord,
        imported_modules_list: Option<Vec<String>>,
        hiwire: Option<serde_json::Value>,
        settings: SnapshotSettings,
    ) -> Self {
        SnapshotMeta {
            version: META_VERSION,
            imported_modules_list,
            hiwire,
            dso_handles: record
                .handles
                .iter()
                .map(|(path, handles)| (path.clone(), DsoHandles { handles: handles.clone() }))
                .collect(),
            load_order: record.load_order.clone(),
            so_memory_bases: record.memory_bases.clone(),
            so_table_bases: record.table_bases.clone(),
            settings,
        }
    }

    /// The placement record to seed a restore's loader with.
    pub fn dso_record(&self) -> DsoRecord {
        DsoRecord {
            memory_bases: self.so_memory_bases.clone(),
            table_bases: self.so_table_bases.clone(),
            load_order: self.load_order.clone(),
            handles: self
                .dso_handles
                .iter()
                .map(|(path, dso)| (path.clone(), dso.handles.clone()))
                .collect(),
        }
    }

    /// Whether this metadata came out of a pre-versioning artifact.
    pub fn is_legacy(&self) -> bool {
        self.version == 0
    }
}

/// Decodes the metadata blob, accepting both the current schema and the
/// legacy variant without a `version` key.
pub fn decode_meta(bytes: &[u8]) -> Result<SnapshotMeta, InternalError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| InternalError::MalformedMetadata(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(InternalError::MalformedMetadata("top level is not an object".to_owned()));
    };
    if object.contains_key("version") {
        serde_json::from_value(value).map_err(|e| InternalError::MalformedMetadata(e.to_string()))
    } else {
        decode_legacy_meta(object)
    }
}

/// The legacy variant: every top-level key is a `dso_handles` entry, except
/// `settings`, whose `baselineSnapshot` flag is what snapshot types grew out
/// of.
fn decode_legacy_meta(object: &serde_json::Map<String, serde_json::Value>) -> Result<SnapshotMeta, InternalError> {
    let mut dso_handles = BTreeMap::new();
    let mut snapshot_type = SnapshotType::Package;
    for (key, value) in object {
        if key == "settings" {
            if value.get("baselineSnapshot").is_some_and(is_truthy) {
                snapshot_type = SnapshotType::Baseline;
            }
            continue;
        }
        let handles: DsoHandles = serde_json::from_value(value.clone())
            .map_err(|e| InternalError::MalformedMetadata(format!("dso entry `{key}`: {e}")))?;
        dso_handles.insert(key.clone(), handles);
    }
    Ok(SnapshotMeta {
        version: 0,
        imported_modules_list: None,
        hiwire: None,
        dso_handles,
        load_order: Vec::new(),
        so_memory_bases: IndexMap::new(),
        so_table_bases: IndexMap::new(),
        settings: SnapshotSettings {
            snapshot_type,
            compat_flags: BTreeMap::new(),
        },
    })
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}
