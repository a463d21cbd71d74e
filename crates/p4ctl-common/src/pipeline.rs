//! Pipeline descriptor adapter.
//!
//! The descriptor is the pre-parsed mapping from symbolic program
//! names (tables, match fields, actions, parameters) to the numeric
//! identifiers the device runtime expects. It is loaded once at
//! startup, validated, and shared read-only afterwards; every name a
//! rule references must resolve here at load time.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};
use crate::types::MatchKind;

/// One match-key field of a table.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchFieldInfo {
    /// Symbolic field name (e.g., "hdr.ipv4.dstAddr").
    pub name: String,
    /// Numeric field id.
    pub id: u32,
    /// Field width in bits.
    pub bits: u32,
    /// Match kind required for this field.
    pub match_type: MatchKind,
}

/// One match-action table.
#[derive(Debug, Clone, Deserialize)]
pub struct TableInfo {
    /// Symbolic table name (e.g., "MyIngress.ipv4_lpm").
    pub name: String,
    /// Numeric table id.
    pub id: u32,
    /// Match fields in the order the device expects them.
    #[serde(default)]
    pub match_fields: Vec<MatchFieldInfo>,
}

impl TableInfo {
    /// Match kind of the table, taken from its first field.
    ///
    /// Tables with no match fields (config tables programmed only
    /// through their default action) report `Exact`.
    pub fn match_kind(&self) -> MatchKind {
        self.match_fields
            .first()
            .map(|f| f.match_type)
            .unwrap_or(MatchKind::Exact)
    }
}

/// One action parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionParamInfo {
    /// Symbolic parameter name.
    pub name: String,
    /// Numeric parameter id.
    pub id: u32,
    /// Parameter width in bits.
    pub bits: u32,
}

/// One action.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionInfo {
    /// Symbolic action name (e.g., "MyIngress.ipv4_forward").
    pub name: String,
    /// Numeric action id.
    pub id: u32,
    /// Parameters in the order the device expects them.
    #[serde(default)]
    pub params: Vec<ActionParamInfo>,
}

/// On-disk descriptor document.
#[derive(Debug, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    tables: Vec<TableInfo>,
    #[serde(default)]
    actions: Vec<ActionInfo>,
}

/// Immutable name-to-identifier mapping for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    tables: HashMap<String, TableInfo>,
    actions: HashMap<String, ActionInfo>,
}

impl PipelineDescriptor {
    /// Loads and validates a descriptor from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::parse(path, message),
            other => other,
        })
    }

    /// Parses a descriptor from a JSON string.
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let file: DescriptorFile = serde_json::from_str(text)
            .map_err(|e| ConfigError::parse("<inline>", e.to_string()))?;

        let mut tables = HashMap::new();
        for table in file.tables {
            if tables.insert(table.name.clone(), table).is_some() {
                return Err(ConfigError::parse("<inline>", "duplicate table name"));
            }
        }
        let mut actions = HashMap::new();
        for action in file.actions {
            if actions.insert(action.name.clone(), action).is_some() {
                return Err(ConfigError::parse("<inline>", "duplicate action name"));
            }
        }

        Ok(Self { tables, actions })
    }

    /// Resolves a symbolic table name.
    pub fn table(&self, name: &str) -> ConfigResult<&TableInfo> {
        self.tables
            .get(name)
            .ok_or_else(|| ConfigError::resolution(name, "table not found in pipeline descriptor"))
    }

    /// Resolves a symbolic action name.
    pub fn action(&self, name: &str) -> ConfigResult<&ActionInfo> {
        self.actions
            .get(name)
            .ok_or_else(|| ConfigError::resolution(name, "action not found in pipeline descriptor"))
    }

    /// Whether the descriptor defines the given table.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// All known table ids, for device-side validation.
    pub fn table_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.tables.values().map(|t| t.id)
    }

    /// All known action ids, for device-side validation.
    pub fn action_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.actions.values().map(|a| a.id)
    }
}
