//! Rule set loader.
//!
//! Translates declarative per-device rule files (the runtime JSON
//! format emitted alongside compiled pipelines) into validated
//! [`RuleBatch`] values. No device I/O happens here; every symbolic
//! name is resolved against the pipeline descriptor at load time so
//! sessions only ever see well-formed numeric entries.
//!
//! A malformed file fails as a whole. Callers are told it failed
//! rather than receiving a partial batch.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::pipeline::PipelineDescriptor;
use crate::types::{MatchKind, MatchValue, RuleBatch, TableEntry};

/// On-disk rule file: an ordered list of raw table entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRuleFile {
    /// Entries in source order.
    #[serde(default)]
    pub table_entries: Vec<RawTableEntry>,
}

/// One unresolved table entry as written in a rule file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTableEntry {
    /// Symbolic table name.
    pub table: String,
    /// Whether this entry sets the table's default (miss) action.
    #[serde(default)]
    pub default_action: bool,
    /// Symbolic match-field name to value. Exact fields take a
    /// scalar; LPM takes `[value, prefix_len]`; ternary takes
    /// `[value, mask]`.
    #[serde(rename = "match", default)]
    pub match_fields: HashMap<String, Value>,
    /// Symbolic action name.
    pub action_name: String,
    /// Symbolic parameter name to value.
    #[serde(default)]
    pub action_params: HashMap<String, Value>,
    /// Tie-break priority for LPM/ternary tables.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl RawTableEntry {
    /// Builds a default-action entry programmatically, the way the
    /// daemon synthesizes its threshold configuration rule.
    pub fn new_default(
        table: impl Into<String>,
        action_name: impl Into<String>,
        action_params: Vec<(String, Value)>,
    ) -> Self {
        Self {
            table: table.into(),
            default_action: true,
            match_fields: HashMap::new(),
            action_name: action_name.into(),
            action_params: action_params.into_iter().collect(),
            priority: None,
        }
    }
}

/// Loads a rule file. All-or-nothing: any parse problem fails the
/// whole file.
pub fn load(path: impl AsRef<Path>) -> ConfigResult<RawRuleFile> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::parse(path, e.to_string()))
}

/// Resolves one raw entry against the descriptor.
///
/// Every match field the table defines must be present (and no
/// others); action parameters likewise. Default entries carry no
/// match key and no priority.
pub fn resolve(raw: &RawTableEntry, descriptor: &PipelineDescriptor) -> ConfigResult<TableEntry> {
    let table = descriptor.table(&raw.table)?;
    let action = descriptor.action(&raw.action_name)?;

    // Action parameters, in descriptor-defined order.
    let mut action_params = Vec::with_capacity(action.params.len());
    for param in &action.params {
        let value = raw.action_params.get(&param.name).ok_or_else(|| {
            ConfigError::resolution(
                format!("{}.{}", action.name, param.name),
                "action parameter missing from rule",
            )
        })?;
        action_params.push(encode_value(value, param.bits, &param.name)?);
    }
    for name in raw.action_params.keys() {
        if !action.params.iter().any(|p| &p.name == name) {
            return Err(ConfigError::resolution(
                format!("{}.{}", action.name, name),
                "parameter not defined for this action",
            ));
        }
    }

    if raw.default_action {
        if !raw.match_fields.is_empty() {
            return Err(ConfigError::resolution(
                &raw.table,
                "default-action entry must not carry a match key",
            ));
        }
        if raw.priority.is_some() {
            return Err(ConfigError::resolution(
                &raw.table,
                "default-action entry must not carry a priority",
            ));
        }
        return Ok(TableEntry {
            table_id: table.id,
            table_name: table.name.clone(),
            match_key: Vec::new(),
            action_id: action.id,
            action_params,
            priority: None,
            is_default: true,
        });
    }

    // Match key, in descriptor-defined order.
    let mut match_key = Vec::with_capacity(table.match_fields.len());
    for field in &table.match_fields {
        let value = raw.match_fields.get(&field.name).ok_or_else(|| {
            ConfigError::resolution(&field.name, "match field missing from rule")
        })?;
        match_key.push(encode_match(value, field.match_type, field.bits, &field.name)?);
    }
    for name in raw.match_fields.keys() {
        if !table.match_fields.iter().any(|f| &f.name == name) {
            return Err(ConfigError::resolution(
                name,
                "match field not defined for this table",
            ));
        }
    }

    let needs_priority = table
        .match_fields
        .iter()
        .any(|f| f.match_type.requires_priority());
    if needs_priority && raw.priority.is_none() {
        return Err(ConfigError::resolution(
            &raw.table,
            "lpm/ternary entry requires a priority",
        ));
    }
    if !needs_priority && raw.priority.is_some() {
        return Err(ConfigError::resolution(
            &raw.table,
            "exact-match entry must not carry a priority",
        ));
    }

    Ok(TableEntry {
        table_id: table.id,
        table_name: table.name.clone(),
        match_key,
        action_id: action.id,
        action_params,
        priority: raw.priority,
        is_default: false,
    })
}

/// Resolves a whole rule file into one device's batch, preserving
/// source order.
pub fn build_batch(
    device: impl Into<String>,
    file: &RawRuleFile,
    descriptor: &PipelineDescriptor,
) -> ConfigResult<RuleBatch> {
    let mut batch = RuleBatch::new(device);
    for raw in &file.table_entries {
        batch.entries.push(resolve(raw, descriptor)?);
    }
    Ok(batch)
}

fn encode_match(
    value: &Value,
    kind: MatchKind,
    bits: u32,
    field: &str,
) -> ConfigResult<MatchValue> {
    match kind {
        MatchKind::Exact => Ok(MatchValue::Exact {
            value: encode_value(value, bits, field)?,
        }),
        MatchKind::Lpm => {
            let (value, len) = pair(value, field)?;
            let prefix_len = len.as_u64().ok_or_else(|| {
                ConfigError::resolution(field, "lpm prefix length must be an integer")
            })?;
            if prefix_len > u64::from(bits) {
                return Err(ConfigError::resolution(
                    field,
                    format!("prefix length {} exceeds field width {}", prefix_len, bits),
                ));
            }
            Ok(MatchValue::Lpm {
                value: encode_value(value, bits, field)?,
                prefix_len: prefix_len as u8,
            })
        }
        MatchKind::Ternary => {
            let (value, mask) = pair(value, field)?;
            Ok(MatchValue::Ternary {
                value: encode_value(value, bits, field)?,
                mask: encode_value(mask, bits, field)?,
            })
        }
    }
}

fn pair<'a>(value: &'a Value, field: &str) -> ConfigResult<(&'a Value, &'a Value)> {
    match value.as_array().map(|a| a.as_slice()) {
        Some([first, second]) => Ok((first, second)),
        _ => Err(ConfigError::resolution(
            field,
            "expected a two-element [value, length-or-mask] array",
        )),
    }
}

/// Encodes a scalar rule value into a big-endian byte vector sized by
/// the field's bit width.
///
/// Accepted forms: non-negative integers, dotted-quad IPv4 strings,
/// colon-separated hex strings (MAC-style), and "0x"-prefixed hex.
pub fn encode_value(value: &Value, bits: u32, field: &str) -> ConfigResult<Vec<u8>> {
    let width = ((bits + 7) / 8) as usize;

    let bytes = match value {
        Value::Number(n) => {
            let v = n
                .as_u64()
                .ok_or_else(|| ConfigError::resolution(field, "value must be a non-negative integer"))?;
            let skip = 8 - width.min(8);
            if width < 8 && v >> (width * 8) != 0 {
                return Err(ConfigError::resolution(
                    field,
                    format!("value {} does not fit in {} bits", v, bits),
                ));
            }
            v.to_be_bytes()[skip..].to_vec()
        }
        Value::String(s) => {
            if let Ok(addr) = s.parse::<Ipv4Addr>() {
                addr.octets().to_vec()
            } else if s.contains(':') {
                decode_colon_hex(s, field)?
            } else if let Some(hex) = s.strip_prefix("0x") {
                let v = u64::from_str_radix(hex, 16)
                    .map_err(|_| ConfigError::resolution(field, "invalid hex value"))?;
                return encode_value(&Value::from(v), bits, field);
            } else if let Ok(v) = s.parse::<u64>() {
                return encode_value(&Value::from(v), bits, field);
            } else {
                return Err(ConfigError::resolution(
                    field,
                    format!("cannot encode value '{}'", s),
                ));
            }
        }
        _ => {
            return Err(ConfigError::resolution(
                field,
                "value must be an integer or string",
            ))
        }
    };

    fit_width(bytes, width, bits, field)
}

fn decode_colon_hex(s: &str, field: &str) -> ConfigResult<Vec<u8>> {
    s.split(':')
        .map(|part| {
            u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::resolution(field, "invalid colon-hex value"))
        })
        .collect()
}

/// Left-pads to the field's byte width, rejecting values that do not
/// fit the exact bit width.
fn fit_width(bytes: Vec<u8>, width: usize, bits: u32, field: &str) -> ConfigResult<Vec<u8>> {
    if bytes.len() > width {
        return Err(ConfigError::resolution(
            field,
            format!("value is {} bytes but the field holds {} bits", bytes.len(), bits),
        ));
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(&bytes);

    // Partial top byte: the unused high bits must be zero.
    let spare_bits = (width as u32) * 8 - bits;
    if spare_bits > 0 && (out[0] >> (8 - spare_bits)) != 0 {
        return Err(ConfigError::resolution(
            field,
            format!("value does not fit in {} bits", bits),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> PipelineDescriptor {
        PipelineDescriptor::from_json(
            r#"{
                "tables": [
                    {
                        "name": "MyIngress.ipv4_lpm",
                        "id": 1,
                        "match_fields": [
                            {"name": "hdr.ipv4.dstAddr", "id": 1, "bits": 32, "match_type": "lpm"}
                        ]
                    },
                    {
                        "name": "MyIngress.acl",
                        "id": 2,
                        "match_fields": [
                            {"name": "hdr.ethernet.srcAddr", "id": 1, "bits": 48, "match_type": "ternary"}
                        ]
                    },
                    {"name": "MyIngress.ecn_config", "id": 3}
                ],
                "actions": [
                    {
                        "name": "MyIngress.ipv4_forward",
                        "id": 16,
                        "params": [
                            {"name": "dstAddr", "id": 1, "bits": 48},
                            {"name": "port", "id": 2, "bits": 9}
                        ]
                    },
                    {"name": "MyIngress.drop", "id": 17},
                    {
                        "name": "MyIngress.set_ecn_threshold",
                        "id": 18,
                        "params": [{"name": "threshold", "id": 1, "bits": 19}]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    fn lpm_rule() -> RawTableEntry {
        serde_json::from_value(serde_json::json!({
            "table": "MyIngress.ipv4_lpm",
            "match": {"hdr.ipv4.dstAddr": ["10.0.1.1", 32]},
            "action_name": "MyIngress.ipv4_forward",
            "action_params": {"dstAddr": "08:00:00:00:01:11", "port": 1},
            "priority": 1
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_lpm_entry() {
        let entry = resolve(&lpm_rule(), &descriptor()).unwrap();
        assert_eq!(entry.table_id, 1);
        assert_eq!(entry.action_id, 16);
        assert!(!entry.is_default);
        assert_eq!(entry.priority, Some(1));
        assert_eq!(
            entry.match_key,
            vec![MatchValue::Lpm {
                value: vec![10, 0, 1, 1],
                prefix_len: 32
            }]
        );
        // dstAddr is 48 bits wide, port 9 bits wide.
        assert_eq!(entry.action_params[0], vec![0x08, 0, 0, 0, 0x01, 0x11]);
        assert_eq!(entry.action_params[1], vec![0, 1]);
    }

    #[test]
    fn test_resolve_default_entry() {
        let raw = RawTableEntry::new_default(
            "MyIngress.ecn_config",
            "MyIngress.set_ecn_threshold",
            vec![("threshold".to_string(), Value::from(5))],
        );
        let entry = resolve(&raw, &descriptor()).unwrap();
        assert!(entry.is_default);
        assert!(entry.match_key.is_empty());
        assert_eq!(entry.priority, None);
        assert_eq!(entry.action_params, vec![vec![0, 0, 5]]);
    }

    #[test]
    fn test_missing_match_field() {
        let mut raw = lpm_rule();
        raw.match_fields.clear();
        let err = resolve(&raw, &descriptor()).unwrap_err();
        assert!(matches!(err, ConfigError::Resolution { ref field, .. }
            if field == "hdr.ipv4.dstAddr"));
    }

    #[test]
    fn test_extra_match_field() {
        let mut raw = lpm_rule();
        raw.match_fields
            .insert("hdr.ipv4.srcAddr".to_string(), Value::from(1));
        assert!(resolve(&raw, &descriptor()).is_err());
    }

    #[test]
    fn test_missing_action_param() {
        let mut raw = lpm_rule();
        raw.action_params.remove("port");
        assert!(resolve(&raw, &descriptor()).is_err());
    }

    #[test]
    fn test_lpm_requires_priority() {
        let mut raw = lpm_rule();
        raw.priority = None;
        assert!(resolve(&raw, &descriptor()).is_err());
    }

    #[test]
    fn test_default_with_match_key_rejected() {
        let mut raw = lpm_rule();
        raw.default_action = true;
        raw.priority = None;
        assert!(resolve(&raw, &descriptor()).is_err());
    }

    #[test]
    fn test_unknown_table_and_action() {
        let mut raw = lpm_rule();
        raw.table = "MyIngress.bogus".to_string();
        assert!(resolve(&raw, &descriptor()).is_err());

        let mut raw = lpm_rule();
        raw.action_name = "MyIngress.bogus".to_string();
        assert!(resolve(&raw, &descriptor()).is_err());
    }

    #[test]
    fn test_ternary_match() {
        let raw: RawTableEntry = serde_json::from_value(serde_json::json!({
            "table": "MyIngress.acl",
            "match": {"hdr.ethernet.srcAddr": ["08:00:00:00:01:11", "ff:ff:ff:ff:ff:00"]},
            "action_name": "MyIngress.drop",
            "priority": 10
        }))
        .unwrap();
        let entry = resolve(&raw, &descriptor()).unwrap();
        assert_eq!(
            entry.match_key,
            vec![MatchValue::Ternary {
                value: vec![0x08, 0, 0, 0, 0x01, 0x11],
                mask: vec![0xff, 0xff, 0xff, 0xff, 0xff, 0x00]
            }]
        );
    }

    #[test]
    fn test_encode_value_widths() {
        // 9-bit port: two bytes, big endian.
        assert_eq!(encode_value(&Value::from(257), 9, "port").unwrap(), vec![1, 1]);
        // Too wide for 9 bits.
        assert!(encode_value(&Value::from(512), 9, "port").is_err());
        // IPv4 string.
        assert_eq!(
            encode_value(&Value::from("10.0.0.1"), 32, "dst").unwrap(),
            vec![10, 0, 0, 1]
        );
        // Hex string.
        assert_eq!(encode_value(&Value::from("0xff"), 16, "x").unwrap(), vec![0, 255]);
        // Decimal string.
        assert_eq!(encode_value(&Value::from("7"), 8, "x").unwrap(), vec![7]);
    }

    #[test]
    fn test_build_batch_preserves_source_order() {
        let file: RawRuleFile = serde_json::from_value(serde_json::json!({
            "table_entries": [
                {
                    "table": "MyIngress.ecn_config",
                    "default_action": true,
                    "action_name": "MyIngress.set_ecn_threshold",
                    "action_params": {"threshold": 5}
                },
                {
                    "table": "MyIngress.ipv4_lpm",
                    "match": {"hdr.ipv4.dstAddr": ["10.0.1.1", 32]},
                    "action_name": "MyIngress.ipv4_forward",
                    "action_params": {"dstAddr": "08:00:00:00:01:11", "port": 1},
                    "priority": 1
                }
            ]
        }))
        .unwrap();

        let batch = build_batch("s1", &file, &descriptor()).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.entries[0].is_default);
        assert!(batch.entries[1].is_keyed());
        assert_eq!(batch.device, "s1");
    }

    #[test]
    fn test_build_batch_fails_whole_file() {
        let file: RawRuleFile = serde_json::from_value(serde_json::json!({
            "table_entries": [
                {
                    "table": "MyIngress.bogus",
                    "action_name": "MyIngress.drop"
                }
            ]
        }))
        .unwrap();
        assert!(build_batch("s1", &file, &descriptor()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load("/nonexistent/s1-runtime.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
