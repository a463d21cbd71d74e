//! Daemon configuration and startup (INIT-stage) assembly.
//!
//! Everything here runs before any device is contacted; a problem at
//! this stage fails the whole run with a [`ConfigError`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use p4ctl_common::rules::{self, RawRuleFile, RawTableEntry};
use p4ctl_common::{ConfigError, ConfigResult, DeviceIdentity, ElectionId, PipelineDescriptor, RuleBatch};

/// Largest representable queue-depth threshold: the config table's
/// parameter is 19 bits wide.
pub const THRESHOLD_MAX: u64 = (1 << 19) - 1;

/// Threshold used when none is configured.
pub const DEFAULT_THRESHOLD: u64 = 5;

/// One device in the inventory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name.
    pub name: String,
    /// Control-channel address.
    pub address: String,
    /// Numeric device id known to the remote runtime.
    pub device_id: u64,
    /// Per-device rule file; absent means no file rules.
    #[serde(default)]
    pub runtime_file: Option<PathBuf>,
}

impl DeviceConfig {
    /// The immutable identity handed to a session.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.name, &self.address, self.device_id)
    }
}

/// Built-in three-switch topology used when no inventory file is
/// given.
pub fn default_devices() -> Vec<DeviceConfig> {
    (0..3u64)
        .map(|i| DeviceConfig {
            name: format!("s{}", i + 1),
            address: format!("127.0.0.1:{}", 50051 + i),
            device_id: i,
            runtime_file: Some(PathBuf::from(format!("s{}-runtime.json", i + 1))),
        })
        .collect()
}

/// Loads the device inventory file (a JSON array of devices).
pub fn load_devices(path: impl AsRef<Path>) -> ConfigResult<Vec<DeviceConfig>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::parse(path, e.to_string()))
}

/// Names of the config table programmed from the CLI threshold.
#[derive(Debug, Clone)]
pub struct ThresholdRule {
    /// Config table whose default action carries the threshold.
    pub table: String,
    /// Action setting the threshold.
    pub action: String,
    /// The action's parameter name.
    pub param: String,
}

impl Default for ThresholdRule {
    fn default() -> Self {
        Self {
            table: "MyIngress.ecn_config".to_string(),
            action: "MyIngress.set_ecn_threshold".to_string(),
            param: "threshold".to_string(),
        }
    }
}

impl ThresholdRule {
    /// The raw default-action entry carrying the threshold.
    pub fn to_raw_entry(&self, threshold: u64) -> RawTableEntry {
        RawTableEntry::new_default(
            &self.table,
            &self.action,
            vec![(self.param.clone(), Value::from(threshold))],
        )
    }
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Pipeline descriptor path.
    pub p4info_path: PathBuf,
    /// Compiled forwarding program path.
    pub artifact_path: PathBuf,
    /// Device inventory path; absent means the built-in topology.
    pub devices_path: Option<PathBuf>,
    /// Queue-depth threshold to program.
    pub threshold: u64,
    /// Names the threshold rule resolves against.
    pub threshold_rule: ThresholdRule,
    /// Bound on each individual device wait.
    pub request_timeout: Duration,
    /// Election id claimed on every device.
    pub election_id: ElectionId,
    /// Directory for per-device request logs; absent disables them.
    pub log_dir: Option<PathBuf>,
}

impl DaemonConfig {
    /// Validates the configuration without touching any device.
    ///
    /// An out-of-range threshold is rejected rather than clamped.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.threshold > THRESHOLD_MAX {
            return Err(ConfigError::ThresholdRange {
                value: self.threshold,
                max: THRESHOLD_MAX,
            });
        }
        for path in [&self.p4info_path, &self.artifact_path] {
            if !path.exists() {
                return Err(ConfigError::MissingArtifact { path: path.clone() });
            }
        }
        Ok(())
    }

    /// The device inventory this run targets.
    pub fn devices(&self) -> ConfigResult<Vec<DeviceConfig>> {
        match &self.devices_path {
            Some(path) => load_devices(path),
            None => Ok(default_devices()),
        }
    }
}

/// Reads the opaque compiled artifact.
pub fn read_artifact(path: impl AsRef<Path>) -> ConfigResult<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds every device's rule batch: the synthesized threshold rule
/// (when the pipeline defines its table) followed by the device's
/// file rules, resolved against the descriptor. Fails fast on any
/// malformed file or unresolved name.
pub fn build_batches(
    config: &DaemonConfig,
    devices: &[DeviceConfig],
    descriptor: &PipelineDescriptor,
) -> ConfigResult<HashMap<String, RuleBatch>> {
    let threshold_raw = if descriptor.has_table(&config.threshold_rule.table) {
        Some(config.threshold_rule.to_raw_entry(config.threshold))
    } else {
        debug!(
            table = %config.threshold_rule.table,
            "Pipeline has no config table; skipping threshold rule"
        );
        None
    };

    let mut batches = HashMap::new();
    for device in devices {
        let mut file = match &device.runtime_file {
            Some(path) => rules::load(path)?,
            None => RawRuleFile::default(),
        };
        if let Some(raw) = &threshold_raw {
            file.table_entries.insert(0, raw.clone());
        }
        batches.insert(
            device.name.clone(),
            rules::build_batch(&device.name, &file, descriptor)?,
        );
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DESCRIPTOR: &str = r#"{
        "tables": [
            {"name": "MyIngress.ecn_config", "id": 2}
        ],
        "actions": [
            {
                "name": "MyIngress.set_ecn_threshold",
                "id": 18,
                "params": [{"name": "threshold", "id": 1, "bits": 19}]
            }
        ]
    }"#;

    fn config_in(dir: &Path) -> DaemonConfig {
        DaemonConfig {
            p4info_path: dir.join("p4info.json"),
            artifact_path: dir.join("program.json"),
            devices_path: None,
            threshold: DEFAULT_THRESHOLD,
            threshold_rule: ThresholdRule::default(),
            request_timeout: Duration::from_secs(5),
            election_id: ElectionId::new(0, 1),
            log_dir: None,
        }
    }

    fn touch(path: &Path) {
        let mut f = fs::File::create(path).unwrap();
        writeln!(f, "{{}}").unwrap();
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("p4info.json"));
        touch(&dir.path().join("program.json"));

        let mut config = config_in(dir.path());
        config.threshold = THRESHOLD_MAX;
        assert!(config.validate().is_ok());

        config.threshold = THRESHOLD_MAX + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdRange { .. })
        ));
    }

    #[test]
    fn test_validate_requires_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn test_default_devices_mirror_topology() {
        let devices = default_devices();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name, "s1");
        assert_eq!(devices[0].address, "127.0.0.1:50051");
        assert_eq!(devices[2].device_id, 2);
    }

    #[test]
    fn test_build_batches_injects_threshold_rule() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = PipelineDescriptor::from_json(DESCRIPTOR).unwrap();
        let mut config = config_in(dir.path());
        config.threshold = 7;

        let devices = vec![DeviceConfig {
            name: "s1".to_string(),
            address: "127.0.0.1:50051".to_string(),
            device_id: 0,
            runtime_file: None,
        }];
        let batches = build_batches(&config, &devices, &descriptor).unwrap();
        let batch = &batches["s1"];
        assert_eq!(batch.len(), 1);
        assert!(batch.entries[0].is_default);
        assert_eq!(batch.entries[0].action_params, vec![vec![0, 0, 7]]);
    }

    #[test]
    fn test_build_batches_fails_fast_on_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let rule_path = dir.path().join("s1-runtime.json");
        fs::write(&rule_path, "{not json").unwrap();

        let descriptor = PipelineDescriptor::from_json(DESCRIPTOR).unwrap();
        let config = config_in(dir.path());
        let devices = vec![DeviceConfig {
            name: "s1".to_string(),
            address: "127.0.0.1:50051".to_string(),
            device_id: 0,
            runtime_file: Some(rule_path),
        }];
        assert!(matches!(
            build_batches(&config, &devices, &descriptor),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_devices_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(
            &path,
            r#"[{"name": "leaf1", "address": "10.0.0.1:50051", "device_id": 7}]"#,
        )
        .unwrap();
        let devices = load_devices(&path).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identity().device_id, 7);
        assert!(devices[0].runtime_file.is_none());
    }
}
