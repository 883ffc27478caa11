//! Configuration schema and loader for ringkv storage nodes and the coordinator.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level storage node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Client-facing address; also the node's identity on the ring.
    pub data_addr: SocketAddr,

    /// Address for coordinator and peer traffic.
    pub control_addr: SocketAddr,

    /// Coordinator address (`host:port`).
    #[serde(default = "default_coordinator_addr")]
    pub coordinator: String,

    /// Replication and handoff settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-request deadline for outbound RPCs, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Total copies of each key, owner included.
    #[serde(default = "default_factor")]
    pub factor: usize,

    /// Maximum concurrent item pushes during handoff.
    #[serde(default = "default_handoff_concurrency")]
    pub handoff_concurrency: usize,

    /// How long a removed replica worker may drain, in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            handoff_concurrency: default_handoff_concurrency(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the WAL and segments.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,

    /// Memtable size that triggers a flush.
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: usize,

    /// How often the flush thread wakes up, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,

    /// How often members are probed, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A probe slower than this counts as a failure, in milliseconds.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Per-request deadline for ring and lock messages, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default)]
    pub metrics_port: Option<u16>,
}

// --- Defaults ---

fn default_coordinator_addr() -> String {
    "127.0.0.1:6000".to_string()
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_factor() -> usize {
    3
}
fn default_handoff_concurrency() -> usize {
    16
}
fn default_stop_timeout_ms() -> u64 {
    2000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_flush_threshold_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_flush_interval_ms() -> u64 {
    500
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_heartbeat_timeout_ms() -> u64 {
    500
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_addr == self.control_addr {
            return Err(ConfigError::Invalid(
                "data_addr and control_addr must differ".into(),
            ));
        }
        if self.data_addr.ip().is_unspecified() {
            return Err(ConfigError::Invalid(format!(
                "data_addr ({}) is the node's ring identity and must be routable",
                self.data_addr
            )));
        }
        if self.coordinator.rsplit_once(':').is_none() {
            return Err(ConfigError::Invalid(format!(
                "coordinator ({:?}) must be host:port",
                self.coordinator
            )));
        }
        if self.replication.factor == 0 {
            return Err(ConfigError::Invalid(
                "replication.factor must be > 0".into(),
            ));
        }
        if self.replication.handoff_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "replication.handoff_concurrency must be > 0".into(),
            ));
        }
        if !["always", "batch", "none"].contains(&self.storage.fsync.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync ({:?}) must be always, batch or none",
                self.storage.fsync
            )));
        }
        if self.storage.flush_threshold_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage.flush_threshold_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.heartbeat_timeout_ms == 0 || self.heartbeat_timeout_ms >= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must be > 0 and < heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_node_config_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_node_config_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_node_config_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Load a `CoordinatorConfig` from a YAML file path.
pub fn load_coordinator_config_from_file(
    path: &std::path::Path,
) -> Result<CoordinatorConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_coordinator_config_from_str(&contents)
}

/// Load a `CoordinatorConfig` from a YAML string.
pub fn load_coordinator_config_from_str(yaml: &str) -> Result<CoordinatorConfig, ConfigError> {
    let config: CoordinatorConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_node_config() {
        let yaml = r#"
data_addr: "127.0.0.1:7000"
control_addr: "127.0.0.1:7001"
"#;
        let config = load_node_config_from_str(yaml).unwrap();
        assert_eq!(config.data_addr.port(), 7000);
        assert_eq!(config.control_addr.port(), 7001);
        assert_eq!(config.coordinator, "127.0.0.1:6000");
        assert_eq!(config.replication.factor, 3);
        assert_eq!(config.replication.handoff_concurrency, 16);
        assert_eq!(config.storage.fsync, "batch");
        assert_eq!(config.storage.flush_threshold_bytes, 4 * 1024 * 1024);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn test_parse_full_node_config() {
        let yaml = r#"
data_addr: "10.0.0.5:8000"
control_addr: "10.0.0.5:8001"
coordinator: "10.0.0.1:6000"
rpc_timeout_ms: 1500
metrics_port: 9100
replication:
  factor: 2
  handoff_concurrency: 4
  stop_timeout_ms: 750
storage:
  data_dir: /tmp/ringkv-test
  fsync: always
  flush_threshold_bytes: 65536
  flush_interval_ms: 100
"#;
        let config = load_node_config_from_str(yaml).unwrap();
        assert_eq!(config.coordinator, "10.0.0.1:6000");
        assert_eq!(config.replication.factor, 2);
        assert_eq!(config.replication.stop_timeout_ms, 750);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/ringkv-test"));
        assert_eq!(config.storage.fsync, "always");
        assert_eq!(config.storage.flush_interval_ms, 100);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.rpc_timeout_ms, 1500);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let yaml = r#"
data_addr: "127.0.0.1:9000"
control_addr: "127.0.0.1:9001"
"#;
        let config = load_node_config_from_str(yaml).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_node_config_from_str(&serialized).unwrap();
        assert_eq!(config.data_addr, config2.data_addr);
        assert_eq!(config.replication.factor, config2.replication.factor);
    }

    #[test]
    fn test_rejects_bad_node_configs() {
        let cases = [
            (
                "data_addr: \"127.0.0.1:7000\"\ncontrol_addr: \"127.0.0.1:7000\"\n",
                "control_addr",
            ),
            (
                "data_addr: \"0.0.0.0:7000\"\ncontrol_addr: \"0.0.0.0:7001\"\n",
                "routable",
            ),
            (
                "data_addr: \"127.0.0.1:7000\"\ncontrol_addr: \"127.0.0.1:7001\"\nreplication:\n  factor: 0\n",
                "replication.factor",
            ),
            (
                "data_addr: \"127.0.0.1:7000\"\ncontrol_addr: \"127.0.0.1:7001\"\nstorage:\n  fsync: sometimes\n",
                "storage.fsync",
            ),
            (
                "data_addr: \"127.0.0.1:7000\"\ncontrol_addr: \"127.0.0.1:7001\"\ncoordinator: nowhere\n",
                "coordinator",
            ),
        ];
        for (yaml, needle) in cases {
            let err = load_node_config_from_str(yaml).unwrap_err().to_string();
            assert!(err.contains(needle), "error should mention {}: {}", needle, err);
        }
    }

    #[test]
    fn test_rejects_missing_addresses() {
        assert!(matches!(
            load_node_config_from_str("data_addr: \"127.0.0.1:7000\"\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_coordinator_config() {
        let config = load_coordinator_config_from_str("listen: \"0.0.0.0:6000\"\n").unwrap();
        assert_eq!(config.listen.port(), 6000);
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.heartbeat_timeout_ms, 500);

        let slow = "listen: \"0.0.0.0:6000\"\nheartbeat_interval_ms: 200\nheartbeat_timeout_ms: 300\n";
        let err = load_coordinator_config_from_str(slow).unwrap_err().to_string();
        assert!(err.contains("heartbeat_timeout_ms"), "{}", err);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(
            &path,
            "data_addr: \"127.0.0.1:7000\"\ncontrol_addr: \"127.0.0.1:7001\"\n",
        )
        .unwrap();
        assert_eq!(
            load_node_config_from_file(&path).unwrap().data_addr.port(),
            7000
        );
        assert!(matches!(
            load_node_config_from_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
