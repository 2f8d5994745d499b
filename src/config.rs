// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Configuration files.
//!
//! The agent reads `agent.yml`, which tells it where the control service is and which storage
//! backend to bind the replication engine to. The control service reads a TOML file. Both are
//! deserialized straight into the structs below; anything not given falls back to a default.

use std::{path::PathBuf, time::Duration};

use {
    cidr::IpCidr,
    serde::{de, Deserialize, Deserializer, Serialize, Serializer},
};

use crate::{
    commands::{Handle, HandledError, HandledResult},
    model::{DatasetId, NodeId, SnapshotId},
};

/// The only `version` of `agent.yml` that is understood.
pub const AGENT_CONFIG_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    pub version: u32,
    pub control_service: ControlServiceAddress,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub container_runtime: ContainerRuntimeKind,
    /// Only peers with an address inside this network may open replication connections.
    #[serde(default)]
    pub allowed_network: Option<IpCidr>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlServiceAddress {
    pub hostname: String,
    #[serde(default = "crate::control_port")]
    pub port: u16,
}

impl ControlServiceAddress {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Which storage backend datasets live on. Chosen once at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatasetConfig {
    Zfs {
        #[serde(default = "default_pool")]
        pool: String,
        #[serde(default = "default_mount_root")]
        mount_root: PathBuf,
    },
    Loopback {
        #[serde(default = "default_loopback_root")]
        root_path: PathBuf,
    },
    /// Datasets held in process memory. Useful for development and for tests only.
    Memory,
}

fn default_pool() -> String {
    "flocker".to_string()
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/flocker")
}

fn default_loopback_root() -> PathBuf {
    PathBuf::from("/var/lib/flocker/loopback")
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Overrides the node identifier that is otherwise persisted in `uuid-path`.
    pub uuid: Option<NodeId>,
    /// Where the generated node identifier is persisted across restarts.
    pub uuid_path: Option<PathBuf>,
    /// The hostname or IP address that peers use to reach this node.
    pub address: Option<String>,
    pub peer_port: Option<u16>,
}

/// How the agent decides that a replicated dataset needs a new snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotTrigger {
    /// Ask the backend every cycle whether anything was written since the latest snapshot.
    #[default]
    Poll,
    /// Take a snapshot once the latest one is older than `snapshot-interval`, written or not.
    Interval,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConvergenceConfig {
    /// Seconds between reconciliation cycles when nothing changes.
    pub poll_interval: u64,
    pub snapshot_trigger: SnapshotTrigger,
    /// Seconds between snapshots with the `interval` trigger.
    pub snapshot_interval: u64,
    /// Seconds a single replication transfer may take before it is abandoned.
    pub transfer_timeout: u64,
    /// Keep the old primary's copy as a read-only replica after a move instead of deleting it.
    pub retain_moved_replicas: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        ConvergenceConfig {
            poll_interval: 5,
            snapshot_trigger: SnapshotTrigger::Poll,
            snapshot_interval: 60,
            transfer_timeout: 3600,
            retain_moved_replicas: false,
        }
    }
}

impl ConvergenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReplicationConfig {
    /// How many of the most recent snapshots of each dataset to keep.
    pub keep_snapshots: usize,
    /// The largest divergence (snapshots on either side past the common base) that is resolved
    /// automatically by stashing the losing side.
    pub max_auto_resolve_divergence: usize,
    /// Snapshots kept for audit whatever the retention count says.
    pub pinned: Vec<PinnedSnapshot>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            keep_snapshots: 5,
            max_auto_resolve_divergence: 10,
            pinned: Vec::new(),
        }
    }
}

/// A snapshot named the way the backends name it, e.g. `01718000000000000000-<node uuid>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PinnedSnapshot {
    pub dataset: DatasetId,
    #[serde(
        serialize_with = "snapshot_to_name",
        deserialize_with = "snapshot_from_name"
    )]
    pub snapshot: SnapshotId,
}

fn snapshot_to_name<S: Serializer>(snapshot: &SnapshotId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(snapshot)
}

fn snapshot_from_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SnapshotId, D::Error> {
    String::deserialize(deserializer)?
        .parse()
        .map_err(de::Error::custom)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FailoverConfig {
    /// Seconds of silence from a peer after which it is considered unavailable.
    pub liveness_timeout: u64,
    /// Seconds between status messages sent to each peer.
    pub heartbeat_interval: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            liveness_timeout: 30,
            heartbeat_interval: 5,
        }
    }
}

impl FailoverConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntimeKind {
    #[default]
    Docker,
    None,
}

impl AgentConfig {
    pub fn from_yaml(text: &str) -> Result<Self, String> {
        let config: AgentConfig = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        if config.version != AGENT_CONFIG_VERSION {
            return Err(format!(
                "unsupported agent.yml version {} (expected {AGENT_CONFIG_VERSION})",
                config.version
            ));
        }
        Ok(config)
    }

    pub fn load(path: &str) -> HandledResult<Self> {
        let text = std::fs::read_to_string(path).handle_err(|e| {
            eprintln!("Could not open config file \"{path}\": {e}");
        })?;
        Self::from_yaml(&text).handle_err(|e| {
            eprintln!("Could not parse config file \"{path}\": {e}");
        })
    }
}

/// Configuration for the control service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Where the current configuration is persisted.
    pub state_path: PathBuf,
    /// Where the audit journal of configuration changes is appended.
    pub journal_path: PathBuf,
    /// Address agents connect to.
    pub agent_address: String,
    /// Unix socket for the management API.
    pub api_socket: PathBuf,
    /// Optional TCP address for the management API. Always requires client certificates.
    pub api_address: Option<String>,
    /// Seconds after which a node that has not reported is shown as not live.
    pub node_timeout: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            state_path: PathBuf::from(crate::default_state_path()),
            journal_path: PathBuf::from(crate::default_journal_path()),
            agent_address: format!("0.0.0.0:{}", crate::control_port()),
            api_socket: PathBuf::from(crate::default_socket()),
            api_address: None,
            node_timeout: 60,
        }
    }
}

impl ControlConfig {
    /// Load the control service configuration. A missing file at the default location means "use
    /// the defaults"; a missing file that was asked for explicitly is an error.
    pub fn load(path: Option<&str>) -> HandledResult<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_string(), true),
            None => (crate::default_control_config_path(), false),
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(ControlConfig::default());
            }
            Err(e) => {
                eprintln!("Could not open config file \"{path}\": {e}");
                return Err(HandledError {});
            }
        };
        toml::from_str(&text).handle_err(|e| {
            eprintln!("Could not parse config file \"{path}\": {e}");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_agent_yml() {
        let config = AgentConfig::from_yaml(
            "version: 1\n\
             control-service:\n  hostname: control.example.com\n\
             dataset:\n  backend: zfs\n  pool: tank\n",
        )
        .unwrap();

        assert_eq!(config.control_service.address(), "control.example.com:4524");
        assert_eq!(
            config.dataset,
            DatasetConfig::Zfs {
                pool: "tank".to_string(),
                mount_root: PathBuf::from("/flocker"),
            }
        );
        assert_eq!(config.convergence, ConvergenceConfig::default());
        assert_eq!(config.failover.liveness_timeout(), Duration::from_secs(30));
        assert_eq!(config.container_runtime, ContainerRuntimeKind::Docker);
    }

    #[test]
    fn full_agent_yml() {
        let config = AgentConfig::from_yaml(
            "version: 1\n\
             control-service:\n  hostname: 10.0.0.2\n  port: 4600\n\
             dataset:\n  backend: loopback\n  root_path: /tmp/pool\n\
             node:\n  address: 10.0.0.7\n  peer-port: 4700\n\
             convergence:\n  poll-interval: 1\n  snapshot-trigger: interval\n\
             replication:\n  keep-snapshots: 2\n\
             container-runtime: none\n\
             allowed-network: 10.0.0.0/24\n",
        )
        .unwrap();

        assert_eq!(config.control_service.port, 4600);
        assert_eq!(config.node.peer_port, Some(4700));
        assert_eq!(config.convergence.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.convergence.snapshot_trigger, SnapshotTrigger::Interval);
        assert_eq!(config.convergence.snapshot_interval(), Duration::from_secs(60));
        assert_eq!(config.replication.keep_snapshots, 2);
        assert_eq!(config.replication.max_auto_resolve_divergence, 10);
        assert_eq!(config.container_runtime, ContainerRuntimeKind::None);
        assert!(config
            .allowed_network
            .unwrap()
            .contains(&"10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn pinned_snapshots_are_named() {
        let dataset = DatasetId::new_random();
        let snapshot = SnapshotId::new(1_718_000_000_000_000_000, NodeId::new_random());
        let config = AgentConfig::from_yaml(&format!(
            "version: 1\n\
             control-service:\n  hostname: c\n\
             dataset:\n  backend: memory\n\
             replication:\n  pinned:\n    - dataset: {dataset}\n      snapshot: {snapshot}\n"
        ))
        .unwrap();

        assert_eq!(
            config.replication.pinned,
            vec![PinnedSnapshot { dataset, snapshot }]
        );
        assert!(AgentConfig::from_yaml(&format!(
            "version: 1\n\
             control-service:\n  hostname: c\n\
             dataset:\n  backend: memory\n\
             replication:\n  pinned:\n    - dataset: {dataset}\n      snapshot: latest\n"
        ))
        .is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let result = AgentConfig::from_yaml(
            "version: 2\ncontrol-service:\n  hostname: c\ndataset:\n  backend: memory\n",
        );
        assert!(result.unwrap_err().contains("version"));
    }

    #[test]
    fn missing_backend_is_rejected() {
        assert!(AgentConfig::from_yaml("version: 1\ncontrol-service:\n  hostname: c\n").is_err());
    }

    #[test]
    fn control_toml() {
        let config: ControlConfig = toml::from_str(
            "state_path = \"/tmp/state.json\"\napi_address = \"0.0.0.0:4523\"\n",
        )
        .unwrap();
        assert_eq!(config.state_path, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.api_address.as_deref(), Some("0.0.0.0:4523"));
        assert_eq!(config.node_timeout, 60);
    }
}
