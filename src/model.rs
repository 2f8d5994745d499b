// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The data model shared by the control service and the agents.
//!
//! `Configuration` is the desired state of the cluster and is only ever changed by applying a
//! `ConfigurationChange` to it. `ClusterState` is the merged view of what every node has reported
//! about itself. The two are deliberately separate types: state is never consulted for intent.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

use crate::error::ConfigurationError;

/// Unique identifier of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new_random() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodeId(Uuid::parse_str(s)?))
    }
}

/// Unique identifier of a dataset. The identifier never changes when the dataset moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub Uuid);

impl DatasetId {
    pub fn new_random() -> Self {
        DatasetId(Uuid::new_v4())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DatasetId(Uuid::parse_str(s)?))
    }
}

/// Identifier of a snapshot of a dataset.
///
/// Snapshot identifiers are ordered first by their timestamp (nanoseconds since the Unix epoch)
/// and then by the node that took them, which makes them totally ordered per dataset. A node
/// never issues two identifiers with the same timestamp; see `ReplicationEngine::next_snapshot_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub timestamp: u64,
    pub node: NodeId,
}

impl SnapshotId {
    pub fn new(timestamp: u64, node: NodeId) -> Self {
        SnapshotId { timestamp, node }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp as i64)
    }
}

/// Snapshot identifiers are rendered as `<zero padded timestamp>-<node uuid>` so that they are
/// valid ZFS snapshot names and sort lexically in the same order as they sort numerically.
impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}-{}", self.timestamp, self.node)
    }
}

impl FromStr for SnapshotId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((timestamp, node)) = s.split_once('-') else {
            return Err(format!("malformed snapshot name '{s}'"));
        };
        let timestamp = timestamp
            .parse::<u64>()
            .map_err(|e| format!("malformed snapshot timestamp in '{s}': {e}"))?;
        let node = node
            .parse::<NodeId>()
            .map_err(|e| format!("malformed snapshot node in '{s}': {e}"))?;
        Ok(SnapshotId { timestamp, node })
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,

    /// The address (`host:port`) on which the node's agent accepts replication connections.
    pub address: String,
}

/// A named unit of persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: DatasetId,

    /// The node that should mount this dataset read-write.
    pub primary: NodeId,

    /// Maximum size in bytes. `None` means unlimited.
    pub maximum_size: Option<u64>,

    /// Free-form key-value pairs. The `name` key holds the human-readable name.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Deleted datasets stay in the configuration as tombstones until no node reports a copy.
    #[serde(default)]
    pub deleted: bool,

    /// For failover datasets, the node that holds a continuously replicated standby copy.
    #[serde(default)]
    pub replica: Option<NodeId>,

    /// Incremented every time the replica of a failover dataset is promoted. A node that mounted
    /// the dataset under an older epoch must not keep serving it.
    #[serde(default)]
    pub epoch: u64,
}

impl Dataset {
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").map(String::as_str)
    }

    /// Whether `node` should hold a copy of this dataset at all, either as primary or as replica.
    pub fn hosted_on(&self, node: &NodeId) -> bool {
        self.primary == *node || self.replica.as_ref() == Some(node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub internal: u16,
    pub external: u16,
}

/// A container that should run on a node, optionally with a dataset mounted into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub node: NodeId,
    #[serde(default)]
    pub volume: Option<VolumeMount>,
    #[serde(default)]
    pub ports: Vec<PortMap>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub dataset_id: DatasetId,
    /// Path inside the container.
    pub mountpoint: String,
}

/// The desired state of the whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Incremented by every change that is applied.
    pub version: u64,
    pub nodes: BTreeMap<NodeId, Node>,
    pub datasets: BTreeMap<DatasetId, Dataset>,
    pub containers: BTreeMap<String, Container>,
}

/// A requested mutation of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ConfigurationChange {
    /// A node reported state for the first time, or its address changed.
    RegisterNode(Node),
    CreateDataset {
        dataset_id: Option<DatasetId>,
        primary: NodeId,
        maximum_size: Option<u64>,
        metadata: BTreeMap<String, String>,
        replica: Option<NodeId>,
    },
    MoveDataset {
        dataset_id: DatasetId,
        primary: NodeId,
    },
    ResizeDataset {
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    },
    DeleteDataset {
        dataset_id: DatasetId,
    },
    /// Remove the tombstone of a deleted dataset once no node holds a copy any more.
    PurgeDataset {
        dataset_id: DatasetId,
    },
    /// The replica of a failover dataset took over after its primary became unavailable.
    Promote {
        dataset_id: DatasetId,
        node_id: NodeId,
        epoch: u64,
    },
    CreateContainer(Container),
    DeleteContainer {
        name: String,
    },
}

impl ConfigurationChange {
    /// The identifier of the object this change is about, as recorded in the journal.
    pub fn object_id(&self) -> String {
        match self {
            Self::RegisterNode(node) => node.node_id.to_string(),
            Self::CreateDataset { dataset_id, .. } => match dataset_id {
                Some(id) => id.to_string(),
                None => "<new>".to_string(),
            },
            Self::MoveDataset { dataset_id, .. }
            | Self::ResizeDataset { dataset_id, .. }
            | Self::DeleteDataset { dataset_id }
            | Self::PurgeDataset { dataset_id }
            | Self::Promote { dataset_id, .. } => dataset_id.to_string(),
            Self::CreateContainer(container) => container.name.clone(),
            Self::DeleteContainer { name } => name.clone(),
        }
    }
}

fn invalid<T>(reason: impl Into<String>) -> Result<T, ConfigurationError> {
    Err(ConfigurationError::InvalidConfiguration(reason.into()))
}

impl Configuration {
    /// Validate `change` against this configuration, and return the configuration that results
    /// from applying it. `self` is never modified, so a rejected change leaves nothing behind.
    ///
    /// Changes that would not alter anything (moving a dataset to where it already is, deleting an
    /// already deleted dataset) succeed and return an identical configuration with the same
    /// version.
    pub fn apply(&self, change: &ConfigurationChange) -> Result<Configuration, ConfigurationError> {
        let mut next = self.clone();

        match change {
            ConfigurationChange::RegisterNode(node) => {
                if self.nodes.get(&node.node_id) == Some(node) {
                    return Ok(next);
                }
                next.nodes.insert(node.node_id, node.clone());
            }
            ConfigurationChange::CreateDataset {
                dataset_id,
                primary,
                maximum_size,
                metadata,
                replica,
            } => {
                let dataset_id = dataset_id.unwrap_or_else(DatasetId::new_random);
                if self.datasets.contains_key(&dataset_id) {
                    return Err(ConfigurationError::DatasetExists(dataset_id));
                }
                self.require_node(primary)?;
                if let Some(replica) = replica {
                    self.require_node(replica)?;
                    if replica == primary {
                        return invalid("a dataset's replica must be a different node from its primary");
                    }
                }
                check_size(*maximum_size)?;
                next.datasets.insert(
                    dataset_id,
                    Dataset {
                        dataset_id,
                        primary: *primary,
                        maximum_size: *maximum_size,
                        metadata: metadata.clone(),
                        deleted: false,
                        replica: *replica,
                        epoch: 0,
                    },
                );
            }
            ConfigurationChange::MoveDataset {
                dataset_id,
                primary,
            } => {
                let dataset = self.live_dataset(dataset_id)?;
                self.require_node(primary)?;
                if dataset.primary == *primary {
                    return Ok(next);
                }
                let old_primary = dataset.primary;
                let dataset = next.datasets.get_mut(dataset_id).expect("checked above");
                if dataset.replica == Some(*primary) {
                    dataset.replica = Some(old_primary);
                }
                dataset.primary = *primary;
                // Containers follow the dataset they have mounted.
                for container in next.containers.values_mut() {
                    if container.volume.as_ref().map(|v| v.dataset_id) == Some(*dataset_id) {
                        container.node = *primary;
                    }
                }
            }
            ConfigurationChange::ResizeDataset {
                dataset_id,
                maximum_size,
            } => {
                let dataset = self.live_dataset(dataset_id)?;
                check_size(*maximum_size)?;
                if dataset.maximum_size == *maximum_size {
                    return Ok(next);
                }
                next.datasets
                    .get_mut(dataset_id)
                    .expect("checked above")
                    .maximum_size = *maximum_size;
            }
            ConfigurationChange::DeleteDataset { dataset_id } => {
                let Some(dataset) = self.datasets.get(dataset_id) else {
                    return Err(ConfigurationError::UnknownDataset(*dataset_id));
                };
                if dataset.deleted {
                    return Ok(next);
                }
                if let Some(container) = self.containers_using(dataset_id).next() {
                    return invalid(format!(
                        "dataset {dataset_id} is in use by container '{}'",
                        container.name
                    ));
                }
                next.datasets
                    .get_mut(dataset_id)
                    .expect("checked above")
                    .deleted = true;
            }
            ConfigurationChange::PurgeDataset { dataset_id } => {
                let Some(dataset) = self.datasets.get(dataset_id) else {
                    return Err(ConfigurationError::UnknownDataset(*dataset_id));
                };
                if !dataset.deleted {
                    return invalid(format!("dataset {dataset_id} has not been deleted"));
                }
                next.datasets.remove(dataset_id);
            }
            ConfigurationChange::Promote {
                dataset_id,
                node_id,
                epoch,
            } => {
                let dataset = self.live_dataset(dataset_id)?;
                if dataset.replica != Some(*node_id) {
                    return invalid(format!(
                        "node {node_id} is not the replica of dataset {dataset_id}"
                    ));
                }
                if *epoch <= dataset.epoch {
                    return invalid(format!(
                        "promotion of dataset {dataset_id} at epoch {epoch} is stale (current epoch {})",
                        dataset.epoch
                    ));
                }
                let old_primary = dataset.primary;
                let dataset = next.datasets.get_mut(dataset_id).expect("checked above");
                dataset.primary = *node_id;
                dataset.replica = Some(old_primary);
                dataset.epoch = *epoch;
                for container in next.containers.values_mut() {
                    if container.volume.as_ref().map(|v| v.dataset_id) == Some(*dataset_id) {
                        container.node = *node_id;
                    }
                }
            }
            ConfigurationChange::CreateContainer(container) => {
                if self.containers.contains_key(&container.name) {
                    return Err(ConfigurationError::ContainerExists(container.name.clone()));
                }
                if container.name.is_empty() || container.image.is_empty() {
                    return invalid("containers need a name and an image");
                }
                self.require_node(&container.node)?;
                if let Some(volume) = &container.volume {
                    let dataset = self.live_dataset(&volume.dataset_id)?;
                    if dataset.primary != container.node {
                        return invalid(format!(
                            "container '{}' must run on node {}, the primary of dataset {}",
                            container.name, dataset.primary, dataset.dataset_id
                        ));
                    }
                }
                let mut external = BTreeSet::new();
                for port in &container.ports {
                    if !external.insert(port.external) {
                        return invalid(format!("external port {} is mapped twice", port.external));
                    }
                }
                next.containers
                    .insert(container.name.clone(), container.clone());
            }
            ConfigurationChange::DeleteContainer { name } => {
                if next.containers.remove(name).is_none() {
                    return Err(ConfigurationError::UnknownContainer(name.clone()));
                }
            }
        }

        next.version = self.version + 1;
        Ok(next)
    }

    /// The identifier of the dataset most recently created, used to report back the identifier
    /// that was generated for a `CreateDataset` change without one.
    pub fn created_dataset(&self, before: &Configuration) -> Option<&Dataset> {
        self.datasets
            .values()
            .find(|d| !before.datasets.contains_key(&d.dataset_id))
    }

    /// The datasets that `node` should hold a copy of, as primary or as replica. Deleted datasets
    /// are included so that agents know to clean them up.
    pub fn datasets_for<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Dataset> + 'a {
        self.datasets.values().filter(move |d| d.hosted_on(node))
    }

    pub fn containers_for<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> impl Iterator<Item = &'a Container> + 'a {
        self.containers.values().filter(move |c| c.node == *node)
    }

    pub fn containers_using<'a>(
        &'a self,
        dataset_id: &'a DatasetId,
    ) -> impl Iterator<Item = &'a Container> + 'a {
        self.containers
            .values()
            .filter(move |c| c.volume.as_ref().map(|v| &v.dataset_id) == Some(dataset_id))
    }

    fn require_node(&self, node: &NodeId) -> Result<(), ConfigurationError> {
        if self.nodes.contains_key(node) {
            Ok(())
        } else {
            invalid(format!("node {node} has never reported state to the control service"))
        }
    }

    fn live_dataset(&self, dataset_id: &DatasetId) -> Result<&Dataset, ConfigurationError> {
        match self.datasets.get(dataset_id) {
            Some(dataset) if !dataset.deleted => Ok(dataset),
            Some(_) => invalid(format!("dataset {dataset_id} has been deleted")),
            None => Err(ConfigurationError::UnknownDataset(*dataset_id)),
        }
    }
}

fn check_size(maximum_size: Option<u64>) -> Result<(), ConfigurationError> {
    match maximum_size {
        Some(0) => invalid("maximum_size must be greater than zero"),
        _ => Ok(()),
    }
}

/// A copy of a dataset present on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifestation {
    pub dataset_id: DatasetId,

    /// Whether the copy is mounted read-write on this node.
    pub primary: bool,

    /// The configuration epoch under which the copy was mounted read-write. Meaningless for
    /// replicas.
    #[serde(default)]
    pub epoch: u64,

    pub maximum_size: Option<u64>,

    /// Where the dataset's filesystem is mounted, for primaries.
    #[serde(default)]
    pub path: Option<String>,

    /// Snapshots present locally, oldest first.
    #[serde(default)]
    pub snapshots: Vec<SnapshotId>,

    /// Whether the copy needs a new snapshot: it was written to since its latest snapshot, or the
    /// latest snapshot is due for replacement, depending on the configured trigger.
    #[serde(default)]
    pub changed: bool,

    /// Set when replication out of this copy stopped because the history of the replica diverged
    /// beyond what can be resolved automatically.
    #[serde(default)]
    pub diverged: bool,
}

impl Manifestation {
    pub fn latest_snapshot(&self) -> Option<&SnapshotId> {
        self.snapshots.last()
    }
}

/// Data preserved from the losing side of a resolved divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stash {
    pub dataset_id: DatasetId,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Stash {
    /// Stashes are labelled `<dataset id>.<nanoseconds since the epoch>`, which is a valid
    /// dataset name on every backend and can be parsed back without any other bookkeeping.
    pub fn new(dataset_id: DatasetId, created_at: DateTime<Utc>) -> Self {
        let nanos = created_at.timestamp_nanos_opt().unwrap_or_default();
        Stash {
            dataset_id,
            label: format!("{dataset_id}.{nanos}"),
            created_at,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let (dataset_id, nanos) = label.split_once('.')?;
        Some(Stash {
            dataset_id: dataset_id.parse().ok()?,
            label: label.to_string(),
            created_at: DateTime::from_timestamp_nanos(nanos.parse().ok()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    pub image: String,
    pub running: bool,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
}

/// Everything a node knows about itself: the result of the Discover step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub address: String,
    pub manifestations: BTreeMap<DatasetId, Manifestation>,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerState>,
    #[serde(default)]
    pub stashes: Vec<Stash>,
}

impl NodeState {
    pub fn empty(node: &Node) -> Self {
        NodeState {
            node_id: node.node_id,
            address: node.address.clone(),
            manifestations: BTreeMap::new(),
            containers: BTreeMap::new(),
            stashes: Vec::new(),
        }
    }

    pub fn node(&self) -> Node {
        Node {
            node_id: self.node_id,
            address: self.address.clone(),
        }
    }
}

/// The last accepted report from one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Strictly increasing per node; reports with a generation at or below the last accepted one
    /// are stale.
    pub generation: u64,
    pub received_at: DateTime<Utc>,
    pub state: NodeState,
}

/// The merged actual-state view of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub nodes: BTreeMap<NodeId, NodeReport>,
}

impl ClusterState {
    /// Merge a node's report into the cluster state. Returns `false` (and changes nothing) if the
    /// report is not newer than the last accepted report from that node.
    pub fn merge(
        &mut self,
        generation: u64,
        state: NodeState,
        received_at: DateTime<Utc>,
    ) -> bool {
        if let Some(existing) = self.nodes.get(&state.node_id) {
            if generation <= existing.generation {
                return false;
            }
        }
        self.nodes.insert(
            state.node_id,
            NodeReport {
                generation,
                received_at,
                state,
            },
        );
        true
    }

    pub fn node_state(&self, node: &NodeId) -> Option<&NodeState> {
        self.nodes.get(node).map(|report| &report.state)
    }

    /// Every reported copy of `dataset_id`, by node.
    pub fn manifestations<'a>(
        &'a self,
        dataset_id: &'a DatasetId,
    ) -> impl Iterator<Item = (&'a NodeId, &'a Manifestation)> + 'a {
        self.nodes.iter().filter_map(move |(node, report)| {
            report
                .state
                .manifestations
                .get(dataset_id)
                .map(|m| (node, m))
        })
    }

    pub fn manifestation(&self, node: &NodeId, dataset_id: &DatasetId) -> Option<&Manifestation> {
        self.node_state(node)?.manifestations.get(dataset_id)
    }

    /// Whether any node has reported a copy of `dataset_id`.
    pub fn is_manifested(&self, dataset_id: &DatasetId) -> bool {
        self.manifestations(dataset_id).next().is_some()
    }

    /// Whether every node in `nodes` has reported at least once.
    pub fn has_reports_from<'a>(&self, mut nodes: impl Iterator<Item = &'a NodeId>) -> bool {
        nodes.all(|node| self.nodes.contains_key(node))
    }
}

/// The pair pushed from the control service to every agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub configuration: Configuration,
    pub state: ClusterState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node {
            node_id: NodeId::new_random(),
            address: "127.0.0.1:4525".to_string(),
        }
    }

    fn registered(nodes: &[&Node]) -> Configuration {
        let mut config = Configuration::default();
        for n in nodes {
            config = config
                .apply(&ConfigurationChange::RegisterNode((*n).clone()))
                .unwrap();
        }
        config
    }

    fn create(config: &Configuration, primary: NodeId) -> (Configuration, DatasetId) {
        let id = DatasetId::new_random();
        let next = config
            .apply(&ConfigurationChange::CreateDataset {
                dataset_id: Some(id),
                primary,
                maximum_size: None,
                metadata: BTreeMap::from([("name".to_string(), "db".to_string())]),
                replica: None,
            })
            .unwrap();
        (next, id)
    }

    #[test]
    fn snapshot_id_roundtrips_and_orders() {
        let a = SnapshotId::new(5, NodeId::new_random());
        let b = SnapshotId::new(40, NodeId::new_random());
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
        assert_eq!(a.to_string().parse::<SnapshotId>().unwrap(), a);
        assert!("garbage".parse::<SnapshotId>().is_err());
    }

    #[test]
    fn stash_labels_parse_back() {
        let stash = Stash::new(DatasetId::new_random(), Utc::now());
        assert_eq!(Stash::from_label(&stash.label), Some(stash));
        assert_eq!(Stash::from_label("flocker-stashes"), None);
    }

    #[test]
    fn move_to_unknown_node_is_rejected() {
        let a = node();
        let config = registered(&[&a]);
        let (config, id) = create(&config, a.node_id);

        let result = config.apply(&ConfigurationChange::MoveDataset {
            dataset_id: id,
            primary: NodeId::new_random(),
        });

        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidConfiguration(_))
        ));
        assert_eq!(config.datasets[&id].primary, a.node_id);
    }

    #[test]
    fn move_carries_containers_and_bumps_version() {
        let (a, b) = (node(), node());
        let config = registered(&[&a, &b]);
        let (config, id) = create(&config, a.node_id);
        let config = config
            .apply(&ConfigurationChange::CreateContainer(Container {
                name: "pg".to_string(),
                image: "postgres:16".to_string(),
                node: a.node_id,
                volume: Some(VolumeMount {
                    dataset_id: id,
                    mountpoint: "/var/lib/postgresql".to_string(),
                }),
                ports: vec![],
                environment: BTreeMap::new(),
            }))
            .unwrap();

        let moved = config
            .apply(&ConfigurationChange::MoveDataset {
                dataset_id: id,
                primary: b.node_id,
            })
            .unwrap();

        assert_eq!(moved.version, config.version + 1);
        assert_eq!(moved.datasets[&id].primary, b.node_id);
        assert_eq!(moved.containers["pg"].node, b.node_id);

        let again = moved
            .apply(&ConfigurationChange::MoveDataset {
                dataset_id: id,
                primary: b.node_id,
            })
            .unwrap();
        assert_eq!(again, moved);
    }

    #[test]
    fn delete_in_use_dataset_is_rejected() {
        let a = node();
        let config = registered(&[&a]);
        let (config, id) = create(&config, a.node_id);
        let config = config
            .apply(&ConfigurationChange::CreateContainer(Container {
                name: "web".to_string(),
                image: "nginx".to_string(),
                node: a.node_id,
                volume: Some(VolumeMount {
                    dataset_id: id,
                    mountpoint: "/data".to_string(),
                }),
                ports: vec![],
                environment: BTreeMap::new(),
            }))
            .unwrap();

        assert!(config
            .apply(&ConfigurationChange::DeleteDataset { dataset_id: id })
            .is_err());

        let config = config
            .apply(&ConfigurationChange::DeleteContainer {
                name: "web".to_string(),
            })
            .unwrap()
            .apply(&ConfigurationChange::DeleteDataset { dataset_id: id })
            .unwrap();
        assert!(config.datasets[&id].deleted);

        // A deleted dataset can no longer be moved, but its tombstone can be purged.
        assert!(config
            .apply(&ConfigurationChange::ResizeDataset {
                dataset_id: id,
                maximum_size: Some(10)
            })
            .is_err());
        let purged = config
            .apply(&ConfigurationChange::PurgeDataset { dataset_id: id })
            .unwrap();
        assert!(!purged.datasets.contains_key(&id));
    }

    #[test]
    fn promotion_requires_replica_and_newer_epoch() {
        let (a, b, c) = (node(), node(), node());
        let config = registered(&[&a, &b, &c]);
        let id = DatasetId::new_random();
        let config = config
            .apply(&ConfigurationChange::CreateDataset {
                dataset_id: Some(id),
                primary: a.node_id,
                maximum_size: Some(1 << 30),
                metadata: BTreeMap::new(),
                replica: Some(b.node_id),
            })
            .unwrap();

        assert!(config
            .apply(&ConfigurationChange::Promote {
                dataset_id: id,
                node_id: c.node_id,
                epoch: 1
            })
            .is_err());
        assert!(config
            .apply(&ConfigurationChange::Promote {
                dataset_id: id,
                node_id: b.node_id,
                epoch: 0
            })
            .is_err());

        let promoted = config
            .apply(&ConfigurationChange::Promote {
                dataset_id: id,
                node_id: b.node_id,
                epoch: 1,
            })
            .unwrap();
        let dataset = &promoted.datasets[&id];
        assert_eq!(dataset.primary, b.node_id);
        assert_eq!(dataset.replica, Some(a.node_id));
        assert_eq!(dataset.epoch, 1);
    }

    #[test]
    fn stale_reports_are_discarded() {
        let a = node();
        let mut state = ClusterState::default();
        let mut report = NodeState::empty(&a);

        assert!(state.merge(10, report.clone(), Utc::now()));

        report.address = "10.0.0.1:4525".to_string();
        assert!(!state.merge(10, report.clone(), Utc::now()));
        assert!(!state.merge(3, report.clone(), Utc::now()));
        assert_eq!(state.nodes[&a.node_id].state.address, a.address);

        assert!(state.merge(11, report, Utc::now()));
        assert_eq!(state.nodes[&a.node_id].state.address, "10.0.0.1:4525");
    }
}
