// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The Diff step: the actions that bring this node's local state closer to the configuration.
//!
//! `calculate_changes` is a pure function of what the node found locally, the latest cluster
//! status pushed by the control service, and the failover datasets the coordinator currently
//! forbids serving. Once local state matches the configuration it returns nothing.
//!
//! A move is never a single action. The old primary hands the dataset off (final snapshot,
//! unmount, send the rest) and the new primary only attaches once no other copy is mounted under
//! the current epoch and its own copy is at least as new as every other copy that could have
//! been written under that epoch.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use crate::model::{
    ClusterStatus, Container, Dataset, DatasetId, Manifestation, Node, NodeId, NodeState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Stop and remove a container that should not run here as it is.
    StopContainer {
        name: String,
        dataset_id: Option<DatasetId>,
    },
    /// Create a brand-new dataset and mount it read-write.
    CreateDataset {
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
        epoch: u64,
    },
    /// Mount an existing local copy read-write.
    AttachDataset { dataset_id: DatasetId, epoch: u64 },
    ResizeDataset {
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    },
    /// Bring `to`'s copy up to the newest local snapshot.
    Replicate { dataset_id: DatasetId, to: Node },
    /// Give the dataset up to its new primary: send what it is missing, unmount, then send the
    /// final snapshot.
    Handoff { dataset_id: DatasetId, to: Node },
    /// Unmount without sending anything, because another node took over under a newer epoch or
    /// because the failover coordinator forbids serving.
    Demote { dataset_id: DatasetId },
    DestroyDataset { dataset_id: DatasetId },
    StartContainer {
        container: Container,
        path: Option<String>,
    },
}

impl Action {
    /// The dataset whose storage this action touches. Actions on the same dataset never run
    /// concurrently.
    pub fn dataset_id(&self) -> Option<DatasetId> {
        match self {
            Action::StopContainer { dataset_id, .. } => *dataset_id,
            Action::CreateDataset { dataset_id, .. }
            | Action::AttachDataset { dataset_id, .. }
            | Action::ResizeDataset { dataset_id, .. }
            | Action::Replicate { dataset_id, .. }
            | Action::Handoff { dataset_id, .. }
            | Action::Demote { dataset_id }
            | Action::DestroyDataset { dataset_id } => Some(*dataset_id),
            Action::StartContainer { container, .. } => {
                container.volume.as_ref().map(|v| v.dataset_id)
            }
        }
    }

    /// Actions on one dataset run in ascending order: containers stop before their dataset goes
    /// away and start after it is mounted.
    pub fn order(&self) -> u8 {
        match self {
            Action::StopContainer { .. } => 0,
            Action::Handoff { .. } | Action::Demote { .. } | Action::DestroyDataset { .. } => 1,
            Action::CreateDataset { .. } | Action::AttachDataset { .. } => 2,
            Action::ResizeDataset { .. } => 3,
            Action::Replicate { .. } => 4,
            Action::StartContainer { .. } => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::StopContainer { .. } => "stop_container",
            Action::CreateDataset { .. } => "create_dataset",
            Action::AttachDataset { .. } => "attach_dataset",
            Action::ResizeDataset { .. } => "resize_dataset",
            Action::Replicate { .. } => "replicate",
            Action::Handoff { .. } => "handoff",
            Action::Demote { .. } => "demote",
            Action::DestroyDataset { .. } => "destroy_dataset",
            Action::StartContainer { .. } => "start_container",
        }
    }

    fn is_container(&self) -> bool {
        matches!(
            self,
            Action::StopContainer { .. } | Action::StartContainer { .. }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            Action::StopContainer { name, .. } => write!(f, " container={name}"),
            Action::StartContainer { container, .. } => {
                write!(f, " container={} image={}", container.name, container.image)
            }
            Action::CreateDataset { epoch, .. } | Action::AttachDataset { epoch, .. } => {
                write!(f, " epoch={epoch}")
            }
            Action::ResizeDataset { maximum_size, .. } => match maximum_size {
                Some(size) => write!(f, " maximum_size={size}"),
                None => write!(f, " maximum_size=unlimited"),
            },
            Action::Replicate { to, .. } | Action::Handoff { to, .. } => {
                write!(f, " to={}", to.node_id)
            }
            Action::Demote { .. } | Action::DestroyDataset { .. } => Ok(()),
        }
    }
}

/// Node-local settings that change what the diff asks for.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffPolicy {
    /// Keep the old primary's copy after a move instead of destroying it.
    pub retain_moved_replicas: bool,
    /// Whether this node runs containers at all.
    pub manage_containers: bool,
}

/// Compute the actions that move `local` towards the part of the configuration that concerns
/// `node_id`. The result is sorted by `Action::order`.
pub fn calculate_changes(
    node_id: NodeId,
    local: &NodeState,
    status: &ClusterStatus,
    not_serving: &BTreeSet<DatasetId>,
    policy: DiffPolicy,
) -> Vec<Action> {
    let configuration = &status.configuration;
    let mut actions = Vec::new();
    let mut serving = BTreeSet::new();

    for dataset in configuration.datasets.values() {
        let dataset_id = dataset.dataset_id;
        let here = local.manifestations.get(&dataset_id);

        if dataset.deleted {
            if here.is_some() {
                actions.push(Action::DestroyDataset { dataset_id });
            }
            continue;
        }

        let may_serve = !not_serving.contains(&dataset_id);
        if dataset.primary == node_id {
            match here {
                None => {
                    if may_serve && may_create(dataset, status) {
                        actions.push(Action::CreateDataset {
                            dataset_id,
                            maximum_size: dataset.maximum_size,
                            epoch: dataset.epoch,
                        });
                    }
                }
                Some(copy) if !copy.primary => {
                    if may_serve && may_attach(node_id, dataset, copy, status) {
                        actions.push(Action::AttachDataset {
                            dataset_id,
                            epoch: dataset.epoch,
                        });
                    }
                }
                Some(copy) => {
                    if !may_serve || copy.epoch < dataset.epoch {
                        actions.push(Action::Demote { dataset_id });
                        continue;
                    }
                    serving.insert(dataset_id);
                    if copy.maximum_size != dataset.maximum_size {
                        actions.push(Action::ResizeDataset {
                            dataset_id,
                            maximum_size: dataset.maximum_size,
                        });
                    }
                    if let Some(to) = replica_behind(dataset, copy, status) {
                        actions.push(Action::Replicate { dataset_id, to });
                    }
                }
            }
        } else if let Some(copy) = here {
            let primary = configuration.nodes.get(&dataset.primary);
            if copy.primary {
                match primary {
                    Some(to) if copy.epoch >= dataset.epoch => actions.push(Action::Handoff {
                        dataset_id,
                        to: to.clone(),
                    }),
                    _ => actions.push(Action::Demote { dataset_id }),
                }
            } else if let Some(to) = primary.filter(|_| needs_push(node_id, dataset, copy, status)) {
                actions.push(Action::Replicate {
                    dataset_id,
                    to: to.clone(),
                });
            } else if dataset.replica != Some(node_id)
                && !policy.retain_moved_replicas
                && primary_caught_up(dataset, copy, status)
            {
                actions.push(Action::DestroyDataset { dataset_id });
            }
        }
    }

    if policy.manage_containers {
        container_changes(node_id, local, status, &serving, &mut actions);
    }

    actions.sort_by_key(Action::order);
    actions
}

/// A dataset is only created from nothing if no node anywhere reports a copy of it, and every
/// node has reported at least once, so that a copy on a node that has not reported since a
/// restart is never shadowed by an empty one.
fn may_create(dataset: &Dataset, status: &ClusterStatus) -> bool {
    !status.state.is_manifested(&dataset.dataset_id)
        && status
            .state
            .has_reports_from(status.configuration.nodes.keys())
}

fn may_attach(node_id: NodeId, dataset: &Dataset, copy: &Manifestation, status: &ClusterStatus) -> bool {
    status
        .state
        .manifestations(&dataset.dataset_id)
        .filter(|(node, other)| **node != node_id && other.epoch >= dataset.epoch)
        .all(|(_, other)| !other.primary && other.latest_snapshot() <= copy.latest_snapshot())
}

/// The replica of a failover dataset, if it is missing snapshots we have (or will have once the
/// next one is taken).
fn replica_behind(dataset: &Dataset, copy: &Manifestation, status: &ClusterStatus) -> Option<Node> {
    let replica = status.configuration.nodes.get(dataset.replica.as_ref()?)?;
    let remote = status
        .state
        .manifestation(&replica.node_id, &dataset.dataset_id);
    if remote.is_some_and(|r| r.primary) {
        return None;
    }
    let remote_latest = remote.and_then(Manifestation::latest_snapshot);
    if copy.changed || copy.diverged || remote_latest != copy.latest_snapshot() {
        Some(replica.clone())
    } else {
        None
    }
}

/// A detached copy whose handoff was interrupted after unmounting: the primary has not mounted
/// yet and is missing snapshots only this copy has.
fn needs_push(node_id: NodeId, dataset: &Dataset, copy: &Manifestation, status: &ClusterStatus) -> bool {
    let state = &status.state;
    let primary_copy = state.manifestation(&dataset.primary, &dataset.dataset_id);
    if primary_copy.is_some_and(|p| p.primary) || copy.epoch < dataset.epoch {
        return false;
    }
    let mounted_elsewhere = state
        .manifestations(&dataset.dataset_id)
        .any(|(node, other)| *node != node_id && other.primary && other.epoch >= dataset.epoch);
    copy.latest_snapshot().is_some()
        && !mounted_elsewhere
        && primary_copy.and_then(Manifestation::latest_snapshot) < copy.latest_snapshot()
}

/// Whether the primary has mounted the dataset with everything this copy holds.
fn primary_caught_up(dataset: &Dataset, copy: &Manifestation, status: &ClusterStatus) -> bool {
    status
        .state
        .manifestation(&dataset.primary, &dataset.dataset_id)
        .is_some_and(|p| p.primary && p.latest_snapshot() >= copy.latest_snapshot())
}

fn container_changes(
    node_id: NodeId,
    local: &NodeState,
    status: &ClusterStatus,
    serving: &BTreeSet<DatasetId>,
    actions: &mut Vec<Action>,
) {
    let desired: BTreeMap<&str, &Container> = status
        .configuration
        .containers_for(&node_id)
        .map(|c| (c.name.as_str(), c))
        .collect();
    let runnable = |c: &Container| {
        c.volume
            .as_ref()
            .map_or(true, |v| serving.contains(&v.dataset_id))
    };

    for (name, running) in &local.containers {
        match desired.get(name.as_str()) {
            Some(c) if c.image == running.image && runnable(c) => {}
            _ => actions.push(Action::StopContainer {
                name: name.clone(),
                dataset_id: running.dataset_id,
            }),
        }
    }

    for container in desired.values().filter(|c| runnable(c)) {
        match local.containers.get(&container.name) {
            Some(running) if running.running && running.image == container.image => {}
            _ => {
                let path = container
                    .volume
                    .as_ref()
                    .and_then(|v| local.manifestations.get(&v.dataset_id))
                    .and_then(|m| m.path.clone());
                actions.push(Action::StartContainer {
                    container: (*container).clone(),
                    path,
                });
            }
        }
    }
}

/// Drop the actions a node without a container runtime could never complete.
pub fn without_containers(actions: Vec<Action>) -> Vec<Action> {
    actions.into_iter().filter(|a| !a.is_container()).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{
        Configuration, ConfigurationChange, ContainerState, SnapshotId, VolumeMount,
    };

    const POLICY: DiffPolicy = DiffPolicy {
        retain_moved_replicas: false,
        manage_containers: true,
    };

    struct Fixture {
        a: Node,
        b: Node,
        c: Node,
        dataset_id: DatasetId,
        status: ClusterStatus,
        generation: u64,
    }

    impl Fixture {
        /// Three registered nodes and one dataset on `a`, with nothing reported yet.
        fn new(replica: bool) -> Self {
            let [a, b, c] = [1, 2, 3].map(|i| Node {
                node_id: NodeId::new_random(),
                address: format!("10.0.0.{i}:4525"),
            });
            let dataset_id = DatasetId::new_random();
            let mut configuration = Configuration::default();
            for node in [&a, &b, &c] {
                configuration = configuration
                    .apply(&ConfigurationChange::RegisterNode(node.clone()))
                    .unwrap();
            }
            configuration = configuration
                .apply(&ConfigurationChange::CreateDataset {
                    dataset_id: Some(dataset_id),
                    primary: a.node_id,
                    maximum_size: None,
                    metadata: Default::default(),
                    replica: replica.then_some(b.node_id),
                })
                .unwrap();
            Fixture {
                a,
                b,
                c,
                dataset_id,
                status: ClusterStatus {
                    configuration,
                    state: Default::default(),
                },
                generation: 0,
            }
        }

        fn change(&mut self, change: ConfigurationChange) {
            self.status.configuration = self.status.configuration.apply(&change).unwrap();
        }

        fn report(&mut self, node: &Node, copy: Option<Manifestation>) -> NodeState {
            let mut state = NodeState::empty(node);
            if let Some(copy) = copy {
                state.manifestations.insert(copy.dataset_id, copy);
            }
            self.generation += 1;
            self.status
                .state
                .merge(self.generation, state.clone(), Utc::now());
            state
        }

        fn diff(&self, node: &Node, local: &NodeState) -> Vec<Action> {
            calculate_changes(node.node_id, local, &self.status, &BTreeSet::new(), POLICY)
        }

        fn copy(&self, attached: bool, epoch: u64, snapshots: &[SnapshotId]) -> Manifestation {
            Manifestation {
                dataset_id: self.dataset_id,
                primary: attached,
                epoch,
                maximum_size: None,
                path: attached.then(|| format!("/flocker/{}", self.dataset_id)),
                snapshots: snapshots.to_vec(),
                changed: false,
                diverged: false,
            }
        }
    }

    fn snapshots(node: &Node, n: u64) -> Vec<SnapshotId> {
        (1..=n).map(|t| SnapshotId::new(t, node.node_id)).collect()
    }

    #[test]
    fn new_dataset_waits_for_every_node() {
        let mut f = Fixture::new(false);
        let (a, b, c) = (f.a.clone(), f.b.clone(), f.c.clone());

        let local = f.report(&a, None);
        assert_eq!(f.diff(&a, &local), vec![]);

        f.report(&b, None);
        f.report(&c, None);
        let local = f.report(&a, None);
        assert_eq!(
            f.diff(&a, &local),
            vec![Action::CreateDataset {
                dataset_id: f.dataset_id,
                maximum_size: None,
                epoch: 0
            }]
        );

        // Nothing to do once it exists.
        let local = f.report(&a, Some(f.copy(true, 0, &[])));
        assert_eq!(f.diff(&a, &local), vec![]);
        let local = f.report(&b, None);
        assert_eq!(f.diff(&b, &local), vec![]);
    }

    #[test]
    fn move_is_handoff_then_attach_then_cleanup() {
        let mut f = Fixture::new(false);
        let (a, b) = (f.a.clone(), f.b.clone());
        let id = f.dataset_id;
        let history = snapshots(&a, 3);
        f.change(ConfigurationChange::CreateContainer(Container {
            name: "db".to_string(),
            image: "postgres:16".to_string(),
            node: a.node_id,
            volume: Some(VolumeMount {
                dataset_id: id,
                mountpoint: "/var/lib/postgresql".to_string(),
            }),
            ports: vec![],
            environment: Default::default(),
        }));
        f.change(ConfigurationChange::MoveDataset {
            dataset_id: id,
            primary: b.node_id,
        });

        let mut on_a = f.report(&a, Some(f.copy(true, 0, &history)));
        on_a.containers.insert(
            "db".to_string(),
            ContainerState {
                name: "db".to_string(),
                image: "postgres:16".to_string(),
                running: true,
                dataset_id: Some(id),
            },
        );
        let on_b = f.report(&b, None);

        assert_eq!(
            f.diff(&a, &on_a),
            vec![
                Action::StopContainer {
                    name: "db".to_string(),
                    dataset_id: Some(id)
                },
                Action::Handoff {
                    dataset_id: id,
                    to: b.clone()
                },
            ]
        );
        // B must not create an empty dataset nor attach while A holds it.
        assert_eq!(f.diff(&b, &on_b), vec![]);
        let on_b = f.report(&b, Some(f.copy(false, 0, &history[..2])));
        assert_eq!(f.diff(&b, &on_b), vec![]);

        // A unmounted but B is still missing the final snapshot: A pushes it, B waits.
        let on_a = f.report(&a, Some(f.copy(false, 0, &history)));
        assert_eq!(
            f.diff(&a, &on_a),
            vec![Action::Replicate {
                dataset_id: id,
                to: b.clone()
            }]
        );
        assert_eq!(f.diff(&b, &on_b), vec![]);

        let on_b = f.report(&b, Some(f.copy(false, 0, &history)));
        assert_eq!(
            f.diff(&b, &on_b),
            vec![Action::AttachDataset {
                dataset_id: id,
                epoch: 0
            }]
        );

        let on_b = f.report(&b, Some(f.copy(true, 0, &history)));
        let actions = f.diff(&b, &on_b);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::StartContainer { container, path }
            if container.name == "db" && path.is_some()));
        assert_eq!(
            f.diff(&a, &on_a),
            vec![Action::DestroyDataset { dataset_id: id }]
        );
        let kept = calculate_changes(
            a.node_id,
            &on_a,
            &f.status,
            &BTreeSet::new(),
            DiffPolicy {
                retain_moved_replicas: true,
                ..POLICY
            },
        );
        assert_eq!(kept, vec![]);
    }

    #[test]
    fn primary_replicates_until_replica_catches_up() {
        let mut f = Fixture::new(true);
        let (a, b) = (f.a.clone(), f.b.clone());
        let id = f.dataset_id;
        let history = snapshots(&a, 2);

        let on_a = f.report(&a, Some(f.copy(true, 0, &history)));
        let on_b = f.report(&b, None);
        assert_eq!(
            f.diff(&a, &on_a),
            vec![Action::Replicate {
                dataset_id: id,
                to: b.clone()
            }]
        );
        // The replica never creates or attaches anything on its own.
        assert_eq!(f.diff(&b, &on_b), vec![]);

        let on_b = f.report(&b, Some(f.copy(false, 0, &history)));
        assert_eq!(f.diff(&a, &on_a), vec![]);
        assert_eq!(f.diff(&b, &on_b), vec![]);

        let mut written = f.copy(true, 0, &history);
        written.changed = true;
        let on_a = f.report(&a, Some(written));
        assert_eq!(f.diff(&a, &on_a).len(), 1);
    }

    #[test]
    fn promotion_elsewhere_demotes_without_handoff() {
        let mut f = Fixture::new(true);
        let (a, b) = (f.a.clone(), f.b.clone());
        let id = f.dataset_id;
        let history = snapshots(&a, 2);
        f.change(ConfigurationChange::Promote {
            dataset_id: id,
            node_id: b.node_id,
            epoch: 1,
        });

        // A's last report still shows it mounted under epoch 0; B may take over regardless.
        let on_a = f.report(&a, Some(f.copy(true, 0, &history)));
        let on_b = f.report(&b, Some(f.copy(false, 0, &history[..1])));
        assert_eq!(
            f.diff(&b, &on_b),
            vec![Action::AttachDataset {
                dataset_id: id,
                epoch: 1
            }]
        );
        assert_eq!(f.diff(&a, &on_a), vec![Action::Demote { dataset_id: id }]);

        // Once demoted, A's newer snapshots are not pushed over B's and its copy is kept.
        let on_a = f.report(&a, Some(f.copy(false, 0, &history)));
        f.report(&b, Some(f.copy(true, 1, &history[..1])));
        assert_eq!(f.diff(&a, &on_a), vec![]);
    }

    #[test]
    fn coordinator_veto_demotes_and_blocks_attach() {
        let mut f = Fixture::new(true);
        let a = f.a.clone();
        let id = f.dataset_id;
        let on_a = f.report(&a, Some(f.copy(true, 0, &[])));
        let vetoed = BTreeSet::from([id]);

        assert_eq!(
            calculate_changes(a.node_id, &on_a, &f.status, &vetoed, POLICY),
            vec![Action::Demote { dataset_id: id }]
        );
        let on_a = f.report(&a, Some(f.copy(false, 0, &[])));
        assert_eq!(
            calculate_changes(a.node_id, &on_a, &f.status, &vetoed, POLICY),
            vec![]
        );
    }

    #[test]
    fn deleted_dataset_is_destroyed_everywhere() {
        let mut f = Fixture::new(true);
        let (a, b) = (f.a.clone(), f.b.clone());
        let id = f.dataset_id;
        f.change(ConfigurationChange::DeleteDataset { dataset_id: id });

        let on_a = f.report(&a, Some(f.copy(true, 0, &[])));
        let on_b = f.report(&b, Some(f.copy(false, 0, &[])));
        assert_eq!(
            f.diff(&a, &on_a),
            vec![Action::DestroyDataset { dataset_id: id }]
        );
        assert_eq!(
            f.diff(&b, &on_b),
            vec![Action::DestroyDataset { dataset_id: id }]
        );
    }

    #[test]
    fn containers_follow_image_and_runtime() {
        let mut f = Fixture::new(false);
        let a = f.a.clone();
        f.change(ConfigurationChange::CreateContainer(Container {
            name: "web".to_string(),
            image: "nginx:1.27".to_string(),
            node: a.node_id,
            volume: None,
            ports: vec![],
            environment: Default::default(),
        }));
        let mut on_a = f.report(&a, Some(f.copy(true, 0, &[])));
        on_a.containers.insert(
            "web".to_string(),
            ContainerState {
                name: "web".to_string(),
                image: "nginx:1.25".to_string(),
                running: true,
                dataset_id: None,
            },
        );

        let actions = f.diff(&a, &on_a);
        assert_eq!(
            actions.iter().map(Action::name).collect::<Vec<_>>(),
            vec!["stop_container", "start_container"]
        );
        assert!(without_containers(actions).is_empty());
    }
}
