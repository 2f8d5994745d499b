// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The Discover step: what actually exists on this node right now.

use crate::{
    container::ContainerRuntime,
    error::BackendError,
    model::{Manifestation, Node, NodeState, Stash},
    replication::ReplicationEngine,
};

/// Build this node's local state from the storage backend and the container runtime. Fails if
/// either cannot be asked at all, in which case nothing should be reported for this cycle.
pub async fn discover(
    node: &Node,
    engine: &ReplicationEngine,
    containers: &ContainerRuntime,
) -> Result<NodeState, BackendError> {
    let mut state = NodeState::empty(node);

    for volume in engine.backend().list().await? {
        let dataset_id = volume.dataset_id;
        let changed = if volume.attached {
            engine
                .snapshot_due(dataset_id, volume.snapshots.last())
                .await?
        } else {
            false
        };
        state.manifestations.insert(
            dataset_id,
            Manifestation {
                dataset_id,
                primary: volume.attached,
                epoch: volume.epoch,
                maximum_size: volume.maximum_size,
                path: volume.path.map(|p| p.display().to_string()),
                snapshots: volume.snapshots,
                changed,
                diverged: engine.is_diverged(dataset_id),
            },
        );
    }

    for container in containers.list().await? {
        state.containers.insert(container.name.clone(), container);
    }

    state.stashes = engine
        .backend()
        .stashes()
        .await?
        .iter()
        .filter_map(|label| Stash::from_label(label))
        .collect();

    Ok(state)
}
