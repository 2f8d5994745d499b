// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Runs one failover coordinator per replicated dataset this node holds, and the heartbeat
//! exchange that feeds them.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use {
    futures::future::join_all,
    log::{debug, warn},
};

use crate::{
    agent::peer::Peers,
    config::FailoverConfig,
    failover::{Coordinator, Decision, LocalView, PeerStatus, Role, TwoNodeQuorum},
    model::{Configuration, DatasetId, Node, NodeId, NodeState},
    replication::Peer,
};

#[derive(Debug)]
pub struct FailoverManager {
    node_id: NodeId,
    liveness_timeout: Duration,
    heartbeat_interval: Duration,
    coordinators: Mutex<BTreeMap<DatasetId, Coordinator<TwoNodeQuorum>>>,
    /// The other member of every pair, as found in the latest configuration.
    peers: Mutex<BTreeMap<NodeId, Node>>,
    control_reachable: AtomicBool,
    storage_healthy: AtomicBool,
}

impl FailoverManager {
    pub fn new(node_id: NodeId, config: &FailoverConfig) -> Self {
        FailoverManager {
            node_id,
            liveness_timeout: config.liveness_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            coordinators: Mutex::new(BTreeMap::new()),
            peers: Mutex::new(BTreeMap::new()),
            control_reachable: AtomicBool::new(false),
            storage_healthy: AtomicBool::new(true),
        }
    }

    pub fn set_storage_healthy(&self, healthy: bool) {
        self.storage_healthy.store(healthy, Ordering::SeqCst);
    }

    /// The status this node sends to its peers.
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            node_id: self.node_id,
            storage_healthy: self.storage_healthy.load(Ordering::SeqCst),
            control_reachable: self.control_reachable.load(Ordering::SeqCst),
            masters: self
                .coordinators
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, c)| c.role() == Role::Master)
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    /// Feed a status message from a peer to every coordinator paired with it.
    pub fn observe(&self, status: &PeerStatus) {
        let now = Instant::now();
        for coordinator in self.coordinators.lock().unwrap().values_mut() {
            coordinator.observe(status, now);
        }
    }

    /// Bring the set of coordinators in line with `configuration` and step each of them. Returns
    /// the promotions to ask the control service for, as `(dataset, epoch)`.
    pub fn step(
        &self,
        configuration: &Configuration,
        local: &NodeState,
        control_reachable: bool,
    ) -> Vec<(DatasetId, u64)> {
        self.control_reachable
            .store(control_reachable, Ordering::SeqCst);
        let now = Instant::now();
        let mut coordinators = self.coordinators.lock().unwrap();
        let mut peers = BTreeMap::new();
        let mut promotions = Vec::new();

        let pairs: BTreeMap<DatasetId, (NodeId, NodeId)> = configuration
            .datasets
            .values()
            .filter(|d| !d.deleted && d.hosted_on(&self.node_id))
            .filter_map(|d| {
                let replica = d.replica?;
                let peer = if d.primary == self.node_id {
                    replica
                } else {
                    d.primary
                };
                Some((d.dataset_id, (peer, d.primary)))
            })
            .collect();
        coordinators.retain(|id, _| pairs.contains_key(id));

        for (dataset_id, (peer, primary)) in pairs {
            if let Some(node) = configuration.nodes.get(&peer) {
                peers.insert(peer, node.clone());
            }
            let coordinator = coordinators.entry(dataset_id).or_insert_with(|| {
                Coordinator::new(
                    dataset_id,
                    self.node_id,
                    peer,
                    primary,
                    TwoNodeQuorum,
                    self.liveness_timeout,
                    now,
                )
            });
            coordinator.set_peer(peer, now);

            let dataset = &configuration.datasets[&dataset_id];
            let copy = local.manifestations.get(&dataset_id);
            let view = LocalView {
                primary,
                epoch: dataset.epoch,
                attached: copy.is_some_and(|m| m.primary),
                has_copy: copy.is_some_and(|m| !m.snapshots.is_empty()),
                control_reachable,
            };
            if let Some(Decision::RequestPromotion { epoch }) = coordinator.step(&view, now) {
                warn!(
                    "dataset={dataset_id} node={} peer={peer} unavailable; requesting promotion at epoch {epoch}",
                    self.node_id
                );
                promotions.push((dataset_id, epoch));
            }
        }

        *self.peers.lock().unwrap() = peers;
        promotions
    }

    /// The failover datasets this node currently must not serve.
    pub fn not_serving(&self) -> BTreeSet<DatasetId> {
        self.coordinators
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| !c.may_serve())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn role(&self, dataset_id: DatasetId) -> Option<Role> {
        self.coordinators
            .lock()
            .unwrap()
            .get(&dataset_id)
            .map(|c| c.role())
    }

    pub fn peers(&self) -> Vec<Node> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    /// Exchange status with every peer once.
    pub async fn heartbeat_once<P: Peers>(&self, peers: &P) {
        let status = self.status();
        let exchanges = self.peers().into_iter().map(|node| {
            let peer = peers.peer(&node);
            let status = status.clone();
            async move { (node.node_id, peer.exchange_status(status).await) }
        });
        for (node_id, result) in join_all(exchanges).await {
            match result {
                Ok(reply) if reply.node_id == node_id => self.observe(&reply),
                Ok(reply) => warn!("peer={node_id} answered as {}", reply.node_id),
                Err(e) => debug!("peer={node_id} heartbeat failed: {e}"),
            }
        }
    }

    pub async fn run_heartbeats<P: Peers>(&self, peers: P) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.heartbeat_once(&peers).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConfigurationChange;

    fn node(i: u8) -> Node {
        Node {
            node_id: NodeId::new_random(),
            address: format!("10.0.0.{i}:4525"),
        }
    }

    #[test]
    fn coordinators_follow_configuration() {
        let (a, b) = (node(1), node(2));
        let mut configuration = Configuration::default();
        for n in [&a, &b] {
            configuration = configuration
                .apply(&ConfigurationChange::RegisterNode(n.clone()))
                .unwrap();
        }
        let plain = DatasetId::new_random();
        let paired = DatasetId::new_random();
        for (id, replica) in [(plain, None), (paired, Some(b.node_id))] {
            configuration = configuration
                .apply(&ConfigurationChange::CreateDataset {
                    dataset_id: Some(id),
                    primary: a.node_id,
                    maximum_size: None,
                    metadata: Default::default(),
                    replica,
                })
                .unwrap();
        }

        let on_a = FailoverManager::new(a.node_id, &FailoverConfig::default());
        assert!(on_a.step(&configuration, &NodeState::empty(&a), true).is_empty());
        assert_eq!(on_a.role(paired), Some(Role::Master));
        assert_eq!(on_a.role(plain), None);
        assert_eq!(on_a.peers(), vec![b.clone()]);
        assert!(on_a.status().masters.contains(&paired));

        let on_b = FailoverManager::new(b.node_id, &FailoverConfig::default());
        on_b.step(&configuration, &NodeState::empty(&b), true);
        assert_eq!(on_b.role(paired), Some(Role::Slave));
        assert_eq!(on_b.not_serving(), BTreeSet::from([paired]));

        let configuration = configuration
            .apply(&ConfigurationChange::DeleteDataset { dataset_id: paired })
            .unwrap();
        on_a.step(&configuration, &NodeState::empty(&a), true);
        assert_eq!(on_a.role(paired), None);
        assert!(on_a.peers().is_empty());
    }
}
