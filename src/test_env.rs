// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! An in-process cluster for tests.
//!
//! A `TestCluster` holds one control service and any number of agents. Every agent has an
//! in-memory storage backend and container runtime, and agents reach each other through a
//! `LocalNetwork` instead of sockets, which the test can partition. Nothing runs in the
//! background: the test drives every agent cycle and heartbeat explicitly, so each step of a
//! scenario happens exactly when the test says.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    agent::{
        heartbeat::FailoverManager,
        peer::{PeerService, Peers},
        Agent, CycleOutcome,
    },
    backend::{Backend, MemoryBackend, ReplicationStream},
    config::{ConvergenceConfig, FailoverConfig, ReplicationConfig},
    container::{ContainerRuntime, MemoryRuntime},
    control::{store::MemoryStore, ControlService},
    error::{ConfigurationError, ReplicationError},
    failover::PeerStatus,
    model::{
        ClusterStatus, Configuration, ConfigurationChange, DatasetId, Node, NodeId, SnapshotId,
    },
    protocol::ReceiveRequest,
    replication::{Peer, ReplicationEngine},
};

/// Routes peer requests between the agents of a `TestCluster`.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    services: Mutex<BTreeMap<NodeId, Arc<PeerService>>>,
    partitions: Mutex<BTreeSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    fn connected(&self, a: NodeId, b: NodeId) -> bool {
        let partitions = self.partitions.lock().unwrap();
        !partitions.contains(&(a, b)) && !partitions.contains(&(b, a))
    }
}

#[derive(Debug, Clone)]
pub struct LocalPeers {
    from: NodeId,
    network: Arc<LocalNetwork>,
}

impl Peers for LocalPeers {
    type Peer = LocalPeer;

    fn peer(&self, node: &Node) -> LocalPeer {
        LocalPeer {
            from: self.from,
            to: node.node_id,
            network: Arc::clone(&self.network),
        }
    }
}

/// A peer reached through a `LocalNetwork`. Failures on the far side come back the way they would
/// over TCP: as a rejection carrying the failure kind.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    from: NodeId,
    to: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalPeer {
    fn service(&self) -> Result<Arc<PeerService>, ReplicationError> {
        let unreachable = |reason: &str| ReplicationError::PeerUnreachable {
            peer: self.to.to_string(),
            reason: reason.to_string(),
        };
        if !self.network.connected(self.from, self.to) {
            return Err(unreachable("network partitioned"));
        }
        self.network
            .services
            .lock()
            .unwrap()
            .get(&self.to)
            .cloned()
            .ok_or_else(|| unreachable("no such agent"))
    }

    fn rejected(&self, e: ReplicationError) -> ReplicationError {
        ReplicationError::Rejected {
            peer: self.to,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl Peer for LocalPeer {
    fn node_id(&self) -> NodeId {
        self.to
    }

    async fn list_snapshots(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Option<Vec<SnapshotId>>, ReplicationError> {
        let service = self.service()?;
        service
            .list_snapshots(dataset_id)
            .await
            .map_err(|e| self.rejected(e))
    }

    async fn receive(
        &self,
        request: ReceiveRequest,
        stream: ReplicationStream<'_>,
    ) -> Result<(), ReplicationError> {
        let service = self.service()?;
        service
            .receive(&request, stream)
            .await
            .map_err(|e| self.rejected(e))
    }

    async fn exchange_status(&self, status: PeerStatus) -> Result<PeerStatus, ReplicationError> {
        Ok(self.service()?.status(&status))
    }
}

pub struct TestNode {
    pub node: Node,
    pub backend: MemoryBackend,
    pub runtime: MemoryRuntime,
    pub agent: Agent<LocalPeers>,
    peers: LocalPeers,
    control_reachable: bool,
    /// The last cluster status this agent received; kept while the control service is unreachable.
    status: Option<ClusterStatus>,
}

impl TestNode {
    pub fn node_id(&self) -> NodeId {
        self.node.node_id
    }

    /// Whether this node has the dataset mounted read-write.
    pub fn is_attached(&self, dataset_id: DatasetId) -> bool {
        self.backend
            .list()
            .unwrap_or_default()
            .iter()
            .any(|v| v.dataset_id == dataset_id && v.attached)
    }

    pub fn has_copy(&self, dataset_id: DatasetId) -> bool {
        self.backend
            .list()
            .unwrap_or_default()
            .iter()
            .any(|v| v.dataset_id == dataset_id)
    }
}

pub struct TestCluster {
    pub control: Arc<ControlService>,
    store: MemoryStore,
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// A cluster of `size` nodes with the default failover timing.
    pub fn new(size: usize) -> Self {
        Self::with_failover(size, FailoverConfig::default())
    }

    pub fn with_failover(size: usize, failover: FailoverConfig) -> Self {
        let store = MemoryStore::new();
        let network = Arc::new(LocalNetwork::default());
        let nodes = (0..size)
            .map(|i| Self::start_node(i, &network, &failover))
            .collect();
        TestCluster {
            control: Arc::new(control_service(&store)),
            store,
            network,
            nodes,
        }
    }

    fn start_node(i: usize, network: &Arc<LocalNetwork>, failover: &FailoverConfig) -> TestNode {
        let node = Node {
            node_id: NodeId::new_random(),
            address: format!("10.0.0.{}:4525", i + 1),
        };
        let backend = MemoryBackend::new();
        let runtime = MemoryRuntime::default();
        let engine = Arc::new(ReplicationEngine::new(
            node.node_id,
            Backend::Memory(backend.clone()),
            ReplicationConfig::default(),
            &ConvergenceConfig::default(),
        ));
        let failover = Arc::new(FailoverManager::new(node.node_id, failover));
        network.services.lock().unwrap().insert(
            node.node_id,
            Arc::new(PeerService::new(Arc::clone(&engine), Arc::clone(&failover))),
        );
        let peers = LocalPeers {
            from: node.node_id,
            network: Arc::clone(network),
        };
        let agent = Agent::new(
            node.clone(),
            engine,
            ContainerRuntime::Memory(runtime.clone()),
            failover,
            peers.clone(),
            false,
        );
        TestNode {
            node,
            backend,
            runtime,
            agent,
            peers,
            control_reachable: true,
            status: None,
        }
    }

    pub fn node_id(&self, i: usize) -> NodeId {
        self.nodes[i].node_id()
    }

    pub fn configuration(&self) -> Configuration {
        self.control.configuration()
    }

    pub async fn change(
        &self,
        change: ConfigurationChange,
    ) -> Result<Configuration, ConfigurationError> {
        self.control.update_configuration(change).await
    }

    /// Create a dataset, returning its identifier.
    pub async fn create_dataset(&self, primary: usize, replica: Option<usize>) -> DatasetId {
        let dataset_id = DatasetId::new_random();
        self.change(ConfigurationChange::CreateDataset {
            dataset_id: Some(dataset_id),
            primary: self.node_id(primary),
            maximum_size: None,
            metadata: Default::default(),
            replica: replica.map(|r| self.node_id(r)),
        })
        .await
        .unwrap();
        dataset_id
    }

    /// One Discover, Report, Diff and Act cycle on node `i`. An agent cut off from the control
    /// service converges towards the last status it received.
    pub async fn cycle(&mut self, i: usize) -> CycleOutcome {
        let control = Arc::clone(&self.control);
        let node = &mut self.nodes[i];
        let Ok((generation, state)) = node.agent.discover().await else {
            return CycleOutcome::default();
        };
        if node.control_reachable {
            control.report_state(generation, state.clone()).await;
            node.status = Some(control.status());
        }
        let Some(status) = node.status.clone() else {
            return CycleOutcome::default();
        };
        let outcome = node
            .agent
            .converge(&state, &status, node.control_reachable)
            .await;
        if node.control_reachable {
            for (dataset_id, epoch) in &outcome.promotions {
                let _ = control
                    .promoted(*dataset_id, node.node_id(), *epoch)
                    .await;
            }
        }
        outcome
    }

    /// Run one cycle on every node in turn, returning how many actions were taken in total.
    pub async fn round(&mut self) -> usize {
        let mut actions = 0;
        for i in 0..self.nodes.len() {
            actions += self.cycle(i).await.actions.len();
        }
        actions
    }

    /// Exchange one heartbeat between every connected pair.
    pub async fn heartbeat(&self) {
        for node in &self.nodes {
            node.agent.failover().heartbeat_once(&node.peers).await;
        }
    }

    /// Run rounds (with heartbeats) until two rounds in a row take no action. Returns the number
    /// of rounds run, or panics if the cluster has not settled after `max_rounds`.
    pub async fn converge(&mut self, max_rounds: usize) -> usize {
        let mut quiet = 0;
        for round in 1..=max_rounds {
            self.heartbeat().await;
            if self.round().await == 0 {
                quiet += 1;
                if quiet == 2 {
                    return round;
                }
            } else {
                quiet = 0;
            }
        }
        panic!("cluster did not converge within {max_rounds} rounds");
    }

    pub fn partition(&self, a: usize, b: usize) {
        let (a, b) = (self.node_id(a), self.node_id(b));
        self.network.partitions.lock().unwrap().insert((a, b));
    }

    pub fn heal(&self) {
        self.network.partitions.lock().unwrap().clear();
    }

    pub fn set_control_reachable(&mut self, i: usize, reachable: bool) {
        self.nodes[i].control_reachable = reachable;
    }

    /// Replace the control service with a new one loaded from what the old one saved. The cluster
    /// state starts out empty again and is rebuilt from the next reports.
    pub fn restart_control(&mut self) {
        self.control = Arc::new(control_service(&self.store));
    }

    /// The nodes that have `dataset_id` mounted read-write right now.
    pub fn attached_on(&self, dataset_id: DatasetId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_attached(dataset_id))
            .map(TestNode::node_id)
            .collect()
    }
}

fn control_service(store: &MemoryStore) -> ControlService {
    ControlService::new(Box::new(store.clone()), None, Duration::from_secs(60))
        .expect("memory store always loads")
}

/// Failover timing short enough for tests that wait out a liveness timeout.
pub fn fast_failover() -> FailoverConfig {
    FailoverConfig {
        liveness_timeout: 1,
        heartbeat_interval: 1,
    }
}
