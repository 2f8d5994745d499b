// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The convergence agent that runs on every node.
//!
//! Each cycle is Discover, Report, Diff and Act. Discovery reads the local storage backend and
//! container runtime, the report goes to the control service, and the diff against the latest
//! cluster status yields the actions to run. Actions on different datasets run concurrently;
//! actions on one dataset run in order, and a failure abandons the rest of that dataset's actions
//! until the next cycle.

pub mod control_client;
pub mod deployer;
pub mod heartbeat;
pub mod peer;
pub mod prober;

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    chrono::Utc,
    clap::Parser,
    futures::future::join_all,
    log::{debug, info, warn},
    tokio::net::TcpListener,
};

use crate::{
    backend::Backend,
    commands::{Handle, HandledResult},
    config::{AgentConfig, NodeConfig},
    container::ContainerRuntime,
    error::{BackendError, ReplicationError},
    model::{ClusterStatus, DatasetId, Node, NodeId, NodeState},
    protocol::AgentMessage,
    replication::ReplicationEngine,
    tls::{Acceptor, Connector, TlsFiles},
};

use {
    control_client::{configuration_changed, ControlClient},
    deployer::{Action, DiffPolicy},
    heartbeat::FailoverManager,
    peer::{PeerService, Peers, TcpPeers},
};

#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to agent.yml.
    #[arg(long)]
    pub config: Option<String>,

    /// Talk to the control service and to peers without TLS. This is ONLY for use in test
    /// environments.
    #[arg(long)]
    pub no_mtls: bool,

    #[arg(long)]
    pub verbose: bool,
}

/// What one Diff and Act pass decided and how it went.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub actions: Vec<Action>,
    /// Promotions the failover coordinators want the control service to record.
    pub promotions: Vec<(DatasetId, u64)>,
    pub failed: usize,
}

pub struct Agent<P: Peers> {
    node: Node,
    engine: Arc<ReplicationEngine>,
    containers: ContainerRuntime,
    failover: Arc<FailoverManager>,
    peers: P,
    policy: DiffPolicy,
    cycle: u64,
    generation: u64,
}

impl<P: Peers> Agent<P> {
    pub fn new(
        node: Node,
        engine: Arc<ReplicationEngine>,
        containers: ContainerRuntime,
        failover: Arc<FailoverManager>,
        peers: P,
        retain_moved_replicas: bool,
    ) -> Self {
        let policy = DiffPolicy {
            retain_moved_replicas,
            manage_containers: containers.enabled(),
        };
        // Generations start from the clock so a restarted agent is never mistaken for a stale one.
        let generation = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        Agent {
            node,
            engine,
            containers,
            failover,
            peers,
            policy,
            cycle: 0,
            generation,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    /// Discover local state. On success, returns it with the generation to report it under.
    pub async fn discover(&mut self) -> Result<(u64, NodeState), BackendError> {
        match prober::discover(&self.node, &self.engine, &self.containers).await {
            Ok(state) => {
                self.failover.set_storage_healthy(true);
                self.generation += 1;
                Ok((self.generation, state))
            }
            Err(e) => {
                self.failover.set_storage_healthy(false);
                Err(e)
            }
        }
    }

    /// Run one Diff and Act pass against `status`.
    pub async fn converge(
        &mut self,
        local: &NodeState,
        status: &ClusterStatus,
        control_reachable: bool,
    ) -> CycleOutcome {
        self.cycle += 1;
        let cycle = self.cycle;
        let promotions = self
            .failover
            .step(&status.configuration, local, control_reachable);
        let not_serving = self.failover.not_serving();
        let actions = deployer::calculate_changes(
            self.node.node_id,
            local,
            status,
            &not_serving,
            self.policy,
        );
        if actions.is_empty() {
            debug!(
                "cycle={cycle} node={} converged at configuration version {}",
                self.node.node_id, status.configuration.version
            );
        }
        let failed = self.act(cycle, &actions).await;
        CycleOutcome {
            cycle,
            actions,
            promotions,
            failed,
        }
    }

    /// Run `actions`, returning how many failed.
    async fn act(&self, cycle: u64, actions: &[Action]) -> usize {
        let mut groups: BTreeMap<Option<DatasetId>, Vec<&Action>> = BTreeMap::new();
        for action in actions {
            groups.entry(action.dataset_id()).or_default().push(action);
        }
        let runs = groups
            .into_iter()
            .map(|(dataset_id, group)| self.act_group(cycle, dataset_id, group));
        join_all(runs).await.into_iter().sum()
    }

    async fn act_group(
        &self,
        cycle: u64,
        dataset_id: Option<DatasetId>,
        group: Vec<&Action>,
    ) -> usize {
        let node_id = self.node.node_id;
        let dataset = dataset_id.map_or("-".to_string(), |id| id.to_string());
        let mut failed = 0;
        for (i, action) in group.iter().enumerate() {
            info!("cycle={cycle} node={node_id} dataset={dataset} action={action}");
            let Err(e) = self.execute(action).await else {
                continue;
            };
            failed += 1;
            warn!("cycle={cycle} node={node_id} dataset={dataset} action={action} failed: {e}");
            // Containers without a dataset do not depend on each other.
            if dataset_id.is_some() {
                let skipped = group.len() - i - 1;
                if skipped > 0 {
                    warn!("cycle={cycle} node={node_id} dataset={dataset} skipped {skipped} later action(s)");
                }
                break;
            }
        }
        failed
    }

    async fn execute(&self, action: &Action) -> Result<(), ReplicationError> {
        match action {
            Action::StopContainer { name, .. } => self.containers.remove(name).await?,
            Action::CreateDataset {
                dataset_id,
                maximum_size,
                epoch,
            } => {
                self.engine
                    .create(*dataset_id, *maximum_size, *epoch)
                    .await?;
            }
            Action::AttachDataset { dataset_id, epoch } => {
                self.engine.attach(*dataset_id, *epoch).await?;
            }
            Action::ResizeDataset {
                dataset_id,
                maximum_size,
            } => self.engine.resize(*dataset_id, *maximum_size).await?,
            Action::Replicate { dataset_id, to } => {
                let peer = self.peers.peer(to);
                // A detached copy pushing to its primary sends what it has; it never snapshots.
                let attached = self
                    .engine
                    .volume(*dataset_id)
                    .await?
                    .is_some_and(|v| v.attached);
                if attached {
                    self.engine.ensure_snapshot(*dataset_id).await?;
                }
                self.engine.replicate(*dataset_id, &peer).await?;
            }
            Action::Handoff { dataset_id, to } => {
                let peer = self.peers.peer(to);
                // Send the bulk while still mounted, then only the last writes after unmounting.
                self.engine.final_snapshot(*dataset_id).await?;
                self.engine.replicate(*dataset_id, &peer).await?;
                self.engine.detach(*dataset_id).await?;
                self.engine.final_snapshot(*dataset_id).await?;
                self.engine.replicate(*dataset_id, &peer).await?;
            }
            Action::Demote { dataset_id } => {
                // Writes since the last cycle join this copy's history before it unmounts.
                self.engine.final_snapshot(*dataset_id).await?;
                self.engine.detach(*dataset_id).await?;
            }
            Action::DestroyDataset { dataset_id } => self.engine.destroy(*dataset_id).await?,
            Action::StartContainer { container, path } => {
                self.containers
                    .start(container, path.as_deref().map(Path::new))
                    .await?
            }
        }
        Ok(())
    }

    /// Reconcile forever. A new cycle starts when the configuration version changes or after
    /// `poll_interval`, whichever comes first.
    pub async fn run(&mut self, control: &ControlClient, poll_interval: Duration) {
        let mut updates = control.subscribe();
        let mut version = None;
        loop {
            match self.discover().await {
                Ok((generation, state)) => {
                    control.send(AgentMessage::ReportState {
                        node_id: self.node.node_id,
                        generation,
                        state: state.clone(),
                    });
                    match control.status() {
                        Some(status) => {
                            version = Some(status.configuration.version);
                            let outcome = self.converge(&state, &status, control.connected()).await;
                            for (dataset_id, epoch) in outcome.promotions {
                                control.send(AgentMessage::Promoted {
                                    dataset_id,
                                    node_id: self.node.node_id,
                                    epoch,
                                });
                            }
                        }
                        None => debug!("node={} no cluster status received yet", self.node.node_id),
                    }
                }
                Err(e) => warn!(
                    "node={} discovery failed, not reporting this cycle: {e}",
                    self.node.node_id
                ),
            }
            configuration_changed(&mut updates, version, poll_interval).await;
        }
    }
}

/// Read the node identifier persisted at `path`, generating and saving one on first start.
pub fn load_or_create_node_id(path: &Path) -> io::Result<NodeId> {
    match std::fs::read_to_string(path) {
        Ok(text) => text.trim().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("'{}' does not hold a node id: {e}", path.display()),
            )
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let node_id = NodeId::new_random();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, format!("{node_id}\n"))?;
            info!("generated node id {node_id} in '{}'", path.display());
            Ok(node_id)
        }
        Err(e) => Err(e),
    }
}

fn local_node(config: &NodeConfig) -> HandledResult<Node> {
    let node_id = match config.uuid {
        Some(node_id) => node_id,
        None => {
            let path = config
                .uuid_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(crate::default_node_uuid_path()));
            load_or_create_node_id(&path).handle_err(|e| {
                eprintln!("Could not load node id from '{}': {e}", path.display())
            })?
        }
    };
    let host = match &config.address {
        Some(address) => address.clone(),
        None => nix::unistd::gethostname()
            .handle_err(|e| eprintln!("Could not get hostname: {e}"))?
            .to_string_lossy()
            .into_owned(),
    };
    let port = config.peer_port.unwrap_or_else(crate::peer_port);
    Ok(Node {
        node_id,
        address: format!("{host}:{port}"),
    })
}

/// Agent daemon -
///
/// This launches four tasks sharing one replication engine:
///
/// - The connection to the control service, reconnecting with backoff whenever it drops.
///
/// - The peer listener, which answers snapshot listings, replication streams and heartbeats from
///   other agents.
///
/// - The heartbeat loop feeding the failover coordinators.
///
/// - The convergence loop itself.
pub fn main(cli: Cli) -> HandledResult<()> {
    let mtls = !cli.no_mtls;
    let path = cli.config.unwrap_or_else(crate::default_agent_config_path);
    let config = AgentConfig::load(&path)?;
    let node = local_node(&config.node)?;

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Could not launch agent runtime: {e}"))?;

    rt.block_on(async {
        let tls_files = TlsFiles::node();
        let connector = Connector::new(mtls, &tls_files)
            .handle_err(|e| eprintln!("Could not load TLS certificates: {e}"))?;
        let acceptor = Acceptor::new(mtls, &tls_files)
            .handle_err(|e| eprintln!("Could not load TLS certificates: {e}"))?;

        let backend = Backend::from_config(&config.dataset);
        info!("node={} storing datasets with the {} backend", node.node_id, backend.name());
        let engine = Arc::new(ReplicationEngine::new(
            node.node_id,
            backend,
            config.replication.clone(),
            &config.convergence,
        ));
        let failover = Arc::new(FailoverManager::new(node.node_id, &config.failover));

        let peer_port = config.node.peer_port.unwrap_or_else(crate::peer_port);
        let listener = TcpListener::bind(("0.0.0.0", peer_port))
            .await
            .handle_err(|e| eprintln!("Could not listen on peer port {peer_port}: {e}"))?;
        info!("listening for peers on port {peer_port}");
        let service = Arc::new(PeerService::new(Arc::clone(&engine), Arc::clone(&failover)));

        let peers = TcpPeers::new(connector.clone());
        let (control, queue) =
            ControlClient::new(node.clone(), config.control_service.address(), connector);
        let mut agent = Agent::new(
            node,
            engine,
            ContainerRuntime::from_config(config.container_runtime),
            Arc::clone(&failover),
            peers.clone(),
            config.convergence.retain_moved_replicas,
        );

        futures::join!(
            control.run(queue),
            peer::serve_peers(listener, acceptor, config.allowed_network, service),
            failover.run_heartbeats(peers),
            agent.run(&control, config.convergence.poll_interval()),
        );
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("node.uuid");

        let first = load_or_create_node_id(&path).unwrap();
        let second = load_or_create_node_id(&path).unwrap();
        assert_eq!(first, second);

        std::fs::write(&path, "not-a-uuid").unwrap();
        assert_eq!(
            load_or_create_node_id(&path).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn configured_node_address() {
        let config = NodeConfig {
            uuid: Some(NodeId::new_random()),
            uuid_path: None,
            address: Some("10.0.0.7".to_string()),
            peer_port: Some(5000),
        };
        let node = local_node(&config).unwrap();
        assert_eq!(node.node_id, config.uuid.unwrap());
        assert_eq!(node.address, "10.0.0.7:5000");
    }
}
