// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The control service: the single authority over the cluster configuration, and the place where
//! node reports are merged into the cluster state.
//!
//! Writers of the configuration are serialized by one lock around the whole document. The
//! current `(Configuration, ClusterState)` pair lives in a `watch` channel, so every connected
//! agent sees each accepted change without polling.

pub mod http;
pub mod server;
pub mod store;

use std::{io, path::Path, sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    clap::Parser,
    log::{debug, error, info, warn},
    serde::{Deserialize, Serialize},
    tokio::sync::{watch, Mutex},
};

use crate::{
    commands::{Handle, HandledError, HandledResult},
    config::ControlConfig,
    error::ConfigurationError,
    journal::{Journal, Record},
    model::{
        ClusterStatus, Configuration, ConfigurationChange, DatasetId, NodeId, NodeState,
    },
    tls::{Acceptor, TlsFiles},
};

use store::{ConfigurationStore, FileStore};

#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the control service's TOML configuration file.
    #[arg(long)]
    pub config: Option<String>,

    /// Unix socket for the management API. Overrides `api_socket` from the configuration file.
    #[arg(long)]
    pub socket: Option<String>,

    /// Accept agents without client certificates. This is ONLY for use in test environments.
    #[arg(long)]
    pub no_mtls: bool,

    #[arg(long)]
    pub verbose: bool,
}

/// What the management API reports about one node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    pub last_report: Option<DateTime<Utc>>,
    pub live: bool,
}

pub struct ControlService {
    store: Box<dyn ConfigurationStore>,
    journal: Option<Journal>,
    write_lock: Mutex<()>,
    status: watch::Sender<ClusterStatus>,
    node_timeout: Duration,
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlService")
            .field("version", &self.status.borrow().configuration.version)
            .finish()
    }
}

impl ControlService {
    /// Start a control service on top of whatever `store` last saved. The cluster state always
    /// starts out empty and is rebuilt from fresh agent reports.
    pub fn new(
        store: Box<dyn ConfigurationStore>,
        journal: Option<Journal>,
        node_timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        let configuration = store.load()?.unwrap_or_default();
        info!(
            "loaded configuration version {} ({} nodes, {} datasets, {} containers)",
            configuration.version,
            configuration.nodes.len(),
            configuration.datasets.len(),
            configuration.containers.len()
        );
        let (status, _) = watch::channel(ClusterStatus {
            configuration,
            state: Default::default(),
        });
        Ok(ControlService {
            store,
            journal,
            write_lock: Mutex::new(()),
            status,
            node_timeout,
        })
    }

    pub fn configuration(&self) -> Configuration {
        self.status.borrow().configuration.clone()
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    /// Every journaled change, oldest first. Empty when the service keeps no journal.
    pub fn journal(&self) -> Result<Vec<Record>, ConfigurationError> {
        match &self.journal {
            Some(journal) => journal
                .records()
                .map_err(|e| ConfigurationError::Storage(format!("could not read journal: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// A channel holding the current status, updated after every accepted change or report.
    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.status.subscribe()
    }

    /// Validate and apply a change, and make it durable before returning. Returns the resulting
    /// configuration. Never waits for any agent to act on the change.
    pub async fn update_configuration(
        &self,
        change: ConfigurationChange,
    ) -> Result<Configuration, ConfigurationError> {
        self.update_configuration_all(vec![change]).await
    }

    /// Validate and apply several changes as one update: either every change is saved, or none
    /// is. Each change is validated against the result of the ones before it.
    pub async fn update_configuration_all(
        &self,
        changes: Vec<ConfigurationChange>,
    ) -> Result<Configuration, ConfigurationError> {
        let _writer = self.write_lock.lock().await;
        let current = self.configuration();
        let mut next = current.clone();
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            match next.apply(&change) {
                Ok(updated) => {
                    if updated != next {
                        applied.push((change, updated.version));
                    }
                    next = updated;
                }
                Err(e) => {
                    debug!("rejected {change:?}: {e}");
                    return Err(e);
                }
            }
        }
        if next == current {
            return Ok(next);
        }

        self.store.save(&next)?;
        for (change, version) in &applied {
            if let Some(journal) = &self.journal {
                let record = Record::for_change(change, change.object_id(), *version);
                if let Err(e) = journal.write_record(&record) {
                    warn!("could not append to the configuration journal: {e}");
                }
            }
            info!(
                "configuration version {version}: {} {}",
                crate::journal::Event::from(change),
                change.object_id()
            );
        }
        self.status
            .send_modify(|status| status.configuration = next.clone());
        Ok(next)
    }

    /// Merge a node's report into the cluster state. Returns `false` for a stale report, which
    /// changes nothing. A node is registered in the configuration by its first report, and its
    /// address is updated only by reports that are accepted.
    pub async fn report_state(&self, generation: u64, state: NodeState) -> bool {
        let node_id = state.node_id;
        if self.is_stale(node_id, generation) {
            debug!("node={node_id} discarded stale report (generation {generation})");
            return false;
        }

        let node = state.node();
        if self.status.borrow().configuration.nodes.get(&node_id) != Some(&node) {
            if let Err(e) = self
                .update_configuration(ConfigurationChange::RegisterNode(node))
                .await
            {
                error!("could not register node {node_id}: {e}");
            }
        }

        let received_at = Utc::now();
        let accepted = self
            .status
            .send_if_modified(|status| status.state.merge(generation, state, received_at));
        if accepted {
            self.purge_tombstones().await;
        } else {
            debug!("node={node_id} discarded stale report (generation {generation})");
        }
        accepted
    }

    fn is_stale(&self, node_id: NodeId, generation: u64) -> bool {
        self.status
            .borrow()
            .state
            .nodes
            .get(&node_id)
            .is_some_and(|report| generation <= report.generation)
    }

    /// Record that the replica of a failover dataset took over.
    pub async fn promoted(
        &self,
        dataset_id: DatasetId,
        node_id: NodeId,
        epoch: u64,
    ) -> Result<Configuration, ConfigurationError> {
        warn!("node={node_id} dataset={dataset_id} promoted to primary at epoch {epoch}");
        self.update_configuration(ConfigurationChange::Promote {
            dataset_id,
            node_id,
            epoch,
        })
        .await
    }

    /// Remove the tombstones of deleted datasets that no node holds a copy of any more. Only done
    /// once every registered node has reported, so a copy on a node that has not reported since a
    /// restart is not forgotten.
    async fn purge_tombstones(&self) {
        let purgeable: Vec<DatasetId> = {
            let status = self.status.borrow();
            if !status
                .state
                .has_reports_from(status.configuration.nodes.keys())
            {
                return;
            }
            status
                .configuration
                .datasets
                .values()
                .filter(|d| d.deleted && !status.state.is_manifested(&d.dataset_id))
                .map(|d| d.dataset_id)
                .collect()
        };
        for dataset_id in purgeable {
            if let Err(e) = self
                .update_configuration(ConfigurationChange::PurgeDataset { dataset_id })
                .await
            {
                warn!("could not purge deleted dataset {dataset_id}: {e}");
            }
        }
    }

    /// Every registered node with the time of its last accepted report.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let status = self.status.borrow();
        let now = Utc::now();
        status
            .configuration
            .nodes
            .values()
            .map(|node| {
                let last_report = status.state.nodes.get(&node.node_id).map(|r| r.received_at);
                let live = last_report.is_some_and(|at| {
                    now.signed_duration_since(at).to_std().unwrap_or_default() < self.node_timeout
                });
                NodeInfo {
                    node_id: node.node_id,
                    address: node.address.clone(),
                    last_report,
                    live,
                }
            })
            .collect()
    }
}

/// Get a unix socket listener from a given socket path.
///
/// To avoid clobbering an already-in-use unix socket, a connection is attempted to an existing
/// unix socket first. If this fails, a new socket listener can be returned, since an existing
/// in-use socket was determined to be absent at the given location.
async fn prepare_unix_socket(addr: &Path) -> io::Result<tokio::net::UnixListener> {
    let display = addr.display();
    match tokio::net::UnixStream::connect(addr).await {
        Ok(_) => {
            eprintln!("Address already in use: {display}");
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("Unexpected error while preparing unix socket '{display}': {e}");
            return Err(e);
        }
    };
    match std::fs::remove_file(addr) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("error removing old socket: {e}");
            return Err(e);
        }
    };
    if let Some(parent) = addr.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match tokio::net::UnixListener::bind(addr) {
        Ok(l) => Ok(l),
        Err(e) => {
            eprintln!("error binding to socket '{display}': {e}");
            Err(e)
        }
    }
}

fn open_journal(path: &Path) -> HandledResult<Journal> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).handle_err(|e| {
            eprintln!("Could not create directory '{}': {e}", parent.display())
        })?;
    }
    Journal::open(path)
        .handle_err(|e| eprintln!("Could not open journal '{}': {e}", path.display()))
}

/// Control service daemon -
///
/// This launches up to three servers sharing one `ControlService`:
///
/// - The agent listener, which agents keep a connection to for reporting state and receiving
///   configuration.
///
/// - The management API on a unix socket (/var/run/flocker/control.socket), used by the CLI.
///
/// - Optionally, the management API on a TCP address, for remote clients holding a certificate
///   from the cluster CA.
pub fn main(cli: Cli) -> HandledResult<()> {
    let mut config = ControlConfig::load(cli.config.as_deref())?;
    if let Some(socket) = &cli.socket {
        config.api_socket = socket.into();
    }

    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Could not launch control service runtime: {e}"))?;

    rt.block_on(async {
        let journal = open_journal(&config.journal_path)?;
        let store = FileStore::new(config.state_path.clone());
        let service = ControlService::new(
            Box::new(store),
            Some(journal),
            Duration::from_secs(config.node_timeout),
        )
        .handle_err(|e| eprintln!("Could not load configuration: {e}"))?;
        let service = Arc::new(service);

        let tls_files = TlsFiles::control_service();
        let acceptor = Acceptor::new(!cli.no_mtls, &tls_files)
            .handle_err(|e| eprintln!("Could not load TLS certificates: {e}"))?;

        let agents = tokio::net::TcpListener::bind(&config.agent_address)
            .await
            .handle_err(|e| eprintln!("Could not listen on '{}': {e}", config.agent_address))?;
        info!("listening for agents on '{}'", config.agent_address);

        let api = prepare_unix_socket(&config.api_socket)
            .await
            .map_err(|_| HandledError {})?;
        info!("listening on socket '{}'", config.api_socket.display());

        let tcp_api = match &config.api_address {
            Some(address) => {
                let Acceptor::Mtls(tls) = &acceptor else {
                    eprintln!("The TCP management API always requires mTLS; refusing --no-mtls.");
                    return Err(HandledError {});
                };
                let listener = tokio::net::TcpListener::bind(address)
                    .await
                    .handle_err(|e| eprintln!("Could not listen on '{address}': {e}"))?;
                info!("listening for API clients on '{address}'");
                Some(http::MtlsListener::new(listener, tls.clone()))
            }
            None => None,
        };

        let tcp_api_server = {
            let service = Arc::clone(&service);
            async move {
                if let Some(listener) = tcp_api {
                    http::serve_tcp(listener, service).await;
                }
            }
        };

        futures::join!(
            server::serve_agents(agents, acceptor.clone(), Arc::clone(&service)),
            http::serve_unix(api, Arc::clone(&service)),
            tcp_api_server,
        );
        Ok(())
    })
}
