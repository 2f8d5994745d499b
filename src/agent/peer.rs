// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The agent-to-agent protocol: snapshot listings, replication streams and failover heartbeats.
//!
//! The serving side is `PeerService`, which every agent exposes on its peer port. The calling
//! side is `TcpPeer`, which opens a fresh connection for every request so that a broken transfer
//! never leaves a half-read stream on a shared connection.

use std::{io, net::SocketAddr, sync::Arc};

use {
    cidr::IpCidr,
    futures::StreamExt,
    log::{debug, info, warn},
    tokio::net::TcpListener,
};

use crate::{
    agent::heartbeat::FailoverManager,
    backend::ReplicationStream,
    error::ReplicationError,
    failover::PeerStatus,
    model::{DatasetId, Node, NodeId, SnapshotId},
    protocol::{self, PeerRequest, PeerResponse, ReceiveRequest, Transport},
    replication::{Peer, ReplicationEngine},
    tls::{Acceptor, BoxedConnection, Connection, Connector},
};

/// Hands out a `Peer` for any node in the configuration.
pub trait Peers: Send + Sync {
    type Peer: Peer;

    fn peer(&self, node: &Node) -> Self::Peer;
}

/// What an agent answers to its peers.
#[derive(Debug)]
pub struct PeerService {
    engine: Arc<ReplicationEngine>,
    failover: Arc<FailoverManager>,
}

impl PeerService {
    pub fn new(engine: Arc<ReplicationEngine>, failover: Arc<FailoverManager>) -> Self {
        PeerService { engine, failover }
    }

    pub async fn list_snapshots(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Option<Vec<SnapshotId>>, ReplicationError> {
        Ok(self.engine.volume(dataset_id).await?.map(|v| v.snapshots))
    }

    pub async fn receive(
        &self,
        request: &ReceiveRequest,
        stream: ReplicationStream<'_>,
    ) -> Result<(), ReplicationError> {
        self.engine.receive(request, stream).await
    }

    pub fn status(&self, status: &PeerStatus) -> PeerStatus {
        self.failover.observe(status);
        self.failover.status()
    }

    /// Answer one request. A `Receive` request is followed on the same transport by its stream.
    pub async fn handle<S: Connection>(
        &self,
        request: PeerRequest,
        transport: &mut Transport<S>,
    ) -> io::Result<PeerResponse> {
        let result = match request {
            PeerRequest::ListSnapshots { dataset_id } => self
                .list_snapshots(dataset_id)
                .await
                .map(|snapshots| PeerResponse::Snapshots { snapshots }),
            PeerRequest::Receive(request) => {
                let mut frames = protocol::DataFrames::new(transport);
                let result = self.receive(&request, (&mut frames).boxed()).await;
                // A refused stream is still read to its end, so the next request can follow.
                frames.drain().await?;
                result.map(|()| PeerResponse::Received)
            }
            PeerRequest::Status(status) => Ok(PeerResponse::Status(self.status(&status))),
        };
        Ok(result.unwrap_or_else(|e| {
            warn!("peer request failed: {e}");
            PeerResponse::Failed {
                kind: e.kind(),
                message: e.to_string(),
            }
        }))
    }
}

/// Main entrypoint for the peer listener.
pub async fn serve_peers(
    listener: TcpListener,
    acceptor: Acceptor,
    allowed_network: Option<IpCidr>,
    service: Arc<PeerService>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("error accepting peer connection: {e}");
                continue;
            }
        };
        if !allowed(allowed_network.as_ref(), &addr) {
            info!("refused peer connection from {addr}: outside the allowed network");
            continue;
        }
        let acceptor = acceptor.clone();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let connection = match acceptor.accept(stream).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("TLS handshake with peer {addr} failed: {e}");
                    return;
                }
            };
            if let Err(e) = handle_peer(connection, &service).await {
                debug!("connection from peer {addr} ended: {e}");
            }
        });
    }
}

fn allowed(network: Option<&IpCidr>, addr: &SocketAddr) -> bool {
    network.map_or(true, |network| network.contains(&addr.ip()))
}

/// Serve requests on one peer connection until the other side closes it.
pub async fn handle_peer<S: Connection>(connection: S, service: &PeerService) -> io::Result<()> {
    let mut transport = protocol::transport(connection);
    while let Some(request) = protocol::recv_message::<_, PeerRequest>(&mut transport).await? {
        let response = service.handle(request, &mut transport).await?;
        protocol::send_message(&mut transport, &response).await?;
    }
    Ok(())
}

/// Another agent reached over TCP.
#[derive(Debug, Clone)]
pub struct TcpPeer {
    node_id: NodeId,
    address: String,
    connector: Connector,
}

impl TcpPeer {
    fn unreachable(&self, e: io::Error) -> ReplicationError {
        ReplicationError::PeerUnreachable {
            peer: format!("{} ({})", self.node_id, self.address),
            reason: e.to_string(),
        }
    }

    async fn connect(&self) -> Result<Transport<BoxedConnection>, ReplicationError> {
        let connection = self
            .connector
            .connect(&self.address)
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(protocol::transport(connection))
    }

    async fn call(
        &self,
        request: PeerRequest,
        stream: Option<ReplicationStream<'_>>,
    ) -> Result<PeerResponse, ReplicationError> {
        let mut transport = self.connect().await?;
        protocol::send_message(&mut transport, &request)
            .await
            .map_err(|e| self.unreachable(e))?;
        if let Some(stream) = stream {
            protocol::send_stream(&mut transport, stream)
                .await
                .map_err(|e| self.unreachable(e))?;
        }
        match protocol::recv_message(&mut transport).await {
            Ok(Some(PeerResponse::Failed { kind, message })) => Err(ReplicationError::Rejected {
                peer: self.node_id,
                kind,
                message,
            }),
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(ReplicationError::PeerUnreachable {
                peer: self.node_id.to_string(),
                reason: "connection closed before a response".to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ReplicationError::Protocol(e.to_string()))
            }
            Err(e) => Err(self.unreachable(e)),
        }
    }
}

fn unexpected(response: PeerResponse) -> ReplicationError {
    ReplicationError::Protocol(format!("unexpected response {response:?}"))
}

impl Peer for TcpPeer {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn list_snapshots(
        &self,
        dataset_id: DatasetId,
    ) -> Result<Option<Vec<SnapshotId>>, ReplicationError> {
        match self
            .call(PeerRequest::ListSnapshots { dataset_id }, None)
            .await?
        {
            PeerResponse::Snapshots { snapshots } => Ok(snapshots),
            other => Err(unexpected(other)),
        }
    }

    async fn receive(
        &self,
        request: ReceiveRequest,
        stream: ReplicationStream<'_>,
    ) -> Result<(), ReplicationError> {
        match self.call(PeerRequest::Receive(request), Some(stream)).await? {
            PeerResponse::Received => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn exchange_status(&self, status: PeerStatus) -> Result<PeerStatus, ReplicationError> {
        match self.call(PeerRequest::Status(status), None).await? {
            PeerResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpPeers {
    connector: Connector,
}

impl TcpPeers {
    pub fn new(connector: Connector) -> Self {
        TcpPeers { connector }
    }
}

impl Peers for TcpPeers {
    type Peer = TcpPeer;

    fn peer(&self, node: &Node) -> TcpPeer {
        TcpPeer {
            node_id: node.node_id,
            address: node.address.clone(),
            connector: self.connector.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{Backend, MemoryBackend},
        config::{ConvergenceConfig, FailoverConfig, ReplicationConfig},
        error::FailureKind,
    };

    fn service(backend: &MemoryBackend) -> (PeerService, NodeId) {
        let node_id = NodeId::new_random();
        let engine = Arc::new(ReplicationEngine::new(
            node_id,
            Backend::Memory(backend.clone()),
            ReplicationConfig::default(),
            &ConvergenceConfig::default(),
        ));
        let failover = Arc::new(FailoverManager::new(node_id, &FailoverConfig::default()));
        (PeerService::new(engine, failover), node_id)
    }

    #[tokio::test]
    async fn requests_over_one_connection() {
        let backend = MemoryBackend::new();
        let (service, node_id) = service(&backend);
        let id = DatasetId::new_random();
        backend.create(id, None).unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { handle_peer(server, &service).await });
        let mut client = protocol::transport(client);

        protocol::send_message(&mut client, &PeerRequest::ListSnapshots { dataset_id: id })
            .await
            .unwrap();
        let response: PeerResponse = protocol::recv_message(&mut client).await.unwrap().unwrap();
        assert_eq!(
            response,
            PeerResponse::Snapshots {
                snapshots: Some(vec![])
            }
        );

        // An incremental stream from a base this node never had.
        let request = ReceiveRequest {
            dataset_id: id,
            from: Some(SnapshotId::new(1, NodeId::new_random())),
            to: SnapshotId::new(2, NodeId::new_random()),
            source: NodeId::new_random(),
            resolve_divergence: false,
        };
        protocol::send_message(&mut client, &PeerRequest::Receive(request))
            .await
            .unwrap();
        let garbage = futures::stream::iter([Ok(bytes::Bytes::from_static(b"not a real stream"))]);
        protocol::send_stream(&mut client, garbage).await.unwrap();
        let response: PeerResponse = protocol::recv_message(&mut client).await.unwrap().unwrap();
        assert!(matches!(
            response,
            PeerResponse::Failed {
                kind: FailureKind::MissingBaseSnapshot,
                ..
            }
        ));

        let asking = PeerStatus {
            node_id: NodeId::new_random(),
            storage_healthy: true,
            control_reachable: true,
            masters: Default::default(),
        };
        protocol::send_message(&mut client, &PeerRequest::Status(asking))
            .await
            .unwrap();
        let Some(PeerResponse::Status(answer)) = protocol::recv_message(&mut client).await.unwrap()
        else {
            panic!("expected a status answer");
        };
        assert_eq!(answer.node_id, node_id);

        drop(client);
        server.await.unwrap().unwrap();
    }

    #[test]
    fn allowed_network_filters_sources() {
        let network: IpCidr = "10.0.0.0/24".parse().unwrap();
        assert!(allowed(Some(&network), &"10.0.0.8:4000".parse().unwrap()));
        assert!(!allowed(Some(&network), &"10.0.1.8:4000".parse().unwrap()));
        assert!(allowed(None, &"192.168.1.1:4000".parse().unwrap()));
    }

    #[tokio::test]
    async fn unreachable_peer_is_transient() {
        let peer = TcpPeers::new(Connector::Plain).peer(&Node {
            node_id: NodeId::new_random(),
            // Nothing listens on the discard port of localhost in the test environment.
            address: "127.0.0.1:9".to_string(),
        });
        let e = peer.list_snapshots(DatasetId::new_random()).await.unwrap_err();
        assert_eq!(e.kind(), FailureKind::PeerUnreachable);
        assert!(e.is_transient());
    }
}
