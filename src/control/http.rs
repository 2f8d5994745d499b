// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The management API.
//!
//! Served on a unix socket for the local CLI, and optionally on a TCP address where every client
//! must present a certificate signed by the cluster CA.

use std::{collections::BTreeMap, io, net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{delete, get, post},
        Json, Router,
    },
    log::{error, warn},
    serde::{Deserialize, Serialize},
    tokio::net::{TcpListener, TcpStream},
    tokio_rustls::{server::TlsStream, TlsAcceptor},
};

use crate::{
    control::{ControlService, NodeInfo},
    error::ConfigurationError,
    journal::Record,
    model::{Container, ConfigurationChange, Dataset, DatasetId, NodeId, SnapshotId},
};

type Service = State<Arc<ControlService>>;

fn router(service: Arc<ControlService>) -> Router {
    Router::new()
        .route("/v1/version", get(version))
        .route("/v1/state/nodes", get(list_nodes))
        .route("/v1/state/datasets", get(list_dataset_state))
        .route("/v1/journal", get(list_journal))
        .route(
            "/v1/configuration/datasets",
            get(list_datasets).post(create_dataset),
        )
        .route(
            "/v1/configuration/datasets/{id}",
            post(update_dataset).delete(delete_dataset),
        )
        .route(
            "/v1/configuration/containers",
            get(list_containers).post(create_container),
        )
        .route(
            "/v1/configuration/containers/{name}",
            delete(delete_container),
        )
        .with_state(service)
}

/// Main entrypoint for the management API on the local unix socket.
pub async fn serve_unix(listener: tokio::net::UnixListener, service: Arc<ControlService>) {
    if let Err(e) = axum::serve(listener, router(service)).await {
        error!("management API on unix socket stopped: {e}");
    }
}

/// Main entrypoint for the management API on TCP.
pub async fn serve_tcp(listener: MtlsListener, service: Arc<ControlService>) {
    if let Err(e) = axum::serve(listener, router(service)).await {
        error!("management API on TCP stopped: {e}");
    }
}

/// A TCP listener that only hands out connections whose client completed a mutual TLS handshake.
pub struct MtlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl MtlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> Self {
        MtlsListener { listener, acceptor }
    }
}

impl axum::serve::Listener for MtlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("error accepting API connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            match self.acceptor.accept(stream).await {
                Ok(stream) => return (stream, addr),
                Err(e) => warn!("rejected API client {addr}: {e}"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}

/// A configuration error as returned to API clients.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorJson {
    pub description: String,
}

pub struct ApiError(ConfigurationError);

impl From<ConfigurationError> for ApiError {
    fn from(e: ConfigurationError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ConfigurationError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
            ConfigurationError::UnknownDataset(_) | ConfigurationError::UnknownContainer(_) => {
                StatusCode::NOT_FOUND
            }
            ConfigurationError::DatasetExists(_) | ConfigurationError::ContainerExists(_) => {
                StatusCode::CONFLICT
            }
            ConfigurationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorJson {
            description: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct VersionJson {
    pub flocker: String,
}

async fn version() -> Json<VersionJson> {
    Json(VersionJson {
        flocker: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_nodes(State(service): Service) -> Json<Vec<NodeInfo>> {
    Json(service.nodes())
}

/// One copy of a dataset as reported by the node holding it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetStateJson {
    pub dataset_id: DatasetId,
    pub node_id: NodeId,
    pub primary: bool,
    pub maximum_size: Option<u64>,
    pub path: Option<String>,
    pub latest_snapshot: Option<SnapshotId>,
    pub diverged: bool,
}

async fn list_dataset_state(State(service): Service) -> Json<Vec<DatasetStateJson>> {
    let status = service.status();
    let datasets = status
        .state
        .nodes
        .iter()
        .flat_map(|(node_id, report)| {
            report
                .state
                .manifestations
                .values()
                .map(move |m| DatasetStateJson {
                    dataset_id: m.dataset_id,
                    node_id: *node_id,
                    primary: m.primary,
                    maximum_size: m.maximum_size,
                    path: m.path.clone(),
                    latest_snapshot: m.latest_snapshot().copied(),
                    diverged: m.diverged,
                })
        })
        .collect();
    Json(datasets)
}

/// One accepted configuration change from the audit journal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JournalEntryJson {
    pub timestamp: String,
    pub event: String,
    pub object: String,
    pub comment: Option<String>,
}

impl From<Record> for JournalEntryJson {
    fn from(record: Record) -> Self {
        JournalEntryJson {
            timestamp: record.timestamp.to_string(),
            event: record.event.to_string(),
            object: record.obj_id,
            comment: record.comment,
        }
    }
}

async fn list_journal(State(service): Service) -> Result<Json<Vec<JournalEntryJson>>, ApiError> {
    let records = service.journal()?;
    Ok(Json(records.into_iter().map(JournalEntryJson::from).collect()))
}

async fn list_datasets(State(service): Service) -> Json<Vec<Dataset>> {
    Json(service.configuration().datasets.into_values().collect())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CreateDatasetArgs {
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    pub primary: NodeId,
    #[serde(default)]
    pub maximum_size: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub replica: Option<NodeId>,
}

async fn create_dataset(
    State(service): Service,
    Json(args): Json<CreateDatasetArgs>,
) -> Result<(StatusCode, Json<Dataset>), ApiError> {
    let dataset_id = args.dataset_id.unwrap_or_else(DatasetId::new_random);
    let configuration = service
        .update_configuration(ConfigurationChange::CreateDataset {
            dataset_id: Some(dataset_id),
            primary: args.primary,
            maximum_size: args.maximum_size,
            metadata: args.metadata,
            replica: args.replica,
        })
        .await?;
    let dataset = configuration
        .datasets
        .get(&dataset_id)
        .cloned()
        .ok_or(ConfigurationError::UnknownDataset(dataset_id))?;
    Ok((StatusCode::CREATED, Json(dataset)))
}

/// Move and/or resize a dataset. Fields left out are not changed.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct UpdateDatasetArgs {
    #[serde(default)]
    pub primary: Option<NodeId>,
    #[serde(default)]
    pub maximum_size: Option<u64>,
}

async fn update_dataset(
    State(service): Service,
    Path(dataset_id): Path<DatasetId>,
    Json(args): Json<UpdateDatasetArgs>,
) -> Result<Json<Dataset>, ApiError> {
    let mut changes = Vec::new();
    if let Some(maximum_size) = args.maximum_size {
        changes.push(ConfigurationChange::ResizeDataset {
            dataset_id,
            maximum_size: Some(maximum_size),
        });
    }
    if let Some(primary) = args.primary {
        changes.push(ConfigurationChange::MoveDataset {
            dataset_id,
            primary,
        });
    }
    let configuration = service.update_configuration_all(changes).await?;
    configuration
        .datasets
        .get(&dataset_id)
        .cloned()
        .map(Json)
        .ok_or(ApiError(ConfigurationError::UnknownDataset(dataset_id)))
}

async fn delete_dataset(
    State(service): Service,
    Path(dataset_id): Path<DatasetId>,
) -> Result<Json<Dataset>, ApiError> {
    let configuration = service
        .update_configuration(ConfigurationChange::DeleteDataset { dataset_id })
        .await?;
    Ok(Json(
        configuration
            .datasets
            .get(&dataset_id)
            .cloned()
            .ok_or(ConfigurationError::UnknownDataset(dataset_id))?,
    ))
}

async fn list_containers(State(service): Service) -> Json<Vec<Container>> {
    Json(service.configuration().containers.into_values().collect())
}

async fn create_container(
    State(service): Service,
    Json(container): Json<Container>,
) -> Result<(StatusCode, Json<Container>), ApiError> {
    service
        .update_configuration(ConfigurationChange::CreateContainer(container.clone()))
        .await?;
    Ok((StatusCode::CREATED, Json(container)))
}

async fn delete_container(
    State(service): Service,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    service
        .update_configuration(ConfigurationChange::DeleteContainer { name })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        control::store::MemoryStore,
        model::{Node, NodeState},
    };

    async fn service_with_node() -> (Arc<ControlService>, Node) {
        let service = Arc::new(
            ControlService::new(Box::new(MemoryStore::new()), None, Duration::from_secs(60))
                .unwrap(),
        );
        let node = Node {
            node_id: NodeId::new_random(),
            address: "10.0.0.4:4525".to_string(),
        };
        service.report_state(1, NodeState::empty(&node)).await;
        (service, node)
    }

    #[tokio::test]
    async fn create_then_move_to_unknown_node() {
        let (service, node) = service_with_node().await;

        let (status, Json(dataset)) = create_dataset(
            State(Arc::clone(&service)),
            Json(CreateDatasetArgs {
                dataset_id: None,
                primary: node.node_id,
                maximum_size: None,
                metadata: BTreeMap::from([("name".to_string(), "db".to_string())]),
                replica: None,
            }),
        )
        .await
        .map_err(|e| e.0)
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(dataset.name(), Some("db"));

        let result = update_dataset(
            State(Arc::clone(&service)),
            Path(dataset.dataset_id),
            Json(UpdateDatasetArgs {
                primary: Some(NodeId::new_random()),
                maximum_size: None,
            }),
        )
        .await;
        let response = result.map(|_| ()).unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            service.configuration().datasets[&dataset.dataset_id].primary,
            node.node_id
        );
    }

    #[tokio::test]
    async fn invalid_move_does_not_resize_either() {
        let (service, node) = service_with_node().await;
        let (_, Json(dataset)) = create_dataset(
            State(Arc::clone(&service)),
            Json(CreateDatasetArgs {
                dataset_id: None,
                primary: node.node_id,
                maximum_size: None,
                metadata: BTreeMap::new(),
                replica: None,
            }),
        )
        .await
        .map_err(|e| e.0)
        .unwrap();
        let before = service.configuration();

        let response = update_dataset(
            State(Arc::clone(&service)),
            Path(dataset.dataset_id),
            Json(UpdateDatasetArgs {
                primary: Some(NodeId::new_random()),
                maximum_size: Some(1 << 20),
            }),
        )
        .await
        .map(|_| ())
        .unwrap_err()
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(service.configuration(), before);
        assert_eq!(service.configuration().datasets[&dataset.dataset_id].maximum_size, None);
    }

    #[tokio::test]
    async fn journal_shows_node_registration() {
        let dir = tempfile::tempdir().unwrap();
        let journal = crate::journal::Journal::open(&dir.path().join("journal")).unwrap();
        let service = Arc::new(
            ControlService::new(
                Box::new(MemoryStore::new()),
                Some(journal),
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let node = Node {
            node_id: NodeId::new_random(),
            address: "10.0.0.5:4525".to_string(),
        };
        service.report_state(1, NodeState::empty(&node)).await;

        let Json(entries) = list_journal(State(service))
            .await
            .map_err(|e| e.0)
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "register-node");
        assert_eq!(entries[0].object, node.node_id.to_string());
        assert_eq!(
            entries[0].comment.as_deref(),
            Some("version=1 address=10.0.0.5:4525")
        );
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (service, _) = service_with_node().await;

        let missing = delete_dataset(State(Arc::clone(&service)), Path(DatasetId::new_random()))
            .await
            .map(|_| ())
            .unwrap_err()
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let missing = delete_container(State(service), Path("nope".to_string()))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
