// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The listener agents connect to.
//!
//! An agent opens one long-lived connection, introduces itself with `Hello`, and from then on
//! sends `ReportState` every cycle. The control service pushes the current `ClusterStatus` right
//! after the `Hello` and again after every change, for as long as the connection stays up.

use std::{io, sync::Arc};

use {
    log::{debug, info, warn},
    tokio::net::TcpListener,
};

use crate::{
    control::ControlService,
    model::NodeId,
    protocol::{self, AgentMessage, ControlMessage},
    tls::{Acceptor, Connection},
};

pub async fn serve_agents(listener: TcpListener, acceptor: Acceptor, service: Arc<ControlService>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("error accepting agent connection: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let connection = match acceptor.accept(stream).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("TLS handshake with {peer} failed: {e}");
                    return;
                }
            };
            match handle_agent(connection, service).await {
                Ok(Some(node_id)) => info!("node={node_id} disconnected"),
                Ok(None) => debug!("{peer} disconnected before introducing itself"),
                Err(e) => warn!("connection from {peer} failed: {e}"),
            }
        });
    }
}

/// Serve one agent connection until it closes. Returns the node that was connected.
pub async fn handle_agent<S: Connection>(
    connection: S,
    service: Arc<ControlService>,
) -> io::Result<Option<NodeId>> {
    let mut transport = protocol::transport(connection);
    let mut updates = service.subscribe();

    let node_id = match protocol::recv_message(&mut transport).await? {
        Some(AgentMessage::Hello { node_id, address }) => {
            info!("node={node_id} connected from {address}");
            node_id
        }
        Some(other) => {
            let message = format!("expected hello, got {other:?}");
            protocol::send_message(&mut transport, &ControlMessage::Error { message }).await?;
            return Ok(None);
        }
        None => return Ok(None),
    };

    let status = updates.borrow_and_update().clone();
    protocol::send_message(&mut transport, &ControlMessage::ClusterStatus(status)).await?;

    loop {
        tokio::select! {
            message = protocol::recv_message::<_, AgentMessage>(&mut transport) => {
                match message? {
                    None => return Ok(Some(node_id)),
                    Some(AgentMessage::ReportState { node_id: reporter, generation, state }) => {
                        if reporter != node_id || state.node_id != node_id {
                            let message = format!("node {node_id} reported state for {reporter}");
                            protocol::send_message(&mut transport, &ControlMessage::Error { message }).await?;
                            continue;
                        }
                        service.report_state(generation, state).await;
                    }
                    Some(AgentMessage::Promoted { dataset_id, node_id: promoted, epoch }) => {
                        if promoted != node_id {
                            let message = format!("node {node_id} asked to promote {promoted}");
                            protocol::send_message(&mut transport, &ControlMessage::Error { message }).await?;
                            continue;
                        }
                        if let Err(e) = service.promoted(dataset_id, promoted, epoch).await {
                            let message = format!("promotion of {dataset_id} refused: {e}");
                            protocol::send_message(&mut transport, &ControlMessage::Error { message }).await?;
                        }
                    }
                    Some(AgentMessage::Hello { .. }) => {}
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(Some(node_id));
                }
                let status = updates.borrow_and_update().clone();
                protocol::send_message(&mut transport, &ControlMessage::ClusterStatus(status)).await?;
            }
        }
    }
}
