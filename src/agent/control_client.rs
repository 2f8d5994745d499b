// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The agent's connection to the control service.
//!
//! The connection is re-established forever with exponential backoff. While it is down the agent
//! keeps converging towards the last cluster status it received; it only stops getting new
//! desired state.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use {
    backoff::{backoff::Backoff, ExponentialBackoff},
    log::{debug, info, warn},
    tokio::sync::{mpsc, watch},
};

use crate::{
    model::{ClusterStatus, Node},
    protocol::{self, AgentMessage, ControlMessage},
    tls::{Connection, Connector},
};

/// Messages queued while disconnected beyond this many are dropped; the next cycle reports again.
const OUTGOING_QUEUE: usize = 16;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Reconnect delays double from one second up to thirty seconds, and retry forever.
pub fn reconnect_policy() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_secs(1);
    ExponentialBackoff {
        current_interval: INITIAL_INTERVAL,
        initial_interval: INITIAL_INTERVAL,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: MAX_RECONNECT_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[derive(Debug)]
pub struct ControlClient {
    node: Node,
    address: String,
    connector: Connector,
    status: watch::Sender<Option<ClusterStatus>>,
    outgoing: mpsc::Sender<AgentMessage>,
    connected: AtomicBool,
}

impl ControlClient {
    /// The returned receiver holds the outgoing queue and must be handed to `run`.
    pub fn new(
        node: Node,
        address: String,
        connector: Connector,
    ) -> (Arc<Self>, mpsc::Receiver<AgentMessage>) {
        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let (status, _) = watch::channel(None);
        let client = ControlClient {
            node,
            address,
            connector,
            status,
            outgoing,
            connected: AtomicBool::new(false),
        };
        (Arc::new(client), queue)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The latest cluster status received, if any was received since startup.
    pub fn status(&self) -> Option<ClusterStatus> {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ClusterStatus>> {
        self.status.subscribe()
    }

    /// Queue a message for the control service. Never waits for the connection.
    pub fn send(&self, message: AgentMessage) {
        if let Err(e) = self.outgoing.try_send(message) {
            debug!("dropped message for the control service: {e}");
        }
    }

    pub async fn run(&self, mut queue: mpsc::Receiver<AgentMessage>) {
        let mut backoff = reconnect_policy();
        loop {
            match self.connector.connect(&self.address).await {
                Ok(connection) => {
                    info!("connected to the control service at {}", self.address);
                    backoff.reset();
                    self.connected.store(true, Ordering::SeqCst);
                    let result = self.session(connection, &mut queue).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match result {
                        Ok(()) => warn!("control service at {} closed the connection", self.address),
                        Err(e) => warn!("connection to the control service failed: {e}"),
                    }
                }
                Err(e) => warn!("control service at {} unreachable: {e}", self.address),
            }
            let delay = backoff.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
            debug!("reconnecting to the control service in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one connection until it closes.
    pub async fn session<S: Connection>(
        &self,
        connection: S,
        queue: &mut mpsc::Receiver<AgentMessage>,
    ) -> std::io::Result<()> {
        let mut transport = protocol::transport(connection);
        protocol::send_message(
            &mut transport,
            &AgentMessage::Hello {
                node_id: self.node.node_id,
                address: self.node.address.clone(),
            },
        )
        .await?;

        loop {
            tokio::select! {
                message = queue.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    protocol::send_message(&mut transport, &message).await?;
                }
                message = protocol::recv_message::<_, ControlMessage>(&mut transport) => {
                    match message? {
                        None => return Ok(()),
                        Some(ControlMessage::ClusterStatus(status)) => {
                            debug!("configuration version {} received", status.configuration.version);
                            self.status.send_replace(Some(status));
                        }
                        Some(ControlMessage::Error { message }) => {
                            warn!("control service: {message}");
                        }
                    }
                }
            }
        }
    }
}

/// Wait until the configuration in `updates` moves past `version`, or `timeout` passes. State
/// pushes alone do not end the wait, since every node's report produces one.
pub async fn configuration_changed(
    updates: &mut watch::Receiver<Option<ClusterStatus>>,
    version: Option<u64>,
    timeout: Duration,
) {
    let wait = async {
        loop {
            let current = updates
                .borrow_and_update()
                .as_ref()
                .map(|s| s.configuration.version);
            if current != version {
                return;
            }
            if updates.changed().await.is_err() {
                // Sender gone; fall back to the timeout.
                std::future::pending::<()>().await;
            }
        }
    };
    let _ = tokio::time::timeout(timeout, wait).await;
}
