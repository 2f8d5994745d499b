// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Messages exchanged between agents and the control service, and between agents.
//!
//! Both protocols run over length-delimited frames on a (usually mutual TLS) TCP stream. Every
//! control frame carries one JSON document. A replication stream follows its `Receive` request as
//! a run of raw data frames ended by an empty frame.

use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use {
    bytes::Bytes,
    futures::{SinkExt, Stream, StreamExt},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

use crate::{
    error::FailureKind,
    failover::PeerStatus,
    model::{ClusterStatus, DatasetId, NodeId, NodeState, SnapshotId},
};

/// Largest frame accepted on either protocol.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Replication streams are cut into data frames of at most this size.
pub const DATA_CHUNK: usize = 1024 * 1024;

pub type Transport<S> = Framed<S, LengthDelimitedCodec>;

pub fn transport<S: AsyncRead + AsyncWrite>(stream: S) -> Transport<S> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(stream)
}

/// Agent to control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Hello {
        node_id: NodeId,
        address: String,
    },
    ReportState {
        node_id: NodeId,
        generation: u64,
        state: NodeState,
    },
    /// The replica of a failover dataset has taken over and asks for that to be recorded.
    Promoted {
        dataset_id: DatasetId,
        node_id: NodeId,
        epoch: u64,
    },
}

/// Control service to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ClusterStatus(ClusterStatus),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub dataset_id: DatasetId,
    pub from: Option<SnapshotId>,
    pub to: SnapshotId,
    /// The node sending the stream.
    pub source: NodeId,
    /// The sender found that the receiver's history diverged by no more than the automatic
    /// resolution bound, and asks the receiver to stash and discard its side first.
    #[serde(default)]
    pub resolve_divergence: bool,
}

/// Agent to peer agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    ListSnapshots { dataset_id: DatasetId },
    Receive(ReceiveRequest),
    Status(PeerStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    /// `None` when the peer holds no copy of the dataset at all.
    Snapshots {
        snapshots: Option<Vec<SnapshotId>>,
    },
    Received,
    Failed {
        kind: FailureKind,
        message: String,
    },
    Status(PeerStatus),
}

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

pub async fn send_message<S, M>(transport: &mut Transport<S>, message: &M) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let bytes = serde_json::to_vec(message).map_err(invalid_data)?;
    transport.send(Bytes::from(bytes)).await
}

/// Receive the next message. `Ok(None)` means the other side closed the connection cleanly.
pub async fn recv_message<S, M>(transport: &mut Transport<S>) -> io::Result<Option<M>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match transport.next().await {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame?).map_err(invalid_data)?)),
        None => Ok(None),
    }
}

/// Send a replication stream as data frames followed by the empty terminator frame. If the stream
/// fails part way no terminator is sent, and the error is returned so the caller drops the
/// connection; the receiver then sees the stream end early instead of a complete one.
pub async fn send_stream<S, D>(transport: &mut Transport<S>, mut stream: D) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Stream<Item = io::Result<Bytes>> + Unpin,
{
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for start in (0..chunk.len()).step_by(DATA_CHUNK) {
            let end = (start + DATA_CHUNK).min(chunk.len());
            transport.feed(chunk.slice(start..end)).await?;
        }
    }
    transport.send(Bytes::new()).await
}

/// The data frames of a replication stream, read off a transport up to the terminator frame.
#[derive(Debug)]
pub struct DataFrames<'a, S> {
    transport: &'a mut Transport<S>,
    done: bool,
}

impl<'a, S> DataFrames<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: &'a mut Transport<S>) -> Self {
        DataFrames {
            transport,
            done: false,
        }
    }

    /// Skip whatever is left of the stream, so the next message can be read.
    pub async fn drain(&mut self) -> io::Result<()> {
        while let Some(frame) = self.next().await {
            frame?;
        }
        Ok(())
    }
}

impl<S> Stream for DataFrames<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = match ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(frame)) if frame.is_empty() => None,
            Some(Ok(frame)) => return Poll::Ready(Some(Ok(frame.freeze()))),
            Some(Err(e)) => Some(Err(e)),
            None => Some(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a replication stream",
            ))),
        };
        self.done = true;
        Poll::Ready(item)
    }
}
