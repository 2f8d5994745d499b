// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Storage backends.
//!
//! A backend owns the local pool that datasets live in. It is chosen once, from the `dataset`
//! section of `agent.yml`, when the agent starts, and every backend offers the same capabilities:
//! create, destroy, attach, detach, resize, snapshot, send and receive, plus the bits of history
//! rewriting that divergence resolution needs.

pub mod loopback;
pub mod memory;
pub mod tree;
pub mod zfs;

use std::{io, path::PathBuf};

use {
    bytes::Bytes,
    futures::{
        stream::{self, BoxStream},
        StreamExt,
    },
};

use crate::{
    config::DatasetConfig,
    error::BackendError,
    model::{DatasetId, SnapshotId},
    protocol::DATA_CHUNK,
};

pub use {loopback::LoopbackBackend, memory::MemoryBackend, zfs::ZfsBackend};

/// A replication stream, as produced by `Backend::send` or read off a peer connection.
pub type ReplicationStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Backends that apply streams in memory refuse streams larger than this.
pub const MAX_BUFFERED_STREAM: usize = 1 << 30;

/// Hand out a stream that was built in memory, in chunks.
pub fn buffered_stream(data: Vec<u8>) -> ReplicationStream<'static> {
    let data = Bytes::from(data);
    let chunks: Vec<io::Result<Bytes>> = (0..data.len())
        .step_by(DATA_CHUNK)
        .map(|start| Ok(data.slice(start..(start + DATA_CHUNK).min(data.len()))))
        .collect();
    stream::iter(chunks).boxed()
}

/// Read a whole stream into memory, refusing to hold more than `limit` bytes.
pub async fn collect_stream(
    dataset_id: DatasetId,
    mut stream: ReplicationStream<'_>,
    limit: usize,
) -> Result<Vec<u8>, BackendError> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if data.len() + chunk.len() > limit {
            return Err(BackendError::BadStream {
                dataset_id,
                reason: format!("stream is larger than {limit} bytes"),
            });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// What a backend knows about one of its datasets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub dataset_id: DatasetId,
    pub maximum_size: Option<u64>,

    /// Mounted read-write on this node.
    pub attached: bool,

    /// The configuration epoch the dataset was attached under. Zero when never attached.
    pub epoch: u64,

    pub path: Option<PathBuf>,

    /// Oldest first.
    pub snapshots: Vec<SnapshotId>,
}

#[derive(Debug, Clone)]
pub enum Backend {
    Memory(MemoryBackend),
    Loopback(LoopbackBackend),
    Zfs(ZfsBackend),
}

impl Backend {
    pub fn from_config(config: &DatasetConfig) -> Self {
        match config {
            DatasetConfig::Zfs { pool, mount_root } => {
                Backend::Zfs(ZfsBackend::new(pool.clone(), mount_root.clone()))
            }
            DatasetConfig::Loopback { root_path } => {
                Backend::Loopback(LoopbackBackend::new(root_path.clone()))
            }
            DatasetConfig::Memory => Backend::Memory(MemoryBackend::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::Loopback(_) => "loopback",
            Backend::Zfs(_) => "zfs",
        }
    }

    pub async fn list(&self) -> Result<Vec<VolumeInfo>, BackendError> {
        match self {
            Backend::Memory(b) => b.list(),
            Backend::Loopback(b) => b.list().await,
            Backend::Zfs(b) => b.list().await,
        }
    }

    /// Create a new, empty and detached dataset.
    pub async fn create(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.create(dataset_id, maximum_size),
            Backend::Loopback(b) => b.create(dataset_id, maximum_size).await,
            Backend::Zfs(b) => b.create(dataset_id, maximum_size).await,
        }
    }

    /// Destroy a dataset together with all of its snapshots.
    pub async fn destroy(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.destroy(dataset_id),
            Backend::Loopback(b) => b.destroy(dataset_id).await,
            Backend::Zfs(b) => b.destroy(dataset_id).await,
        }
    }

    /// Mount a dataset read-write under configuration epoch `epoch` and return where it is mounted.
    pub async fn attach(&self, dataset_id: DatasetId, epoch: u64) -> Result<PathBuf, BackendError> {
        match self {
            Backend::Memory(b) => b.attach(dataset_id, epoch),
            Backend::Loopback(b) => b.attach(dataset_id, epoch).await,
            Backend::Zfs(b) => b.attach(dataset_id, epoch).await,
        }
    }

    pub async fn detach(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.detach(dataset_id),
            Backend::Loopback(b) => b.detach(dataset_id).await,
            Backend::Zfs(b) => b.detach(dataset_id).await,
        }
    }

    pub async fn resize(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.resize(dataset_id, maximum_size),
            Backend::Loopback(b) => b.resize(dataset_id, maximum_size).await,
            Backend::Zfs(b) => b.resize(dataset_id, maximum_size).await,
        }
    }

    pub async fn snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.snapshot(dataset_id, snapshot),
            Backend::Loopback(b) => b.snapshot(dataset_id, snapshot).await,
            Backend::Zfs(b) => b.snapshot(dataset_id, snapshot).await,
        }
    }

    /// The snapshots of a dataset, oldest first.
    pub async fn snapshots(&self, dataset_id: DatasetId) -> Result<Vec<SnapshotId>, BackendError> {
        match self {
            Backend::Memory(b) => b.snapshots(dataset_id),
            Backend::Loopback(b) => b.snapshots(dataset_id).await,
            Backend::Zfs(b) => b.snapshots(dataset_id).await,
        }
    }

    pub async fn destroy_snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.destroy_snapshot(dataset_id, snapshot),
            Backend::Loopback(b) => b.destroy_snapshot(dataset_id, snapshot).await,
            Backend::Zfs(b) => b.destroy_snapshot(dataset_id, snapshot).await,
        }
    }

    /// Produce the replication stream that takes a copy holding `from` (or nothing, for a full
    /// stream) to `to`.
    pub async fn send(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
    ) -> Result<ReplicationStream<'static>, BackendError> {
        match self {
            Backend::Memory(b) => b.send(dataset_id, from, to).map(buffered_stream),
            Backend::Loopback(b) => b.send(dataset_id, from, to).await.map(buffered_stream),
            Backend::Zfs(b) => b.send(dataset_id, from, to).await,
        }
    }

    /// Apply a replication stream. An incremental stream only applies to a copy whose latest
    /// snapshot is `from`; a full stream only applies when the dataset has no snapshots yet. The
    /// result is always detached.
    pub async fn receive(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
        stream: ReplicationStream<'_>,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => {
                let data = collect_stream(dataset_id, stream, MAX_BUFFERED_STREAM).await?;
                b.receive(dataset_id, from, to, &data)
            }
            Backend::Loopback(b) => {
                let data = collect_stream(dataset_id, stream, MAX_BUFFERED_STREAM).await?;
                b.receive(dataset_id, from, to, data).await
            }
            Backend::Zfs(b) => b.receive(dataset_id, from, to, stream).await,
        }
    }

    /// Whether the dataset was written to since its latest snapshot. A dataset without snapshots
    /// always counts as changed.
    pub async fn has_changes(&self, dataset_id: DatasetId) -> Result<bool, BackendError> {
        match self {
            Backend::Memory(b) => b.has_changes(dataset_id),
            Backend::Loopback(b) => b.has_changes(dataset_id).await,
            Backend::Zfs(b) => b.has_changes(dataset_id).await,
        }
    }

    /// Discard every snapshot after `snapshot` and any unsnapshotted writes.
    pub async fn rollback(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.rollback(dataset_id, snapshot),
            Backend::Loopback(b) => b.rollback(dataset_id, snapshot).await,
            Backend::Zfs(b) => b.rollback(dataset_id, snapshot).await,
        }
    }

    /// Preserve a copy of the dataset as of snapshot `at`, with its history, under `label`.
    pub async fn stash(
        &self,
        dataset_id: DatasetId,
        at: SnapshotId,
        label: &str,
    ) -> Result<(), BackendError> {
        match self {
            Backend::Memory(b) => b.stash(dataset_id, at, label),
            Backend::Loopback(b) => b.stash(dataset_id, at, label).await,
            Backend::Zfs(b) => b.stash(dataset_id, at, label).await,
        }
    }

    /// The labels of every stash in the pool.
    pub async fn stashes(&self) -> Result<Vec<String>, BackendError> {
        match self {
            Backend::Memory(b) => b.stashes(),
            Backend::Loopback(b) => b.stashes().await,
            Backend::Zfs(b) => b.stashes().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_streams_come_back_whole() {
        let data: Vec<u8> = (0..(DATA_CHUNK + 5)).map(|i| i as u8).collect();
        let id = DatasetId::new_random();

        let chunks: Vec<_> = buffered_stream(data.clone()).collect().await;
        assert_eq!(chunks.len(), 2);

        let collected = collect_stream(id, buffered_stream(data.clone()), data.len())
            .await
            .unwrap();
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn oversized_stream_is_refused() {
        let id = DatasetId::new_random();
        let e = collect_stream(id, buffered_stream(vec![0; 64]), 63)
            .await
            .unwrap_err();
        assert!(matches!(e, BackendError::BadStream { .. }));
    }
}
