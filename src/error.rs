// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::io;

use serde::{Deserialize, Serialize};

use crate::model::{DatasetId, NodeId, SnapshotId};

/// Why a requested configuration change was not applied. None of these leave a partially applied
/// change behind.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("dataset {0} does not exist")]
    UnknownDataset(DatasetId),

    #[error("dataset {0} already exists")]
    DatasetExists(DatasetId),

    #[error("container '{0}' does not exist")]
    UnknownContainer(String),

    #[error("container '{0}' already exists")]
    ContainerExists(String),

    /// The change was valid but could not be made durable, so it was not acknowledged.
    #[error("could not persist configuration: {0}")]
    Storage(String),
}

/// Errors raised by a storage backend.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The pool or daemon behind the backend cannot be reached at all. Transient.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("dataset {0} not found")]
    NotFound(DatasetId),

    #[error("dataset {0} already exists")]
    AlreadyExists(DatasetId),

    #[error("snapshot {snapshot} of dataset {dataset_id} not found")]
    SnapshotNotFound {
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    },

    #[error("replication stream for dataset {dataset_id} does not apply: {reason}")]
    BadStream {
        dataset_id: DatasetId,
        reason: String,
    },

    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected output from `{command}`: {output}")]
    Output { command: String, output: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from the snapshot/replication engine.
#[derive(thiserror::Error, Debug)]
pub enum ReplicationError {
    /// The destination does not hold the snapshot an incremental stream was computed from. The
    /// caller re-plans on its next cycle.
    #[error("node {destination} does not hold base snapshot {base} of dataset {dataset_id}")]
    MissingBaseSnapshot {
        dataset_id: DatasetId,
        base: SnapshotId,
        destination: NodeId,
    },

    /// Source and destination histories cannot be reconciled without an operator.
    #[error(
        "snapshot history of dataset {dataset_id} diverged ({local_only} snapshots only on the \
         source, {remote_only} only on node {destination}); operator intervention required"
    )]
    DivergedHistory {
        dataset_id: DatasetId,
        destination: NodeId,
        local_only: usize,
        remote_only: usize,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("transfer of dataset {0} timed out")]
    TimedOut(DatasetId),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer ran into one of the failures above on its side of a transfer.
    #[error("peer {peer} refused the transfer: {message}")]
    Rejected {
        peer: NodeId,
        kind: FailureKind,
        message: String,
    },
}

impl ReplicationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingBaseSnapshot { .. } => FailureKind::MissingBaseSnapshot,
            Self::DivergedHistory { .. } => FailureKind::DivergedHistory,
            Self::Backend(BackendError::Unavailable(_)) => FailureKind::BackendUnavailable,
            Self::Backend(_) => FailureKind::Backend,
            Self::PeerUnreachable { .. } | Self::TimedOut(_) => FailureKind::PeerUnreachable,
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Rejected { kind, .. } => *kind,
        }
    }

    /// Whether the condition is expected to clear up without an operator.
    pub fn is_transient(&self) -> bool {
        self.kind() != FailureKind::DivergedHistory
    }
}

/// A serializable classification of a `ReplicationError`, used to carry the failure across the
/// peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingBaseSnapshot,
    DivergedHistory,
    BackendUnavailable,
    Backend,
    PeerUnreachable,
    Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_divergence_needs_an_operator() {
        let dataset_id = DatasetId::new_random();
        let peer = NodeId::new_random();

        let diverged = ReplicationError::DivergedHistory {
            dataset_id,
            destination: peer,
            local_only: 12,
            remote_only: 3,
        };
        assert!(!diverged.is_transient());

        let refused = ReplicationError::Rejected {
            peer,
            kind: FailureKind::DivergedHistory,
            message: "diverged".to_string(),
        };
        assert!(!refused.is_transient());

        let pool_gone = ReplicationError::Backend(BackendError::Unavailable("gone".to_string()));
        assert_eq!(pool_gone.kind(), FailureKind::BackendUnavailable);
        assert!(pool_gone.is_transient());
        assert_eq!(
            ReplicationError::TimedOut(dataset_id).kind(),
            FailureKind::PeerUnreachable
        );
    }
}
