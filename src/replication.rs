// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The snapshot and replication engine.
//!
//! The engine sits between the agent and its storage backend. It issues snapshot identifiers,
//! works out which snapshot a peer already has so that only the difference is sent, resolves
//! small divergences by stashing the losing side, and prunes old snapshots.
//!
//! All operations on one dataset are serialized by a per-dataset lock; operations on different
//! datasets run in parallel.

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use {
    chrono::Utc,
    futures::{StreamExt, TryStreamExt},
    log::{debug, info, warn},
    tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};

use crate::{
    backend::{Backend, ReplicationStream, VolumeInfo},
    config::{ConvergenceConfig, ReplicationConfig, SnapshotTrigger},
    error::{BackendError, ReplicationError},
    failover::PeerStatus,
    model::{DatasetId, NodeId, SnapshotId, Stash},
    protocol::ReceiveRequest,
};

/// Another agent, as seen by this one.
pub trait Peer: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// The snapshots the peer holds of a dataset, oldest first, or `None` if it has no copy.
    fn list_snapshots(
        &self,
        dataset_id: DatasetId,
    ) -> impl Future<Output = Result<Option<Vec<SnapshotId>>, ReplicationError>> + Send;

    /// Hand the peer a replication stream to apply.
    fn receive(
        &self,
        request: ReceiveRequest,
        stream: ReplicationStream<'_>,
    ) -> impl Future<Output = Result<(), ReplicationError>> + Send;

    fn exchange_status(
        &self,
        status: PeerStatus,
    ) -> impl Future<Output = Result<PeerStatus, ReplicationError>> + Send;
}

/// What to send to bring a peer up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPlan {
    UpToDate,
    Send {
        from: Option<SnapshotId>,
        to: SnapshotId,
        resolve_divergence: bool,
    },
    Diverged {
        local_only: usize,
        remote_only: usize,
    },
}

/// Decide how to bring a peer holding `remote` up to the newest of `local`.
///
/// The base is the newest snapshot both sides have. Snapshots the peer has past the base mean its
/// history diverged from ours; as long as the snapshots past the base on both sides add up to no
/// more than `max_divergence`, the peer is asked to stash its side and take ours.
pub fn plan_send(local: &[SnapshotId], remote: &[SnapshotId], max_divergence: usize) -> SendPlan {
    let Some(to) = local.last().copied() else {
        return SendPlan::UpToDate;
    };
    if remote.last() == Some(&to) {
        return SendPlan::UpToDate;
    }

    let remote_set: BTreeSet<&SnapshotId> = remote.iter().collect();
    let base = local.iter().rev().find(|s| remote_set.contains(s)).copied();
    let past_base = |s: &&SnapshotId| base.map_or(true, |base| **s > base);
    let local_only = local.iter().filter(past_base).count();
    let remote_only = remote.iter().filter(past_base).count();

    if remote_only == 0 {
        SendPlan::Send {
            from: base,
            to,
            resolve_divergence: false,
        }
    } else if local_only + remote_only <= max_divergence {
        SendPlan::Send {
            from: base,
            to,
            resolve_divergence: true,
        }
    } else {
        SendPlan::Diverged {
            local_only,
            remote_only,
        }
    }
}

/// Keeps a snapshot from being pruned while a send uses it as its base.
struct Lease<'a> {
    leases: &'a Mutex<HashMap<(DatasetId, SnapshotId), usize>>,
    key: Option<(DatasetId, SnapshotId)>,
}

impl<'a> Lease<'a> {
    fn take(
        leases: &'a Mutex<HashMap<(DatasetId, SnapshotId), usize>>,
        dataset_id: DatasetId,
        snapshot: Option<SnapshotId>,
    ) -> Self {
        let key = snapshot.map(|s| (dataset_id, s));
        if let Some(key) = key {
            *leases.lock().unwrap().entry(key).or_default() += 1;
        }
        Lease { leases, key }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            let mut leases = self.leases.lock().unwrap();
            if let Some(count) = leases.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    leases.remove(&key);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct ReplicationEngine {
    node_id: NodeId,
    backend: Backend,
    config: ReplicationConfig,
    trigger: SnapshotTrigger,
    snapshot_interval: Duration,
    transfer_timeout: Duration,

    /// The timestamp of the last snapshot identifier issued, to keep them strictly increasing
    /// even if the clock steps backwards.
    last_issued: Mutex<u64>,
    locks: Mutex<HashMap<DatasetId, Arc<AsyncMutex<()>>>>,
    leases: Mutex<HashMap<(DatasetId, SnapshotId), usize>>,
    pinned: Mutex<BTreeSet<(DatasetId, SnapshotId)>>,
    /// The newest snapshot each dataset's replica is known to hold.
    replica_bases: Mutex<HashMap<DatasetId, SnapshotId>>,
    diverged: Mutex<BTreeSet<DatasetId>>,
}

impl ReplicationEngine {
    pub fn new(
        node_id: NodeId,
        backend: Backend,
        config: ReplicationConfig,
        convergence: &ConvergenceConfig,
    ) -> Self {
        let pinned = config
            .pinned
            .iter()
            .map(|p| (p.dataset, p.snapshot))
            .collect();
        ReplicationEngine {
            node_id,
            backend,
            config,
            trigger: convergence.snapshot_trigger,
            snapshot_interval: convergence.snapshot_interval(),
            transfer_timeout: convergence.transfer_timeout(),
            last_issued: Mutex::new(0),
            locks: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            pinned: Mutex::new(pinned),
            replica_bases: Mutex::new(HashMap::new()),
            diverged: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Take the lock that serializes all storage operations on one dataset.
    pub async fn lock(&self, dataset_id: DatasetId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .unwrap()
                .entry(dataset_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        lock.lock_owned().await
    }

    /// What the backend knows about one dataset, or `None` if there is no local copy.
    pub async fn volume(&self, dataset_id: DatasetId) -> Result<Option<VolumeInfo>, BackendError> {
        Ok(self
            .backend
            .list()
            .await?
            .into_iter()
            .find(|v| v.dataset_id == dataset_id))
    }

    /// Create a new dataset and mount it read-write under `epoch`.
    pub async fn create(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
        epoch: u64,
    ) -> Result<PathBuf, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        self.backend.create(dataset_id, maximum_size).await?;
        Ok(self.backend.attach(dataset_id, epoch).await?)
    }

    pub async fn attach(&self, dataset_id: DatasetId, epoch: u64) -> Result<PathBuf, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        Ok(self.backend.attach(dataset_id, epoch).await?)
    }

    pub async fn detach(&self, dataset_id: DatasetId) -> Result<(), ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        Ok(self.backend.detach(dataset_id).await?)
    }

    pub async fn resize(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        Ok(self.backend.resize(dataset_id, maximum_size).await?)
    }

    /// Destroy the local copy of a dataset with all of its snapshots.
    pub async fn destroy(&self, dataset_id: DatasetId) -> Result<(), ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        self.backend.destroy(dataset_id).await?;
        self.forget(dataset_id);
        Ok(())
    }

    fn next_snapshot_id(&self, latest: Option<&SnapshotId>) -> SnapshotId {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        let mut last = self.last_issued.lock().unwrap();
        let floor = latest
            .map_or(0, |s| s.timestamp + 1)
            .max(*last + 1);
        let timestamp = now.max(floor);
        *last = timestamp;
        SnapshotId::new(timestamp, self.node_id)
    }

    /// Take a new snapshot of the dataset's current state.
    pub async fn snapshot(&self, dataset_id: DatasetId) -> Result<SnapshotId, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        self.snapshot_locked(dataset_id).await
    }

    async fn snapshot_locked(&self, dataset_id: DatasetId) -> Result<SnapshotId, ReplicationError> {
        let existing = self.backend.snapshots(dataset_id).await?;
        let snapshot = self.next_snapshot_id(existing.last());
        self.backend.snapshot(dataset_id, snapshot).await?;
        debug!("dataset={dataset_id} snapshot={snapshot} created");
        Ok(snapshot)
    }

    /// Whether a dataset needs a new snapshot according to the configured trigger.
    pub async fn snapshot_due(
        &self,
        dataset_id: DatasetId,
        latest: Option<&SnapshotId>,
    ) -> Result<bool, BackendError> {
        let Some(latest) = latest else {
            return Ok(true);
        };
        match self.trigger {
            SnapshotTrigger::Poll => self.backend.has_changes(dataset_id).await,
            SnapshotTrigger::Interval => {
                let age = Utc::now().signed_duration_since(latest.created_at());
                Ok(age.to_std().unwrap_or_default() >= self.snapshot_interval)
            }
        }
    }

    /// Take a snapshot if one is due, and return the newest snapshot either way.
    pub async fn ensure_snapshot(
        &self,
        dataset_id: DatasetId,
    ) -> Result<SnapshotId, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        let existing = self.backend.snapshots(dataset_id).await?;
        match existing.last() {
            Some(latest) if !self.snapshot_due(dataset_id, Some(latest)).await? => Ok(*latest),
            _ => self.snapshot_locked(dataset_id).await,
        }
    }

    /// Take a snapshot only if the dataset was written to since its latest one, regardless of the
    /// configured trigger. Used for the final snapshot of a handoff.
    pub async fn final_snapshot(
        &self,
        dataset_id: DatasetId,
    ) -> Result<SnapshotId, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        let existing = self.backend.snapshots(dataset_id).await?;
        match existing.last() {
            Some(latest) if !self.backend.has_changes(dataset_id).await? => Ok(*latest),
            _ => self.snapshot_locked(dataset_id).await,
        }
    }

    /// Bring `peer`'s copy of the dataset up to our newest snapshot. Returns the snapshot the peer
    /// now holds, or `None` if there is nothing to send yet.
    pub async fn replicate<P: Peer>(
        &self,
        dataset_id: DatasetId,
        peer: &P,
    ) -> Result<Option<SnapshotId>, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        let local = self.backend.snapshots(dataset_id).await?;
        let remote = peer.list_snapshots(dataset_id).await?.unwrap_or_default();

        let result = match plan_send(&local, &remote, self.config.max_auto_resolve_divergence) {
            SendPlan::UpToDate => Ok(local.last().copied()),
            SendPlan::Send {
                from,
                to,
                resolve_divergence,
            } => {
                if resolve_divergence {
                    warn!(
                        "dataset={dataset_id} peer={} history diverged; peer will stash its side",
                        peer.node_id()
                    );
                }
                self.transfer(dataset_id, from, to, resolve_divergence, peer)
                    .await
                    .map(|()| Some(to))
            }
            SendPlan::Diverged {
                local_only,
                remote_only,
            } => Err(ReplicationError::DivergedHistory {
                dataset_id,
                destination: peer.node_id(),
                local_only,
                remote_only,
            }),
        };

        match &result {
            Ok(Some(held)) => {
                self.replica_bases.lock().unwrap().insert(dataset_id, *held);
                self.diverged.lock().unwrap().remove(&dataset_id);
                self.prune_locked(dataset_id).await?;
            }
            Ok(None) => {}
            Err(e) if !e.is_transient() => {
                self.diverged.lock().unwrap().insert(dataset_id);
            }
            Err(_) => {}
        }
        result
    }

    /// Send the difference between `from` and `to` to `peer`. The peer must already hold `from`;
    /// a `None` base sends the whole dataset.
    pub async fn send<P: Peer>(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
        peer: &P,
    ) -> Result<(), ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        if let Some(base) = from {
            let remote = peer.list_snapshots(dataset_id).await?.unwrap_or_default();
            if !remote.contains(&base) {
                return Err(ReplicationError::MissingBaseSnapshot {
                    dataset_id,
                    base,
                    destination: peer.node_id(),
                });
            }
        }
        self.transfer(dataset_id, from, to, false, peer).await
    }

    async fn transfer<P: Peer>(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
        resolve_divergence: bool,
        peer: &P,
    ) -> Result<(), ReplicationError> {
        let _lease = Lease::take(&self.leases, dataset_id, from);
        let sent = AtomicUsize::new(0);
        let stream = self
            .backend
            .send(dataset_id, from, to)
            .await?
            .inspect_ok(|chunk| {
                sent.fetch_add(chunk.len(), Ordering::Relaxed);
            })
            .boxed();
        let request = ReceiveRequest {
            dataset_id,
            from,
            to,
            source: self.node_id,
            resolve_divergence,
        };
        match tokio::time::timeout(self.transfer_timeout, peer.receive(request, stream)).await {
            Ok(Ok(())) => {
                info!(
                    "dataset={dataset_id} peer={} sent {} -> {to} ({} bytes)",
                    peer.node_id(),
                    from.map_or("full".to_string(), |f| f.to_string()),
                    sent.load(Ordering::Relaxed),
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReplicationError::TimedOut(dataset_id)),
        }
    }

    /// Apply a replication stream sent by a peer.
    pub async fn receive(
        &self,
        request: &ReceiveRequest,
        stream: ReplicationStream<'_>,
    ) -> Result<(), ReplicationError> {
        let dataset_id = request.dataset_id;
        let _guard = self.lock(dataset_id).await;

        let volume = self.volume(dataset_id).await?;
        if let Some(volume) = &volume {
            if volume.attached {
                return Err(ReplicationError::Backend(BackendError::BadStream {
                    dataset_id,
                    reason: "dataset is attached read-write on the receiving node".to_string(),
                }));
            }
        }
        let mut local = volume.map(|v| v.snapshots);
        if let Some(snapshots) = &mut local {
            // Writes since the latest snapshot are history of their own, and are stashed with
            // the rest if this copy loses.
            if !snapshots.is_empty() && self.backend.has_changes(dataset_id).await? {
                let snapshot = self.snapshot_locked(dataset_id).await?;
                warn!("dataset={dataset_id} kept unsnapshotted writes as snapshot {snapshot}");
                snapshots.push(snapshot);
            }
        }

        let past_base: Vec<SnapshotId> = match (request.from, &local) {
            (Some(base), Some(local)) if local.contains(&base) => {
                local.iter().filter(|s| **s > base).copied().collect()
            }
            (Some(base), _) => {
                return Err(ReplicationError::MissingBaseSnapshot {
                    dataset_id,
                    base,
                    destination: self.node_id,
                })
            }
            (None, Some(local)) => local.clone(),
            (None, None) => Vec::new(),
        };

        if let Some(latest) = past_base.last() {
            if !request.resolve_divergence {
                return Err(ReplicationError::DivergedHistory {
                    dataset_id,
                    destination: self.node_id,
                    local_only: 0,
                    remote_only: past_base.len(),
                });
            }
            let stash = Stash::new(dataset_id, Utc::now());
            self.backend.stash(dataset_id, *latest, &stash.label).await?;
            warn!(
                "dataset={dataset_id} stashed {} diverged snapshot(s) as '{}' before taking {} from {}",
                past_base.len(),
                stash.label,
                request.to,
                request.source
            );
            match request.from {
                Some(base) => self.backend.rollback(dataset_id, base).await?,
                None => self.backend.destroy(dataset_id).await?,
            }
        } else if request.from.is_none() && local.is_some() {
            // An empty copy without snapshots; a full stream replaces it.
            self.backend.destroy(dataset_id).await?;
        }

        self.backend
            .receive(dataset_id, request.from, request.to, stream)
            .await?;
        self.prune_locked(dataset_id).await?;
        Ok(())
    }

    fn retained(&self, dataset_id: DatasetId, snapshot: &SnapshotId) -> bool {
        let key = (dataset_id, *snapshot);
        self.pinned.lock().unwrap().contains(&key)
            || self.leases.lock().unwrap().contains_key(&key)
            || self.replica_bases.lock().unwrap().get(&dataset_id) == Some(snapshot)
    }

    /// Destroy a snapshot unless something still needs it. Returns whether it was destroyed.
    pub async fn destroy_snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<bool, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        if self.retained(dataset_id, &snapshot) {
            return Ok(false);
        }
        let existing = self.backend.snapshots(dataset_id).await?;
        if existing.last() == Some(&snapshot) {
            // The newest snapshot is the base for every future send.
            return Ok(false);
        }
        self.backend.destroy_snapshot(dataset_id, snapshot).await?;
        Ok(true)
    }

    /// Apply the retention policy to a dataset.
    pub async fn prune(&self, dataset_id: DatasetId) -> Result<usize, ReplicationError> {
        let _guard = self.lock(dataset_id).await;
        self.prune_locked(dataset_id).await
    }

    async fn prune_locked(&self, dataset_id: DatasetId) -> Result<usize, ReplicationError> {
        let snapshots = self.backend.snapshots(dataset_id).await?;
        let keep = self.config.keep_snapshots.max(1);
        let candidates = snapshots.len().saturating_sub(keep);
        let mut destroyed = 0;
        for snapshot in &snapshots[..candidates] {
            if self.retained(dataset_id, snapshot) {
                continue;
            }
            self.backend.destroy_snapshot(dataset_id, *snapshot).await?;
            destroyed += 1;
        }
        if destroyed > 0 {
            debug!("dataset={dataset_id} pruned {destroyed} snapshot(s)");
        }
        Ok(destroyed)
    }

    /// Whether replication out of this dataset stopped on a divergence that needs an operator.
    pub fn is_diverged(&self, dataset_id: DatasetId) -> bool {
        self.diverged.lock().unwrap().contains(&dataset_id)
    }

    /// Forget everything held for a dataset that no longer exists locally.
    fn forget(&self, dataset_id: DatasetId) {
        self.replica_bases.lock().unwrap().remove(&dataset_id);
        self.diverged.lock().unwrap().remove(&dataset_id);
        self.pinned
            .lock()
            .unwrap()
            .retain(|(pinned, _)| *pinned != dataset_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, config::PinnedSnapshot};

    fn ids(n: usize) -> Vec<SnapshotId> {
        let node = NodeId::new_random();
        (1..=n as u64).map(|t| SnapshotId::new(t, node)).collect()
    }

    #[test]
    fn plan_picks_newest_common_base() {
        let s = ids(5);

        assert_eq!(
            plan_send(&s, &s[..2], 10),
            SendPlan::Send {
                from: Some(s[1]),
                to: s[4],
                resolve_divergence: false
            }
        );
        assert_eq!(
            plan_send(&s, &[], 10),
            SendPlan::Send {
                from: None,
                to: s[4],
                resolve_divergence: false
            }
        );
        assert_eq!(plan_send(&s, &s, 10), SendPlan::UpToDate);
        assert_eq!(plan_send(&[], &s, 10), SendPlan::UpToDate);

        // The sender pruned old snapshots; the newest one the peer still has is the base.
        assert_eq!(
            plan_send(&s[2..], &s[..4], 10),
            SendPlan::Send {
                from: Some(s[3]),
                to: s[4],
                resolve_divergence: false
            }
        );
    }

    #[test]
    fn plan_bounds_divergence() {
        let ours = ids(6);
        let theirs_node = NodeId::new_random();
        let mut theirs = ours[..3].to_vec();
        theirs.extend((10..13).map(|t| SnapshotId::new(t, theirs_node)));

        assert_eq!(
            plan_send(&ours, &theirs, 10),
            SendPlan::Send {
                from: Some(ours[2]),
                to: ours[5],
                resolve_divergence: true
            }
        );
        assert_eq!(
            plan_send(&ours, &theirs, 5),
            SendPlan::Diverged {
                local_only: 3,
                remote_only: 3
            }
        );
    }

    fn engine(backend: &MemoryBackend, keep: usize) -> ReplicationEngine {
        engine_pinning(backend, keep, Vec::new())
    }

    fn engine_pinning(
        backend: &MemoryBackend,
        keep: usize,
        pinned: Vec<PinnedSnapshot>,
    ) -> ReplicationEngine {
        ReplicationEngine::new(
            NodeId::new_random(),
            Backend::Memory(backend.clone()),
            ReplicationConfig {
                keep_snapshots: keep,
                max_auto_resolve_divergence: 10,
                pinned,
            },
            &ConvergenceConfig::default(),
        )
    }

    #[tokio::test]
    async fn snapshot_ids_strictly_increase() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, 100);
        let id = DatasetId::new_random();
        backend.create(id, None).unwrap();

        let mut previous = None;
        for _ in 0..20 {
            let snapshot = engine.snapshot(id).await.unwrap();
            assert!(previous.map_or(true, |p| p < snapshot));
            previous = Some(snapshot);
        }

        // A snapshot from a node whose clock runs far ahead does not break the order.
        let ahead = SnapshotId::new(u64::MAX / 2, NodeId::new_random());
        backend.snapshot(id, ahead).unwrap();
        assert!(engine.snapshot(id).await.unwrap() > ahead);
    }

    #[tokio::test]
    async fn poll_trigger_follows_writes() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, 5);
        let id = DatasetId::new_random();
        backend.create(id, None).unwrap();
        backend.attach(id, 0).unwrap();

        let first = engine.ensure_snapshot(id).await.unwrap();
        assert_eq!(engine.ensure_snapshot(id).await.unwrap(), first);

        backend.write_file(id, "f", b"x").unwrap();
        assert!(engine.snapshot_due(id, Some(&first)).await.unwrap());
        assert!(engine.ensure_snapshot(id).await.unwrap() > first);
    }

    #[tokio::test]
    async fn pruning_keeps_newest_pinned_and_leased() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, 2);
        let id = DatasetId::new_random();
        backend.create(id, None).unwrap();

        let mut snapshots = Vec::new();
        for _ in 0..5 {
            snapshots.push(engine.snapshot(id).await.unwrap());
        }
        // Restart with the oldest snapshot pinned in the configuration.
        let engine = engine_pinning(
            &backend,
            2,
            vec![PinnedSnapshot {
                dataset: id,
                snapshot: snapshots[0],
            }],
        );
        let lease = Lease::take(&engine.leases, id, Some(snapshots[1]));

        assert_eq!(engine.prune(id).await.unwrap(), 1);
        assert_eq!(
            backend.snapshots(id).unwrap(),
            vec![snapshots[0], snapshots[1], snapshots[3], snapshots[4]]
        );

        assert!(!engine.destroy_snapshot(id, snapshots[1]).await.unwrap());
        drop(lease);
        assert!(engine.destroy_snapshot(id, snapshots[1]).await.unwrap());
        assert!(!engine.destroy_snapshot(id, snapshots[4]).await.unwrap());
    }

    #[tokio::test]
    async fn receive_requires_base() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, 5);
        let request = ReceiveRequest {
            dataset_id: DatasetId::new_random(),
            from: Some(SnapshotId::new(1, NodeId::new_random())),
            to: SnapshotId::new(2, NodeId::new_random()),
            source: NodeId::new_random(),
            resolve_divergence: false,
        };

        let result = engine
            .receive(&request, futures::stream::empty().boxed())
            .await;

        assert!(matches!(
            result,
            Err(ReplicationError::MissingBaseSnapshot { .. })
        ));
    }

    /// Another engine in the same process, reached directly.
    struct Direct<'a>(&'a ReplicationEngine);

    impl Peer for Direct<'_> {
        fn node_id(&self) -> NodeId {
            self.0.node_id()
        }

        async fn list_snapshots(
            &self,
            dataset_id: DatasetId,
        ) -> Result<Option<Vec<SnapshotId>>, ReplicationError> {
            Ok(self.0.volume(dataset_id).await?.map(|v| v.snapshots))
        }

        async fn receive(
            &self,
            request: ReceiveRequest,
            stream: ReplicationStream<'_>,
        ) -> Result<(), ReplicationError> {
            self.0.receive(&request, stream).await
        }

        async fn exchange_status(&self, status: PeerStatus) -> Result<PeerStatus, ReplicationError> {
            Ok(status)
        }
    }

    #[tokio::test]
    async fn send_requires_the_base_on_the_peer() {
        let (source, target) = (MemoryBackend::new(), MemoryBackend::new());
        let (a, b) = (engine(&source, 5), engine(&target, 5));
        let id = DatasetId::new_random();
        a.create(id, None, 1).await.unwrap();
        source.write_file(id, "f", b"1").unwrap();
        let s1 = a.snapshot(id).await.unwrap();
        source.write_file(id, "f", b"2").unwrap();
        let s2 = a.snapshot(id).await.unwrap();

        let e = a.send(id, Some(s1), s2, &Direct(&b)).await.unwrap_err();
        assert!(matches!(e, ReplicationError::MissingBaseSnapshot { base, .. } if base == s1));
        assert!(target.snapshots(id).is_err());

        a.send(id, None, s1, &Direct(&b)).await.unwrap();
        a.send(id, Some(s1), s2, &Direct(&b)).await.unwrap();
        assert_eq!(target.snapshots(id).unwrap(), vec![s1, s2]);
        assert_eq!(target.read_file(id, "f"), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn unsnapshotted_writes_on_the_losing_side_are_stashed() {
        let (source, target) = (MemoryBackend::new(), MemoryBackend::new());
        let (a, b) = (engine(&source, 5), engine(&target, 5));
        let id = DatasetId::new_random();
        a.create(id, None, 1).await.unwrap();
        source.write_file(id, "shared", b"1").unwrap();
        a.snapshot(id).await.unwrap();
        a.replicate(id, &Direct(&b)).await.unwrap();

        // Written on b without a snapshot, then both sides move on.
        target.attach(id, 1).unwrap();
        target.write_file(id, "late", b"b").unwrap();
        target.detach(id).unwrap();
        source.write_file(id, "newer", b"a").unwrap();
        let newest = a.snapshot(id).await.unwrap();

        // b turns its writes into a snapshot of its own and refuses; the next attempt sees that
        // snapshot and resolves the divergence.
        let e = a.replicate(id, &Direct(&b)).await.unwrap_err();
        assert!(matches!(e, ReplicationError::DivergedHistory { .. }));
        assert_eq!(a.replicate(id, &Direct(&b)).await.unwrap(), Some(newest));

        assert_eq!(target.read_file(id, "late"), None);
        assert_eq!(target.read_file(id, "newer"), Some(b"a".to_vec()));
        let stashes = target.stashes().unwrap();
        assert_eq!(stashes.len(), 1);
        assert_eq!(
            target.read_stashed_file(&stashes[0], "late"),
            Some(b"b".to_vec())
        );
    }
}
