// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A backend that keeps datasets in process memory.
//!
//! Used by the test environment and for trying out a cluster without a pool. It enforces the
//! same rules as the real backends: detached datasets cannot be written, streams only apply to
//! the right base, and it can be made unavailable to simulate a pool that went away.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{
    tree::{FileTree, TreeStream},
    VolumeInfo,
};
use crate::{
    error::BackendError,
    model::{DatasetId, SnapshotId},
};

#[derive(Debug, Clone)]
struct MemoryVolume {
    maximum_size: Option<u64>,
    attached: bool,
    epoch: u64,
    files: FileTree,
    snapshots: Vec<(SnapshotId, FileTree)>,
}

impl MemoryVolume {
    fn new(maximum_size: Option<u64>) -> Self {
        MemoryVolume {
            maximum_size,
            attached: false,
            epoch: 0,
            files: FileTree::new(),
            snapshots: Vec::new(),
        }
    }

    fn tree_at(&self, snapshot: &SnapshotId) -> Option<&FileTree> {
        self.snapshots
            .iter()
            .find(|(id, _)| id == snapshot)
            .map(|(_, tree)| tree)
    }

    fn used(&self) -> u64 {
        self.files.values().map(|contents| contents.len() as u64).sum()
    }
}

#[derive(Debug)]
struct MemoryPool {
    available: bool,
    volumes: BTreeMap<DatasetId, MemoryVolume>,
    stashes: BTreeMap<String, MemoryVolume>,
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    pool: Arc<Mutex<MemoryPool>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            pool: Arc::new(Mutex::new(MemoryPool {
                available: true,
                volumes: BTreeMap::new(),
                stashes: BTreeMap::new(),
            })),
        }
    }

    fn pool(&self) -> Result<MutexGuard<'_, MemoryPool>, BackendError> {
        let pool = self.pool.lock().unwrap();
        if !pool.available {
            return Err(BackendError::Unavailable("memory pool is offline".to_string()));
        }
        Ok(pool)
    }

    fn path(dataset_id: DatasetId) -> PathBuf {
        PathBuf::from(format!("/flocker-memory/{dataset_id}"))
    }

    pub fn list(&self) -> Result<Vec<VolumeInfo>, BackendError> {
        let pool = self.pool()?;
        Ok(pool
            .volumes
            .iter()
            .map(|(id, volume)| VolumeInfo {
                dataset_id: *id,
                maximum_size: volume.maximum_size,
                attached: volume.attached,
                epoch: volume.epoch,
                path: volume.attached.then(|| Self::path(*id)),
                snapshots: volume.snapshots.iter().map(|(s, _)| *s).collect(),
            })
            .collect())
    }

    pub fn create(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        if pool.volumes.contains_key(&dataset_id) {
            return Err(BackendError::AlreadyExists(dataset_id));
        }
        pool.volumes
            .insert(dataset_id, MemoryVolume::new(maximum_size));
        Ok(())
    }

    pub fn destroy(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        match pool.volumes.remove(&dataset_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(dataset_id)),
        }
    }

    pub fn attach(&self, dataset_id: DatasetId, epoch: u64) -> Result<PathBuf, BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        volume.attached = true;
        volume.epoch = epoch;
        Ok(Self::path(dataset_id))
    }

    pub fn detach(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        volume_mut(&mut pool, dataset_id)?.attached = false;
        Ok(())
    }

    pub fn resize(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        volume_mut(&mut pool, dataset_id)?.maximum_size = maximum_size;
        Ok(())
    }

    pub fn snapshot(&self, dataset_id: DatasetId, snapshot: SnapshotId) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        if let Some((latest, _)) = volume.snapshots.last() {
            if *latest >= snapshot {
                return Err(BackendError::BadStream {
                    dataset_id,
                    reason: format!("snapshot {snapshot} is not newer than {latest}"),
                });
            }
        }
        let files = volume.files.clone();
        volume.snapshots.push((snapshot, files));
        Ok(())
    }

    pub fn snapshots(&self, dataset_id: DatasetId) -> Result<Vec<SnapshotId>, BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        Ok(volume.snapshots.iter().map(|(s, _)| *s).collect())
    }

    pub fn destroy_snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        let before = volume.snapshots.len();
        volume.snapshots.retain(|(id, _)| *id != snapshot);
        if volume.snapshots.len() == before {
            return Err(BackendError::SnapshotNotFound {
                dataset_id,
                snapshot,
            });
        }
        Ok(())
    }

    pub fn send(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
    ) -> Result<Vec<u8>, BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        let tree = volume
            .tree_at(&to)
            .ok_or(BackendError::SnapshotNotFound {
                dataset_id,
                snapshot: to,
            })?;
        let base = match from {
            Some(from) => Some((
                from,
                volume.tree_at(&from).ok_or(BackendError::SnapshotNotFound {
                    dataset_id,
                    snapshot: from,
                })?,
            )),
            None => None,
        };
        Ok(TreeStream::between(base, to, tree).encode())
    }

    pub fn receive(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
        stream: &[u8],
    ) -> Result<(), BackendError> {
        let stream = TreeStream::decode(stream).map_err(|reason| BackendError::BadStream {
            dataset_id,
            reason,
        })?;
        if stream.from != from || stream.to != to {
            return Err(BackendError::BadStream {
                dataset_id,
                reason: "stream does not match the requested snapshots".to_string(),
            });
        }

        let mut pool = self.pool()?;
        let volume = pool
            .volumes
            .entry(dataset_id)
            .or_insert_with(|| MemoryVolume::new(None));
        if volume.attached {
            return Err(BackendError::BadStream {
                dataset_id,
                reason: "cannot receive into an attached dataset".to_string(),
            });
        }
        let latest = volume.snapshots.last().map(|(id, _)| *id);
        if latest != from {
            return Err(BackendError::BadStream {
                dataset_id,
                reason: match from {
                    Some(from) => format!("latest snapshot is not {from}"),
                    None => "full stream into a dataset that has snapshots".to_string(),
                },
            });
        }

        let base = match latest {
            Some(latest) => volume.tree_at(&latest).cloned().unwrap_or_default(),
            None => FileTree::new(),
        };
        let tree = stream.apply_to(&base);
        volume.files = tree.clone();
        volume.snapshots.push((to, tree));
        Ok(())
    }

    pub fn has_changes(&self, dataset_id: DatasetId) -> Result<bool, BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        Ok(match volume.snapshots.last() {
            Some((_, tree)) => *tree != volume.files,
            None => true,
        })
    }

    pub fn rollback(&self, dataset_id: DatasetId, snapshot: SnapshotId) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        let Some(position) = volume.snapshots.iter().position(|(id, _)| *id == snapshot) else {
            return Err(BackendError::SnapshotNotFound {
                dataset_id,
                snapshot,
            });
        };
        volume.snapshots.truncate(position + 1);
        volume.files = volume.snapshots[position].1.clone();
        Ok(())
    }

    pub fn stash(
        &self,
        dataset_id: DatasetId,
        at: SnapshotId,
        label: &str,
    ) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        let Some(position) = volume.snapshots.iter().position(|(id, _)| *id == at) else {
            return Err(BackendError::SnapshotNotFound {
                dataset_id,
                snapshot: at,
            });
        };
        let mut stash = volume.clone();
        stash.attached = false;
        stash.snapshots.truncate(position + 1);
        stash.files = stash.snapshots[position].1.clone();
        pool.stashes.insert(label.to_string(), stash);
        Ok(())
    }

    pub fn stashes(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.pool()?.stashes.keys().cloned().collect())
    }

    /// Write a file into an attached dataset, as a workload would.
    pub fn write_file(
        &self,
        dataset_id: DatasetId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        let mut pool = self.pool()?;
        let volume = volume_mut(&mut pool, dataset_id)?;
        if !volume.attached {
            return Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("dataset {dataset_id} is not attached read-write"),
            )));
        }
        let mut grown = volume.clone();
        grown.files.insert(path.to_string(), contents.to_vec());
        if let Some(limit) = volume.maximum_size {
            if grown.used() > limit {
                return Err(BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("dataset {dataset_id} is limited to {limit} bytes"),
                )));
            }
        }
        volume.files = grown.files;
        Ok(())
    }

    pub fn read_file(&self, dataset_id: DatasetId, path: &str) -> Option<Vec<u8>> {
        let pool = self.pool.lock().unwrap();
        pool.volumes.get(&dataset_id)?.files.get(path).cloned()
    }

    pub fn read_stashed_file(&self, label: &str, path: &str) -> Option<Vec<u8>> {
        let pool = self.pool.lock().unwrap();
        pool.stashes.get(label)?.files.get(path).cloned()
    }

    /// Take the pool offline (or bring it back), as if the disks behind it went away.
    pub fn set_available(&self, available: bool) {
        self.pool.lock().unwrap().available = available;
    }
}

fn volume_mut(
    pool: &mut MemoryPool,
    dataset_id: DatasetId,
) -> Result<&mut MemoryVolume, BackendError> {
    pool.volumes
        .get_mut(&dataset_id)
        .ok_or(BackendError::NotFound(dataset_id))
}
