// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A backend that keeps datasets as plain directories under a root path.
//!
//! Every dataset is a directory holding its live contents in `data/` and a full copy of each
//! snapshot under `snapshots/<snapshot id>/`. There is no copy-on-write here, so snapshots cost
//! as much space as the data; this backend exists for hosts without ZFS. Quotas are recorded but
//! not enforced.
//!
//! ```text
//! <root>/datasets/<dataset id>/meta.json
//! <root>/datasets/<dataset id>/data/...
//! <root>/datasets/<dataset id>/snapshots/<snapshot id>/...
//! <root>/stashes/<label>/...
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use super::{
    tree::{FileTree, TreeStream},
    VolumeInfo,
};
use crate::{
    error::BackendError,
    model::{DatasetId, SnapshotId},
};

#[derive(Debug, Clone)]
pub struct LoopbackBackend {
    root: Arc<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    maximum_size: Option<u64>,
    attached: bool,
    epoch: u64,
}

/// Run a filesystem operation on the blocking thread pool.
async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Unavailable(format!("loopback worker failed: {e}")))?
}

impl LoopbackBackend {
    pub fn new(root: PathBuf) -> Self {
        LoopbackBackend {
            root: Arc::new(root),
        }
    }

    fn pool(&self) -> Pool {
        Pool {
            root: self.root.as_ref().clone(),
        }
    }

    pub async fn list(&self) -> Result<Vec<VolumeInfo>, BackendError> {
        let pool = self.pool();
        blocking(move || pool.list()).await
    }

    pub async fn create(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || pool.create(dataset_id, maximum_size)).await
    }

    pub async fn destroy(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            fs::remove_dir_all(dir)?;
            Ok(())
        })
        .await
    }

    pub async fn attach(&self, dataset_id: DatasetId, epoch: u64) -> Result<PathBuf, BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let mut meta = read_meta(&dir)?;
            meta.attached = true;
            meta.epoch = epoch;
            write_meta(&dir, &meta)?;
            Ok(dir.join("data"))
        })
        .await
    }

    pub async fn detach(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let mut meta = read_meta(&dir)?;
            meta.attached = false;
            write_meta(&dir, &meta)
        })
        .await
    }

    pub async fn resize(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let mut meta = read_meta(&dir)?;
            meta.maximum_size = maximum_size;
            write_meta(&dir, &meta)
        })
        .await
    }

    pub async fn snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            if let Some(latest) = list_snapshots(&dir)?.last() {
                if *latest >= snapshot {
                    return Err(BackendError::BadStream {
                        dataset_id,
                        reason: format!("snapshot {snapshot} is not newer than {latest}"),
                    });
                }
            }
            let tree = read_tree(&dir.join("data"))?;
            write_tree(&snapshot_dir(&dir, &snapshot), &tree)?;
            Ok(())
        })
        .await
    }

    pub async fn snapshots(&self, dataset_id: DatasetId) -> Result<Vec<SnapshotId>, BackendError> {
        let pool = self.pool();
        blocking(move || list_snapshots(&pool.dataset_dir(dataset_id)?)).await
    }

    pub async fn destroy_snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = snapshot_dir(&pool.dataset_dir(dataset_id)?, &snapshot);
            match fs::remove_dir_all(dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::SnapshotNotFound {
                    dataset_id,
                    snapshot,
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn send(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
    ) -> Result<Vec<u8>, BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let tree = pool.snapshot_tree(dataset_id, &dir, &to)?;
            let stream = match from {
                Some(from) => {
                    let base = pool.snapshot_tree(dataset_id, &dir, &from)?;
                    TreeStream::between(Some((from, &base)), to, &tree)
                }
                None => TreeStream::between(None, to, &tree),
            };
            Ok(stream.encode())
        })
        .await
    }

    pub async fn receive(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
        stream: Vec<u8>,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let stream = TreeStream::decode(&stream).map_err(|reason| BackendError::BadStream {
                dataset_id,
                reason,
            })?;
            if stream.from != from || stream.to != to {
                return Err(BackendError::BadStream {
                    dataset_id,
                    reason: "stream does not match the requested snapshots".to_string(),
                });
            }

            let dir = match pool.dataset_dir(dataset_id) {
                Ok(dir) => dir,
                Err(BackendError::NotFound(_)) if from.is_none() => {
                    pool.create(dataset_id, None)?;
                    pool.dataset_dir(dataset_id)?
                }
                Err(e) => return Err(e),
            };
            if read_meta(&dir)?.attached {
                return Err(BackendError::BadStream {
                    dataset_id,
                    reason: "cannot receive into an attached dataset".to_string(),
                });
            }
            let latest = list_snapshots(&dir)?.last().copied();
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
                Some(latest) => read_tree(&snapshot_dir(&dir, &latest))?,
                None => FileTree::new(),
            };
            let tree = stream.apply_to(&base);
            write_tree(&snapshot_dir(&dir, &to), &tree)?;
            write_tree(&dir.join("data"), &tree)?;
            Ok(())
        })
        .await
    }

    pub async fn has_changes(&self, dataset_id: DatasetId) -> Result<bool, BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let Some(latest) = list_snapshots(&dir)?.last().copied() else {
                return Ok(true);
            };
            Ok(read_tree(&dir.join("data"))? != read_tree(&snapshot_dir(&dir, &latest))?)
        })
        .await
    }

    pub async fn rollback(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let tree = pool.snapshot_tree(dataset_id, &dir, &snapshot)?;
            for later in list_snapshots(&dir)?.into_iter().filter(|s| *s > snapshot) {
                fs::remove_dir_all(snapshot_dir(&dir, &later))?;
            }
            write_tree(&dir.join("data"), &tree)?;
            Ok(())
        })
        .await
    }

    pub async fn stash(
        &self,
        dataset_id: DatasetId,
        at: SnapshotId,
        label: &str,
    ) -> Result<(), BackendError> {
        let pool = self.pool();
        let label = label.to_string();
        blocking(move || {
            let dir = pool.dataset_dir(dataset_id)?;
            let target = pool.root.join("stashes").join(&label);
            for snapshot in list_snapshots(&dir)?.into_iter().filter(|s| *s <= at) {
                let tree = read_tree(&snapshot_dir(&dir, &snapshot))?;
                write_tree(&snapshot_dir(&target, &snapshot), &tree)?;
            }
            let tree = pool.snapshot_tree(dataset_id, &dir, &at)?;
            write_tree(&target.join("data"), &tree)?;
            Ok(())
        })
        .await
    }

    pub async fn stashes(&self) -> Result<Vec<String>, BackendError> {
        let pool = self.pool();
        blocking(move || {
            pool.check()?;
            let mut labels = Vec::new();
            match fs::read_dir(pool.root.join("stashes")) {
                Ok(entries) => {
                    for entry in entries {
                        if let Some(name) = entry?.file_name().to_str() {
                            labels.push(name.to_string());
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            labels.sort();
            Ok(labels)
        })
        .await
    }
}

/// The synchronous half of the backend, run on the blocking pool.
struct Pool {
    root: PathBuf,
}

impl Pool {
    fn check(&self) -> Result<(), BackendError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "loopback root {} is not a directory",
                self.root.display()
            )))
        }
    }

    fn dataset_dir(&self, dataset_id: DatasetId) -> Result<PathBuf, BackendError> {
        self.check()?;
        let dir = self.root.join("datasets").join(dataset_id.to_string());
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(BackendError::NotFound(dataset_id))
        }
    }

    fn snapshot_tree(
        &self,
        dataset_id: DatasetId,
        dir: &Path,
        snapshot: &SnapshotId,
    ) -> Result<FileTree, BackendError> {
        let path = snapshot_dir(dir, snapshot);
        if !path.is_dir() {
            return Err(BackendError::SnapshotNotFound {
                dataset_id,
                snapshot: *snapshot,
            });
        }
        Ok(read_tree(&path)?)
    }

    fn list(&self) -> Result<Vec<VolumeInfo>, BackendError> {
        self.check()?;
        let entries = match fs::read_dir(self.root.join("datasets")) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut volumes = Vec::new();
        for entry in entries {
            let entry = entry?;
            // Anything that is not named after a dataset was not put there by us.
            let Some(dataset_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<DatasetId>().ok())
            else {
                continue;
            };
            let dir = entry.path();
            let meta = read_meta(&dir)?;
            volumes.push(VolumeInfo {
                dataset_id,
                maximum_size: meta.maximum_size,
                attached: meta.attached,
                epoch: meta.epoch,
                path: meta.attached.then(|| dir.join("data")),
                snapshots: list_snapshots(&dir)?,
            });
        }
        volumes.sort_by_key(|v| v.dataset_id);
        Ok(volumes)
    }

    fn create(&self, dataset_id: DatasetId, maximum_size: Option<u64>) -> Result<(), BackendError> {
        self.check()?;
        let dir = self.root.join("datasets").join(dataset_id.to_string());
        if dir.exists() {
            return Err(BackendError::AlreadyExists(dataset_id));
        }
        fs::create_dir_all(dir.join("data"))?;
        fs::create_dir_all(dir.join("snapshots"))?;
        write_meta(
            &dir,
            &Meta {
                maximum_size,
                ..Default::default()
            },
        )
    }
}

fn snapshot_dir(dir: &Path, snapshot: &SnapshotId) -> PathBuf {
    dir.join("snapshots").join(snapshot.to_string())
}

fn read_meta(dir: &Path) -> Result<Meta, BackendError> {
    let text = fs::read_to_string(dir.join("meta.json"))?;
    serde_json::from_str(&text).map_err(|e| BackendError::Output {
        command: format!("read {}", dir.join("meta.json").display()),
        output: e.to_string(),
    })
}

fn write_meta(dir: &Path, meta: &Meta) -> Result<(), BackendError> {
    let text = serde_json::to_string(meta).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let tmp = dir.join("meta.json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(tmp, dir.join("meta.json"))?;
    Ok(())
}

fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotId>, BackendError> {
    let mut snapshots = Vec::new();
    match fs::read_dir(dir.join("snapshots")) {
        Ok(entries) => {
            for entry in entries {
                if let Some(snapshot) = entry?
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<SnapshotId>().ok())
                {
                    snapshots.push(snapshot);
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    snapshots.sort();
    Ok(snapshots)
}

fn read_tree(dir: &Path) -> io::Result<FileTree> {
    fn walk(base: &Path, dir: &Path, tree: &mut FileTree) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(base, &path, tree)?;
            } else {
                let relative = path
                    .strip_prefix(base)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                tree.insert(relative.to_string_lossy().into_owned(), fs::read(&path)?);
            }
        }
        Ok(())
    }

    let mut tree = FileTree::new();
    match walk(dir, dir, &mut tree) {
        Ok(()) => Ok(tree),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(tree),
        Err(e) => Err(e),
    }
}

fn write_tree(dir: &Path, tree: &FileTree) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir_all(dir)?;
    for (path, contents) in tree {
        let path = dir.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
    }
    Ok(())
}
