// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A backend that drives the `zfs` command line tool.
//!
//! Each dataset is the filesystem `<pool>/<dataset id>`, mounted at `<mount root>/<dataset id>`
//! while attached. Detached datasets are unmounted and read-only. Replication streams are native
//! `zfs send` streams. The configuration epoch a dataset was attached under is kept in the user
//! property `flocker:epoch` so that it survives agent restarts.

use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
    process::{Output, Stdio},
};

use {
    bytes::Bytes,
    futures::{future, stream, StreamExt, TryStreamExt},
    log::debug,
    tokio::{
        io::AsyncWriteExt,
        process::{Child, ChildStdin, Command},
    },
    tokio_util::io::ReaderStream,
};

use super::{ReplicationStream, VolumeInfo};
use crate::{
    error::BackendError,
    model::{DatasetId, SnapshotId},
    protocol::DATA_CHUNK,
};

const ZFS: &str = "zfs";
const EPOCH_PROPERTY: &str = "flocker:epoch";
const STASH_DATASET: &str = "flocker-stashes";

#[derive(Debug, Clone)]
pub struct ZfsBackend {
    pool: String,
    mount_root: PathBuf,
}

impl ZfsBackend {
    pub fn new(pool: String, mount_root: PathBuf) -> Self {
        ZfsBackend { pool, mount_root }
    }

    fn dataset(&self, dataset_id: DatasetId) -> String {
        format!("{}/{dataset_id}", self.pool)
    }

    fn snapshot_name(&self, dataset_id: DatasetId, snapshot: &SnapshotId) -> String {
        format!("{}/{dataset_id}@{snapshot}", self.pool)
    }

    fn mountpoint(&self, dataset_id: DatasetId) -> PathBuf {
        self.mount_root.join(dataset_id.to_string())
    }

    fn spawn(args: &[&str], stdin: Stdio) -> Result<Child, BackendError> {
        Command::new(ZFS)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    BackendError::Unavailable(format!("`{ZFS}` is not installed"))
                }
                _ => BackendError::Io(e),
            })
    }

    /// Run `zfs` with `args`, feeding it `input` on stdin if given, and return its output if it
    /// exited successfully.
    async fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output, BackendError> {
        let command = format!("{ZFS} {}", args.join(" "));
        debug!("running `{command}`");

        let mut child = Self::spawn(
            args,
            if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            },
        )?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("no such pool") {
            return Err(BackendError::Unavailable(stderr));
        }
        Err(BackendError::Command { command, stderr })
    }

    async fn run_text(&self, args: &[&str]) -> Result<String, BackendError> {
        let output = self.run(args, None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Map "dataset does not exist" failures to `NotFound`.
    fn not_found(dataset_id: DatasetId, e: BackendError) -> BackendError {
        match e {
            BackendError::Command { ref stderr, .. } if stderr.contains("does not exist") => {
                BackendError::NotFound(dataset_id)
            }
            e => e,
        }
    }

    pub async fn list(&self) -> Result<Vec<VolumeInfo>, BackendError> {
        let properties = format!("name,quota,mounted,readonly,mountpoint,{EPOCH_PROPERTY}");
        let filesystems = self
            .run_text(&[
                "list", "-H", "-p", "-r", "-d", "1", "-t", "filesystem", "-o", &properties,
                &self.pool,
            ])
            .await?;
        let snapshots = self
            .run_text(&[
                "list", "-H", "-p", "-r", "-t", "snapshot", "-o", "name", "-s", "createtxg",
                &self.pool,
            ])
            .await?;

        let mut snapshots = parse_snapshots(&self.pool, &snapshots);
        Ok(parse_filesystems(&self.pool, &filesystems)?
            .into_iter()
            .map(|mut volume| {
                volume.snapshots = snapshots.remove(&volume.dataset_id).unwrap_or_default();
                volume
            })
            .collect())
    }

    pub async fn create(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        let mountpoint = format!("mountpoint={}", self.mountpoint(dataset_id).display());
        let quota = format!("quota={}", quota_value(maximum_size));
        let result = self
            .run(
                &[
                    "create",
                    "-u",
                    "-o",
                    &mountpoint,
                    "-o",
                    "readonly=on",
                    "-o",
                    &quota,
                    &self.dataset(dataset_id),
                ],
                None,
            )
            .await;
        match result {
            Err(BackendError::Command { stderr, .. }) if stderr.contains("already exists") => {
                Err(BackendError::AlreadyExists(dataset_id))
            }
            other => other.map(|_| ()),
        }
    }

    pub async fn destroy(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        self.run(&["destroy", "-r", &self.dataset(dataset_id)], None)
            .await
            .map_err(|e| Self::not_found(dataset_id, e))?;
        Ok(())
    }

    pub async fn attach(&self, dataset_id: DatasetId, epoch: u64) -> Result<PathBuf, BackendError> {
        let dataset = self.dataset(dataset_id);
        let epoch = format!("{EPOCH_PROPERTY}={epoch}");
        self.run(&["set", "readonly=off", &epoch, &dataset], None)
            .await
            .map_err(|e| Self::not_found(dataset_id, e))?;
        match self.run(&["mount", &dataset], None).await {
            Ok(_) => {}
            Err(BackendError::Command { stderr, .. }) if stderr.contains("already mounted") => {}
            Err(e) => return Err(e),
        }
        Ok(self.mountpoint(dataset_id))
    }

    pub async fn detach(&self, dataset_id: DatasetId) -> Result<(), BackendError> {
        let dataset = self.dataset(dataset_id);
        match self.run(&["unmount", &dataset], None).await {
            Ok(_) => {}
            Err(BackendError::Command { stderr, .. }) if stderr.contains("not currently mounted") => {}
            Err(e) => return Err(Self::not_found(dataset_id, e)),
        }
        self.run(&["set", "readonly=on", &dataset], None).await?;
        Ok(())
    }

    pub async fn resize(
        &self,
        dataset_id: DatasetId,
        maximum_size: Option<u64>,
    ) -> Result<(), BackendError> {
        let quota = format!("quota={}", quota_value(maximum_size));
        self.run(&["set", &quota, &self.dataset(dataset_id)], None)
            .await
            .map_err(|e| Self::not_found(dataset_id, e))?;
        Ok(())
    }

    pub async fn snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        self.run(
            &["snapshot", &self.snapshot_name(dataset_id, &snapshot)],
            None,
        )
        .await
        .map_err(|e| Self::not_found(dataset_id, e))?;
        Ok(())
    }

    pub async fn snapshots(&self, dataset_id: DatasetId) -> Result<Vec<SnapshotId>, BackendError> {
        let output = self
            .run_text(&[
                "list",
                "-H",
                "-p",
                "-r",
                "-d",
                "1",
                "-t",
                "snapshot",
                "-o",
                "name",
                "-s",
                "createtxg",
                &self.dataset(dataset_id),
            ])
            .await
            .map_err(|e| Self::not_found(dataset_id, e))?;
        Ok(parse_snapshots(&self.pool, &output)
            .remove(&dataset_id)
            .unwrap_or_default())
    }

    pub async fn destroy_snapshot(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        match self
            .run(
                &["destroy", &self.snapshot_name(dataset_id, &snapshot)],
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(BackendError::Command { stderr, .. }) if stderr.contains("could not find") => {
                Err(BackendError::SnapshotNotFound {
                    dataset_id,
                    snapshot,
                })
            }
            Err(e) => Err(Self::not_found(dataset_id, e)),
        }
    }

    /// Start `zfs send`. The stream ends with an error if `zfs send` fails part way, so a
    /// truncated stream is never mistaken for a complete one.
    pub async fn send(
        &self,
        dataset_id: DatasetId,
        from: Option<SnapshotId>,
        to: SnapshotId,
    ) -> Result<ReplicationStream<'static>, BackendError> {
        let to = self.snapshot_name(dataset_id, &to);
        let from = from.map(|from| self.snapshot_name(dataset_id, &from));
        // Missing snapshots are reported before anything is streamed.
        for snapshot in from.iter().chain([&to]) {
            self.run(&["list", "-H", "-t", "snapshot", "-o", "name", snapshot.as_str()], None)
                .await
                .map_err(|e| Self::not_found(dataset_id, e))?;
        }

        let mut args = vec!["send"];
        if let Some(from) = &from {
            args.extend(["-i", from.as_str()]);
        }
        args.push(to.as_str());
        let command = format!("{ZFS} {}", args.join(" "));
        debug!("running `{command}`");

        let mut child = Self::spawn(&args, Stdio::null())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("zfs send has no stdout"))?;
        let finished = stream::once(finish_send(child, command))
            .try_filter_map(|end| future::ready(Ok(end)));
        Ok(ReaderStream::with_capacity(stdout, DATA_CHUNK)
            .chain(finished)
            .boxed())
    }

    /// Pipe a replication stream into `zfs receive`. A stream that breaks off is not applied.
    pub async fn receive(
        &self,
        dataset_id: DatasetId,
        _from: Option<SnapshotId>,
        to: SnapshotId,
        stream: ReplicationStream<'_>,
    ) -> Result<(), BackendError> {
        // The stream itself names its base and zfs refuses it if that is not the latest local
        // snapshot, so only the target snapshot name is passed.
        let target = self.snapshot_name(dataset_id, &to);
        let args = ["receive", "-u", target.as_str()];
        debug!("running `{ZFS} {}`", args.join(" "));

        let mut child = Self::spawn(&args, Stdio::piped())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("zfs receive has no stdin"))?;
        let fed = feed(stdin, stream).await;
        if fed.is_err() {
            if let Err(e) = child.start_kill() {
                debug!("could not stop `zfs receive`: {e}");
            }
        }
        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match fed {
            Err(e) => Err(BackendError::BadStream {
                dataset_id,
                reason: if stderr.is_empty() {
                    format!("stream broke off: {e}")
                } else {
                    stderr
                },
            }),
            Ok(()) if output.status.success() => Ok(()),
            Ok(()) => Err(BackendError::BadStream {
                dataset_id,
                reason: stderr,
            }),
        }
    }

    pub async fn has_changes(&self, dataset_id: DatasetId) -> Result<bool, BackendError> {
        let output = self
            .run_text(&["get", "-H", "-p", "-o", "value", "written", &self.dataset(dataset_id)])
            .await
            .map_err(|e| Self::not_found(dataset_id, e))?;
        let written = output.trim();
        let written = written.parse::<u64>().map_err(|_| BackendError::Output {
            command: "zfs get written".to_string(),
            output: written.to_string(),
        })?;
        if written > 0 {
            return Ok(true);
        }
        // `written` is measured against the latest snapshot, or is the whole dataset if there is
        // none; an empty dataset without snapshots still needs its first one.
        Ok(self.snapshots(dataset_id).await?.is_empty())
    }

    pub async fn rollback(
        &self,
        dataset_id: DatasetId,
        snapshot: SnapshotId,
    ) -> Result<(), BackendError> {
        self.run(
            &["rollback", "-r", &self.snapshot_name(dataset_id, &snapshot)],
            None,
        )
        .await
        .map_err(|e| Self::not_found(dataset_id, e))?;
        Ok(())
    }

    pub async fn stash(
        &self,
        dataset_id: DatasetId,
        at: SnapshotId,
        label: &str,
    ) -> Result<(), BackendError> {
        let parent = format!("{}/{STASH_DATASET}", self.pool);
        self.run(&["create", "-p", "-u", "-o", "canmount=off", &parent], None)
            .await?;

        let stream = self
            .run(
                &["send", "-R", &self.snapshot_name(dataset_id, &at)],
                None,
            )
            .await
            .map_err(|e| Self::not_found(dataset_id, e))?
            .stdout;
        let target = format!("{parent}/{label}");
        self.run(
            &["receive", "-u", "-o", "readonly=on", &target],
            Some(&stream),
        )
        .await?;
        Ok(())
    }

    pub async fn stashes(&self) -> Result<Vec<String>, BackendError> {
        let parent = format!("{}/{STASH_DATASET}", self.pool);
        let output = match self
            .run_text(&["list", "-H", "-r", "-d", "1", "-o", "name", &parent])
            .await
        {
            Ok(output) => output,
            Err(BackendError::Command { stderr, .. }) if stderr.contains("does not exist") => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let prefix = format!("{parent}/");
        Ok(output
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }
}

fn quota_value(maximum_size: Option<u64>) -> String {
    match maximum_size {
        Some(size) => size.to_string(),
        None => "none".to_string(),
    }
}

/// Parse the output of `zfs list -H -p -o name,quota,mounted,readonly,mountpoint,flocker:epoch`.
///
/// Filesystems that are not named after a dataset (the pool itself, the stash parent) are
/// skipped.
fn parse_filesystems(pool: &str, output: &str) -> Result<Vec<VolumeInfo>, BackendError> {
    let prefix = format!("{pool}/");
    let mut volumes = Vec::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let &[name, quota, mounted, readonly, mountpoint, epoch] = fields.as_slice() else {
            return Err(BackendError::Output {
                command: "zfs list".to_string(),
                output: line.to_string(),
            });
        };
        let Some(dataset_id) = name
            .strip_prefix(&prefix)
            .and_then(|id| id.parse::<DatasetId>().ok())
        else {
            continue;
        };
        let maximum_size = match quota.parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(quota) => Some(quota),
        };
        let attached = mounted == "yes" && readonly == "off";
        volumes.push(VolumeInfo {
            dataset_id,
            maximum_size,
            attached,
            epoch: epoch.parse().unwrap_or(0),
            path: attached.then(|| PathBuf::from(mountpoint)),
            snapshots: Vec::new(),
        });
    }
    Ok(volumes)
}

/// Parse the output of `zfs list -H -o name -t snapshot`, grouping snapshots by dataset. Snapshots
/// not named by us are ignored.
fn parse_snapshots(pool: &str, output: &str) -> BTreeMap<DatasetId, Vec<SnapshotId>> {
    let prefix = format!("{pool}/");
    let mut snapshots: BTreeMap<DatasetId, Vec<SnapshotId>> = BTreeMap::new();
    for line in output.lines() {
        let Some((dataset, snapshot)) = line.trim().split_once('@') else {
            continue;
        };
        let (Some(dataset_id), Ok(snapshot)) = (
            dataset
                .strip_prefix(&prefix)
                .and_then(|id| id.parse::<DatasetId>().ok()),
            snapshot.parse::<SnapshotId>(),
        ) else {
            continue;
        };
        snapshots.entry(dataset_id).or_default().push(snapshot);
    }
    for list in snapshots.values_mut() {
        list.sort();
    }
    snapshots
}

/// Wait for `zfs send` to exit, turning a failure into the last item of its stream.
async fn finish_send(child: Child, command: String) -> io::Result<Option<Bytes>> {
    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(None);
    }
    Err(io::Error::other(format!(
        "`{command}` failed: {}",
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

async fn feed(mut stdin: ChildStdin, mut stream: ReplicationStream<'_>) -> io::Result<()> {
    while let Some(chunk) = stream.next().await {
        stdin.write_all(&chunk?).await?;
    }
    stdin.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    #[test]
    fn filesystems_are_parsed() {
        let (a, b) = (DatasetId::new_random(), DatasetId::new_random());
        let output = format!(
            "tank\t0\tyes\toff\t/tank\t-\n\
             tank/{a}\t1073741824\tyes\toff\t/flocker/{a}\t4\n\
             tank/{b}\t0\tno\ton\t/flocker/{b}\t-\n\
             tank/flocker-stashes\t0\tno\toff\tnone\t-\n"
        );

        let volumes = parse_filesystems("tank", &output).unwrap();

        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].dataset_id, a);
        assert_eq!(volumes[0].maximum_size, Some(1 << 30));
        assert!(volumes[0].attached);
        assert_eq!(volumes[0].epoch, 4);
        assert_eq!(volumes[0].path, Some(PathBuf::from(format!("/flocker/{a}"))));
        assert!(!volumes[1].attached);
        assert_eq!(volumes[1].maximum_size, None);
        assert_eq!(volumes[1].epoch, 0);
    }

    #[test]
    fn short_lines_are_errors() {
        assert!(parse_filesystems("tank", "tank/x\t0\n").is_err());
    }

    #[test]
    fn snapshots_are_grouped_and_ordered() {
        let (a, b) = (DatasetId::new_random(), DatasetId::new_random());
        let node = NodeId::new_random();
        let (s1, s2) = (SnapshotId::new(100, node), SnapshotId::new(200, node));
        let output = format!(
            "tank/{a}@{s2}\n\
             tank/{a}@{s1}\n\
             tank/{a}@manual-backup\n\
             tank/{b}@{s1}\n\
             tank/flocker-stashes/x@{s1}\n"
        );

        let snapshots = parse_snapshots("tank", &output);

        assert_eq!(snapshots[&a], vec![s1, s2]);
        assert_eq!(snapshots[&b], vec![s1]);
        assert_eq!(snapshots.len(), 2);
    }
}
