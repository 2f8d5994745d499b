// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The replication stream format used by the backends that do not have a native one.
//!
//! A dataset's contents are treated as a flat map from relative path to file contents. A stream
//! between two snapshots carries only the paths whose contents differ, with `None` marking a
//! removal, and names both snapshots so the receiving side can check it is applied to the right
//! base.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::SnapshotId;

pub type FileTree = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStream {
    pub from: Option<SnapshotId>,
    pub to: SnapshotId,
    pub changes: BTreeMap<String, Option<Vec<u8>>>,
}

impl TreeStream {
    pub fn between(from: Option<(SnapshotId, &FileTree)>, to: SnapshotId, tree: &FileTree) -> Self {
        let changes = match from {
            Some((_, base)) => diff(base, tree),
            None => diff(&FileTree::new(), tree),
        };
        TreeStream {
            from: from.map(|(id, _)| id),
            to,
            changes,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing a map of strings and byte vectors cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("malformed stream: {e}"))
    }

    /// Apply the changes in this stream to `base`, producing the tree at `self.to`.
    pub fn apply_to(&self, base: &FileTree) -> FileTree {
        let mut tree = base.clone();
        for (path, contents) in &self.changes {
            match contents {
                Some(contents) => {
                    tree.insert(path.clone(), contents.clone());
                }
                None => {
                    tree.remove(path);
                }
            }
        }
        tree
    }
}

pub fn diff(old: &FileTree, new: &FileTree) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut changes = BTreeMap::new();
    for (path, contents) in new {
        if old.get(path) != Some(contents) {
            changes.insert(path.clone(), Some(contents.clone()));
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.insert(path.clone(), None);
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    fn tree(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn incremental_stream_only_carries_differences() {
        let node = NodeId::new_random();
        let (s1, s2) = (SnapshotId::new(1, node), SnapshotId::new(2, node));
        let old = tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let new = tree(&[("a", "1"), ("b", "20"), ("d", "4")]);

        let stream = TreeStream::between(Some((s1, &old)), s2, &new);

        assert_eq!(stream.changes.len(), 3);
        assert_eq!(stream.changes["c"], None);
        assert!(!stream.changes.contains_key("a"));
        assert_eq!(stream.apply_to(&old), new);

        let decoded = TreeStream::decode(&stream.encode()).unwrap();
        assert_eq!(decoded, stream);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(TreeStream::decode(b"\x00\x01not json").is_err());
    }
}
