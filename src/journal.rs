// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! An append-only audit journal of accepted configuration changes.
//!
//! The journal is for operators: it records who-changed-what in a greppable, tab-separated form.
//! It is never replayed to rebuild the configuration; that is the store's job.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{Local, NaiveDateTime};

use crate::model::ConfigurationChange;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%f";

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Writes a single record to the journal.
    pub fn write_record(&self, record: &Record) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.write_all(&[record.as_string().as_bytes(), b"\n"].concat())?;
        file.flush()
    }

    /// Read back every record in the journal, oldest first.
    pub fn records(&self) -> io::Result<Vec<Record>> {
        // Hold the writer off so a half-written line is never parsed.
        let _file = self.file.lock().unwrap();
        Record::get_all_from_file(&File::open(&self.path)?)
    }
}

/// A single record of an event that is tracked in the journal.
#[derive(Debug, PartialEq)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub event: Event,
    pub obj_id: String,
    pub comment: Option<String>,
}

impl Record {
    pub fn new(event: Event, obj_id: String, comment: Option<String>) -> Self {
        Record {
            timestamp: Local::now().naive_local(),
            event,
            obj_id,
            comment,
        }
    }

    /// Build the record describing an accepted configuration change. `version` is the
    /// configuration version the change produced.
    pub fn for_change(change: &ConfigurationChange, obj_id: String, version: u64) -> Self {
        let detail = match change {
            ConfigurationChange::RegisterNode(node) => format!("address={}", node.address),
            ConfigurationChange::CreateDataset {
                primary, replica, ..
            } => match replica {
                Some(replica) => format!("primary={primary} replica={replica}"),
                None => format!("primary={primary}"),
            },
            ConfigurationChange::MoveDataset { primary, .. } => format!("primary={primary}"),
            ConfigurationChange::ResizeDataset { maximum_size, .. } => match maximum_size {
                Some(size) => format!("maximum_size={size}"),
                None => "maximum_size=unlimited".to_string(),
            },
            ConfigurationChange::Promote { node_id, epoch, .. } => {
                format!("primary={node_id} epoch={epoch}")
            }
            ConfigurationChange::CreateContainer(container) => {
                format!("node={} image={}", container.node, container.image)
            }
            ConfigurationChange::DeleteDataset { .. }
            | ConfigurationChange::PurgeDataset { .. }
            | ConfigurationChange::DeleteContainer { .. } => String::new(),
        };
        let comment = if detail.is_empty() {
            format!("version={version}")
        } else {
            format!("version={version} {detail}")
        };
        Record::new(Event::from(change), obj_id, Some(comment))
    }

    /// Attempt to get all Records from a File, sorted by timestamp in ascending order.
    pub fn get_all_from_file(file: &File) -> io::Result<Vec<Record>> {
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let record = Record::from_string(&line).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("failed parsing record from '{line}': {e}"),
                )
            })?;
            records.push(record);
        }
        records.sort_by_key(|record| record.timestamp);

        Ok(records)
    }

    /// Create a String from a Record.
    pub fn as_string(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.event,
            self.obj_id,
            match self.comment {
                Some(ref comment) => comment,
                None => "",
            },
        )
    }

    /// Create a Record from a &str.
    pub fn from_string(record: &str) -> Result<Self, String> {
        let mut fields = record.split('\t');
        let Some(timestamp) = fields.next() else {
            return Err("missing timestamp field".to_string());
        };
        let Some(event) = fields.next() else {
            return Err("missing event field".to_string());
        };
        let Some(obj_id) = fields.next() else {
            return Err("missing obj_id field".to_string());
        };
        let comment = fields.collect::<Vec<_>>().join("\t");

        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .map_err(|e| format!("failed to parse timestamp: '{e}'"))?;

        Ok(Self {
            timestamp,
            event: Event::try_from(event)?,
            obj_id: obj_id.to_string(),
            comment: if comment.is_empty() {
                None
            } else {
                Some(comment)
            },
        })
    }
}

/// All possible events that can be represented in the journal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// A node reported state for the first time, or from a new address.
    RegisterNode,
    CreateDataset,
    MoveDataset,
    ResizeDataset,
    /// A dataset was marked deleted.
    DeleteDataset,
    /// A deleted dataset's tombstone was removed after every copy was gone.
    PurgeDataset,
    /// A failover replica took over as primary.
    Promote,
    CreateContainer,
    DeleteContainer,
}

impl From<&ConfigurationChange> for Event {
    fn from(change: &ConfigurationChange) -> Self {
        match change {
            ConfigurationChange::RegisterNode(_) => Self::RegisterNode,
            ConfigurationChange::CreateDataset { .. } => Self::CreateDataset,
            ConfigurationChange::MoveDataset { .. } => Self::MoveDataset,
            ConfigurationChange::ResizeDataset { .. } => Self::ResizeDataset,
            ConfigurationChange::DeleteDataset { .. } => Self::DeleteDataset,
            ConfigurationChange::PurgeDataset { .. } => Self::PurgeDataset,
            ConfigurationChange::Promote { .. } => Self::Promote,
            ConfigurationChange::CreateContainer(_) => Self::CreateContainer,
            ConfigurationChange::DeleteContainer { .. } => Self::DeleteContainer,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Self::RegisterNode => "register-node",
                Self::CreateDataset => "create-dataset",
                Self::MoveDataset => "move-dataset",
                Self::ResizeDataset => "resize-dataset",
                Self::DeleteDataset => "delete-dataset",
                Self::PurgeDataset => "purge-dataset",
                Self::Promote => "promote",
                Self::CreateContainer => "create-container",
                Self::DeleteContainer => "delete-container",
            }
        )
    }
}

impl TryFrom<&str> for Event {
    type Error = String;
    fn try_from(val: &str) -> Result<Self, Self::Error> {
        Ok(match val {
            "register-node" => Self::RegisterNode,
            "create-dataset" => Self::CreateDataset,
            "move-dataset" => Self::MoveDataset,
            "resize-dataset" => Self::ResizeDataset,
            "delete-dataset" => Self::DeleteDataset,
            "purge-dataset" => Self::PurgeDataset,
            "promote" => Self::Promote,
            "create-container" => Self::CreateContainer,
            "delete-container" => Self::DeleteContainer,
            _ => return Err(format!("failed to parse '{val}' as Event")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_survives_a_trip_through_text() {
        let record = Record {
            timestamp: Local::now().naive_local(),
            event: Event::MoveDataset,
            obj_id: "2a4d0e6c-5d1f-4b7a-9c27-0f0d5f1b1e11".to_string(),
            comment: Some("version=3\tprimary=b".to_string()),
        };

        let parsed = Record::from_string(&record.as_string()).unwrap();

        assert_eq!(record, parsed);
    }

    #[test]
    fn bad_lines_are_errors() {
        assert!(Record::from_string("not a record").is_err());
        assert!(Record::from_string("2025-01-01T00:00:00.000\tfrobnicate\tx\t").is_err());
    }

    #[test]
    fn journal_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let journal = Journal::open(&path).unwrap();

        journal
            .write_record(&Record::new(Event::CreateDataset, "d1".to_string(), None))
            .unwrap();
        journal
            .write_record(&Record::new(Event::DeleteDataset, "d1".to_string(), None))
            .unwrap();

        let records = journal.records().unwrap();
        let events: Vec<Event> = records.iter().map(|r| r.event).collect();
        assert_eq!(events, vec![Event::CreateDataset, Event::DeleteDataset]);
        assert_eq!(records[0].comment, None);
    }
}
