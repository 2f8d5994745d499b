// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;

use clap::{Args, Subcommand};

use crate::{
    commands::{format_size, Api, HandledResult},
    control::http::{CreateDatasetArgs, DatasetStateJson, UpdateDatasetArgs},
    model::{Dataset, DatasetId, NodeId},
};

#[derive(Args, Debug, Clone)]
pub struct DatasetsArgs {
    #[command(subcommand)]
    pub command: DatasetCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DatasetCommand {
    /// List configured datasets with the copies nodes report.
    List,
    Create {
        /// The node that mounts the new dataset.
        #[arg(long)]
        primary: NodeId,
        /// Keep a standby copy on this node and fail over to it.
        #[arg(long)]
        replica: Option<NodeId>,
        /// Maximum size in bytes.
        #[arg(long)]
        maximum_size: Option<u64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        id: Option<DatasetId>,
    },
    /// Change which node mounts a dataset.
    Move {
        dataset_id: DatasetId,
        #[arg(long)]
        to: NodeId,
    },
    Resize {
        dataset_id: DatasetId,
        #[arg(long)]
        maximum_size: u64,
    },
    Delete { dataset_id: DatasetId },
}

pub fn datasets(api: &Api, args: &DatasetsArgs) -> HandledResult<()> {
    match &args.command {
        DatasetCommand::List => list(api),
        DatasetCommand::Create {
            primary,
            replica,
            maximum_size,
            name,
            id,
        } => {
            let metadata = name
                .iter()
                .map(|name| ("name".to_string(), name.clone()))
                .collect();
            let dataset: Dataset = api.post(
                "/v1/configuration/datasets",
                &CreateDatasetArgs {
                    dataset_id: *id,
                    primary: *primary,
                    maximum_size: *maximum_size,
                    metadata,
                    replica: *replica,
                },
            )?;
            println!("{}", dataset.dataset_id);
            Ok(())
        }
        DatasetCommand::Move { dataset_id, to } => {
            let _: Dataset = api.post(
                &format!("/v1/configuration/datasets/{dataset_id}"),
                &UpdateDatasetArgs {
                    primary: Some(*to),
                    maximum_size: None,
                },
            )?;
            Ok(())
        }
        DatasetCommand::Resize {
            dataset_id,
            maximum_size,
        } => {
            let _: Dataset = api.post(
                &format!("/v1/configuration/datasets/{dataset_id}"),
                &UpdateDatasetArgs {
                    primary: None,
                    maximum_size: Some(*maximum_size),
                },
            )?;
            Ok(())
        }
        DatasetCommand::Delete { dataset_id } => {
            api.delete(&format!("/v1/configuration/datasets/{dataset_id}"))?;
            Ok(())
        }
    }
}

fn list(api: &Api) -> HandledResult<()> {
    let datasets: Vec<Dataset> = api.get("/v1/configuration/datasets")?;
    let state: Vec<DatasetStateJson> = api.get("/v1/state/datasets")?;
    let mut copies: BTreeMap<DatasetId, Vec<DatasetStateJson>> = BTreeMap::new();
    for copy in state {
        copies.entry(copy.dataset_id).or_default().push(copy);
    }

    for dataset in datasets {
        let mut line = format!(
            "{} {:<16} primary={} size={}",
            dataset.dataset_id,
            dataset.name().unwrap_or("-"),
            dataset.primary,
            format_size(dataset.maximum_size),
        );
        if let Some(replica) = dataset.replica {
            line.push_str(&format!(" replica={replica} epoch={}", dataset.epoch));
        }
        if dataset.deleted {
            line.push_str(" DELETED");
        }
        println!("{line}");

        for copy in copies.remove(&dataset.dataset_id).unwrap_or_default() {
            println!(
                "    {} {}{}{}",
                copy.node_id,
                if copy.primary { "mounted" } else { "replica" },
                copy.path.map(|p| format!(" at {p}")).unwrap_or_default(),
                if copy.diverged { " DIVERGED" } else { "" },
            );
        }
    }
    Ok(())
}
