// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::{Args, Subcommand};

use crate::{
    commands::{Api, Handle, HandledResult},
    model::{Container, DatasetId, NodeId, PortMap, VolumeMount},
};

#[derive(Args, Debug, Clone)]
pub struct ContainersArgs {
    #[command(subcommand)]
    pub command: ContainerCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ContainerCommand {
    List,
    /// Run a container on a node, optionally with a dataset mounted into it.
    Create {
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        node: NodeId,
        #[arg(long, requires = "mountpoint")]
        dataset: Option<DatasetId>,
        /// Path of the dataset inside the container.
        #[arg(long)]
        mountpoint: Option<String>,
        /// Port mapping as `INTERNAL:EXTERNAL`. May be repeated.
        #[arg(long = "port")]
        ports: Vec<String>,
    },
    Delete { name: String },
}

pub fn containers(api: &Api, args: &ContainersArgs) -> HandledResult<()> {
    match &args.command {
        ContainerCommand::List => {
            let containers: Vec<Container> = api.get("/v1/configuration/containers")?;
            for container in containers {
                let volume = container
                    .volume
                    .map(|v| format!(" {}:{}", v.dataset_id, v.mountpoint))
                    .unwrap_or_default();
                println!(
                    "{:<20} {:<30} node={}{volume}",
                    container.name, container.image, container.node
                );
            }
            Ok(())
        }
        ContainerCommand::Create {
            name,
            image,
            node,
            dataset,
            mountpoint,
            ports,
        } => {
            let ports = ports
                .iter()
                .map(String::as_str)
                .map(parse_port)
                .collect::<Result<Vec<_>, _>>()
                .handle_err(|e| eprintln!("{e}"))?;
            let volume = (*dataset).zip(mountpoint.clone()).map(|(dataset_id, mountpoint)| {
                VolumeMount {
                    dataset_id,
                    mountpoint,
                }
            });
            let container = Container {
                name: name.clone(),
                image: image.clone(),
                node: *node,
                volume,
                ports,
                environment: Default::default(),
            };
            let _: Container = api.post("/v1/configuration/containers", &container)?;
            Ok(())
        }
        ContainerCommand::Delete { name } => {
            api.delete(&format!("/v1/configuration/containers/{name}"))?;
            Ok(())
        }
    }
}

fn parse_port(mapping: &str) -> Result<PortMap, String> {
    let invalid = || format!("invalid port mapping '{mapping}', expected INTERNAL:EXTERNAL");
    let (internal, external) = mapping.split_once(':').ok_or_else(invalid)?;
    Ok(PortMap {
        internal: internal.parse().map_err(|_| invalid())?,
        external: external.parse().map_err(|_| invalid())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_mappings() {
        assert_eq!(
            parse_port("80:8080").unwrap(),
            PortMap {
                internal: 80,
                external: 8080
            }
        );
        assert!(parse_port("80").is_err());
        assert!(parse_port("80:http").is_err());
    }
}
