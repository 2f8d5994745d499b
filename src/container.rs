// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Container runtimes.
//!
//! The agent only ever touches containers it started itself, which it recognises by the
//! `flocker.managed` label. A container whose dataset moves is removed on the old node and started
//! fresh on the new one, so the only operations needed are list, start and remove.

use std::{
    collections::BTreeMap,
    io,
    path::Path,
    process::Stdio,
    sync::{Arc, Mutex},
};

use {log::debug, tokio::process::Command};

use crate::{
    config::ContainerRuntimeKind,
    error::BackendError,
    model::{Container, ContainerState},
};

const DOCKER: &str = "docker";
const MANAGED_LABEL: &str = "flocker.managed";
const DATASET_LABEL: &str = "flocker.dataset";

#[derive(Debug, Clone)]
pub enum ContainerRuntime {
    Docker,
    Memory(MemoryRuntime),
    /// Container management is switched off; the agent only manages datasets.
    None,
}

impl ContainerRuntime {
    pub fn from_config(kind: ContainerRuntimeKind) -> Self {
        match kind {
            ContainerRuntimeKind::Docker => ContainerRuntime::Docker,
            ContainerRuntimeKind::None => ContainerRuntime::None,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, ContainerRuntime::None)
    }

    pub async fn list(&self) -> Result<Vec<ContainerState>, BackendError> {
        match self {
            ContainerRuntime::Docker => docker_list().await,
            ContainerRuntime::Memory(m) => m.list(),
            ContainerRuntime::None => Ok(Vec::new()),
        }
    }

    /// Start `container`, with its dataset (if it has one) mounted from `volume_path`. Any stopped
    /// container of the same name is replaced.
    pub async fn start(
        &self,
        container: &Container,
        volume_path: Option<&Path>,
    ) -> Result<(), BackendError> {
        match self {
            ContainerRuntime::Docker => docker_start(container, volume_path).await,
            ContainerRuntime::Memory(m) => m.start(container),
            ContainerRuntime::None => Ok(()),
        }
    }

    /// Stop and remove a container. Removing a container that does not exist succeeds.
    pub async fn remove(&self, name: &str) -> Result<(), BackendError> {
        match self {
            ContainerRuntime::Docker => docker_remove(name).await,
            ContainerRuntime::Memory(m) => m.remove(name),
            ContainerRuntime::None => Ok(()),
        }
    }
}

async fn docker(args: &[String]) -> Result<String, BackendError> {
    let command = format!("{DOCKER} {}", args.join(" "));
    debug!("running `{command}`");
    let output = Command::new(DOCKER)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                BackendError::Unavailable(format!("`{DOCKER}` is not installed"))
            }
            _ => BackendError::Io(e),
        })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Cannot connect to the Docker daemon") {
        return Err(BackendError::Unavailable(stderr));
    }
    Err(BackendError::Command { command, stderr })
}

async fn docker_list() -> Result<Vec<ContainerState>, BackendError> {
    let output = docker(&[
        "ps".to_string(),
        "--all".to_string(),
        "--filter".to_string(),
        format!("label={MANAGED_LABEL}=true"),
        "--format".to_string(),
        format!("{{{{.Names}}}}\t{{{{.Image}}}}\t{{{{.State}}}}\t{{{{.Label \"{DATASET_LABEL}\"}}}}"),
    ])
    .await?;
    Ok(parse_docker_ps(&output))
}

fn parse_docker_ps(output: &str) -> Vec<ContainerState> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let image = fields.next()?.trim();
            let state = fields.next()?.trim();
            let dataset_id = fields.next().and_then(|id| id.trim().parse().ok());
            if name.is_empty() {
                return None;
            }
            Some(ContainerState {
                name: name.to_string(),
                image: image.to_string(),
                running: state == "running",
                dataset_id,
            })
        })
        .collect()
}

fn docker_run_args(container: &Container, volume_path: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        container.name.clone(),
        "--label".to_string(),
        format!("{MANAGED_LABEL}=true"),
        "--restart".to_string(),
        "unless-stopped".to_string(),
    ];
    if let (Some(volume), Some(path)) = (&container.volume, volume_path) {
        args.push("--label".to_string());
        args.push(format!("{DATASET_LABEL}={}", volume.dataset_id));
        args.push("--volume".to_string());
        args.push(format!("{}:{}", path.display(), volume.mountpoint));
    }
    for port in &container.ports {
        args.push("--publish".to_string());
        args.push(format!("{}:{}", port.external, port.internal));
    }
    for (key, value) in &container.environment {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(container.image.clone());
    args
}

async fn docker_start(container: &Container, volume_path: Option<&Path>) -> Result<(), BackendError> {
    docker_remove(&container.name).await?;
    docker(&docker_run_args(container, volume_path)).await?;
    Ok(())
}

async fn docker_remove(name: &str) -> Result<(), BackendError> {
    match docker(&["rm".to_string(), "--force".to_string(), name.to_string()]).await {
        Ok(_) => Ok(()),
        Err(BackendError::Command { stderr, .. }) if stderr.contains("No such container") => Ok(()),
        Err(e) => Err(e),
    }
}

/// An in-process container runtime for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuntime {
    containers: Arc<Mutex<BTreeMap<String, ContainerState>>>,
}

impl MemoryRuntime {
    fn list(&self) -> Result<Vec<ContainerState>, BackendError> {
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }

    fn start(&self, container: &Container) -> Result<(), BackendError> {
        self.containers.lock().unwrap().insert(
            container.name.clone(),
            ContainerState {
                name: container.name.clone(),
                image: container.image.clone(),
                running: true,
                dataset_id: container.volume.as_ref().map(|v| v.dataset_id),
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), BackendError> {
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    /// Simulate a container exiting on its own.
    pub fn crash(&self, name: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.running = false;
        }
    }

    pub fn running(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatasetId, NodeId, PortMap, VolumeMount};

    #[test]
    fn docker_ps_output_is_parsed() {
        let id = DatasetId::new_random();
        let output = format!("pg\tpostgres:16\trunning\t{id}\nweb\tnginx\texited\t\n");

        let containers = parse_docker_ps(&output);

        assert_eq!(containers.len(), 2);
        assert!(containers[0].running);
        assert_eq!(containers[0].dataset_id, Some(id));
        assert!(!containers[1].running);
        assert_eq!(containers[1].dataset_id, None);
    }

    #[test]
    fn run_arguments_mount_the_dataset() {
        let id = DatasetId::new_random();
        let container = Container {
            name: "pg".to_string(),
            image: "postgres:16".to_string(),
            node: NodeId::new_random(),
            volume: Some(VolumeMount {
                dataset_id: id,
                mountpoint: "/var/lib/postgresql".to_string(),
            }),
            ports: vec![PortMap {
                internal: 5432,
                external: 15432,
            }],
            environment: BTreeMap::from([("POSTGRES_PASSWORD".to_string(), "x".to_string())]),
        };

        let args = docker_run_args(&container, Some(Path::new("/flocker/abc")));

        assert!(args.contains(&"/flocker/abc:/var/lib/postgresql".to_string()));
        assert!(args.contains(&"15432:5432".to_string()));
        assert!(args.contains(&format!("{DATASET_LABEL}={id}")));
        assert_eq!(args.last().unwrap(), "postgres:16");
    }
}
