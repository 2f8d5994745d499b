// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use flocker_lib::{
        error::ConfigurationError,
        model::{ConfigurationChange, Container, NodeId, VolumeMount},
        test_env::*,
    };

    /// A cluster whose nodes have all reported once, so datasets can be placed on them.
    async fn registered(size: usize) -> TestCluster {
        let mut cluster = TestCluster::new(size);
        cluster.round().await;
        cluster
    }

    #[tokio::test]
    async fn new_dataset_is_created_on_its_primary_and_settles() {
        let mut cluster = registered(2).await;
        let id = cluster.create_dataset(0, None).await;

        cluster.converge(10).await;

        assert_eq!(cluster.attached_on(id), vec![cluster.node_id(0)]);
        assert!(!cluster.nodes[1].has_copy(id));
        for i in 0..2 {
            assert!(cluster.cycle(i).await.actions.is_empty());
        }
    }

    #[tokio::test]
    async fn moved_dataset_takes_its_data_and_container_along() {
        let mut cluster = registered(2).await;
        let (a, b) = (cluster.node_id(0), cluster.node_id(1));
        let id = cluster.create_dataset(0, None).await;
        cluster
            .change(ConfigurationChange::CreateContainer(Container {
                name: "db".to_string(),
                image: "postgres:16".to_string(),
                node: a,
                volume: Some(VolumeMount {
                    dataset_id: id,
                    mountpoint: "/var/lib/postgresql/data".to_string(),
                }),
                ports: vec![],
                environment: Default::default(),
            }))
            .await
            .unwrap();
        cluster.converge(10).await;
        assert_eq!(cluster.nodes[0].runtime.running(), vec!["db".to_string()]);

        cluster.nodes[0]
            .backend
            .write_file(id, "base/16384/1259", b"rows")
            .unwrap();
        let moved = cluster
            .change(ConfigurationChange::MoveDataset {
                dataset_id: id,
                primary: b,
            })
            .await
            .unwrap();
        assert_eq!(moved.containers["db"].node, b);

        for _ in 0..10 {
            cluster.round().await;
            assert!(cluster.attached_on(id).len() <= 1);
        }
        assert_eq!(cluster.round().await, 0);

        assert_eq!(cluster.attached_on(id), vec![b]);
        assert_eq!(
            cluster.nodes[1].backend.read_file(id, "base/16384/1259"),
            Some(b"rows".to_vec())
        );
        assert!(!cluster.nodes[0].has_copy(id));
        assert!(cluster.nodes[0].runtime.running().is_empty());
        assert_eq!(cluster.nodes[1].runtime.running(), vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn move_to_unknown_node_is_rejected() {
        let mut cluster = registered(2).await;
        let id = cluster.create_dataset(0, None).await;
        cluster.converge(10).await;
        let before = cluster.configuration();

        let e = cluster
            .change(ConfigurationChange::MoveDataset {
                dataset_id: id,
                primary: NodeId::new_random(),
            })
            .await
            .unwrap_err();

        assert!(matches!(e, ConfigurationError::InvalidConfiguration(_)));
        assert_eq!(cluster.configuration(), before);
        assert_eq!(cluster.round().await, 0);
        assert_eq!(cluster.attached_on(id), vec![cluster.node_id(0)]);
    }

    #[tokio::test]
    async fn resize_reaches_the_backend() {
        let mut cluster = registered(1).await;
        let id = cluster.create_dataset(0, None).await;
        cluster.converge(10).await;

        cluster
            .change(ConfigurationChange::ResizeDataset {
                dataset_id: id,
                maximum_size: Some(64 << 20),
            })
            .await
            .unwrap();
        cluster.converge(10).await;

        let volumes = cluster.nodes[0].backend.list().unwrap();
        assert_eq!(volumes[0].maximum_size, Some(64 << 20));
    }

    #[tokio::test]
    async fn deleted_dataset_is_destroyed_everywhere_then_forgotten() {
        let mut cluster = registered(2).await;
        let id = cluster.create_dataset(0, Some(1)).await;
        cluster.converge(10).await;
        assert!(cluster.nodes[1].has_copy(id));

        cluster
            .change(ConfigurationChange::DeleteDataset { dataset_id: id })
            .await
            .unwrap();
        assert!(cluster.configuration().datasets[&id].deleted);
        cluster.converge(10).await;

        assert!(!cluster.nodes[0].has_copy(id));
        assert!(!cluster.nodes[1].has_copy(id));
        assert!(!cluster.configuration().datasets.contains_key(&id));
    }

    #[tokio::test]
    async fn crashed_container_is_restarted() {
        let mut cluster = registered(1).await;
        cluster
            .change(ConfigurationChange::CreateContainer(Container {
                name: "web".to_string(),
                image: "nginx".to_string(),
                node: cluster.node_id(0),
                volume: None,
                ports: vec![],
                environment: Default::default(),
            }))
            .await
            .unwrap();
        cluster.converge(10).await;

        cluster.nodes[0].runtime.crash("web");
        assert!(cluster.nodes[0].runtime.running().is_empty());
        cluster.converge(10).await;

        assert_eq!(cluster.nodes[0].runtime.running(), vec!["web".to_string()]);
    }
}
