// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flocker_lib::{failover::Role, test_env::*};

    /// Long enough for the one second liveness timeout of `fast_failover` to run out.
    const SILENCE: Duration = Duration::from_millis(1200);

    #[tokio::test]
    async fn replica_takes_over_and_the_old_primary_stashes_its_writes() {
        let mut cluster = TestCluster::with_failover(2, fast_failover());
        cluster.round().await;
        let (a, b) = (cluster.node_id(0), cluster.node_id(1));
        let id = cluster.create_dataset(0, Some(1)).await;

        cluster.converge(10).await;
        cluster.nodes[0]
            .backend
            .write_file(id, "shared.txt", b"before")
            .unwrap();
        cluster.converge(10).await;
        assert_eq!(
            cluster.nodes[1].backend.read_file(id, "shared.txt"),
            Some(b"before".to_vec())
        );
        assert_eq!(cluster.nodes[0].agent.failover().role(id), Some(Role::Master));
        assert_eq!(cluster.nodes[1].agent.failover().role(id), Some(Role::Slave));

        // The nodes lose each other. A keeps serving (it can still reach the control service) and
        // snapshots a write that never reaches B.
        cluster.partition(0, 1);
        cluster.nodes[0]
            .backend
            .write_file(id, "lost.txt", b"written on a")
            .unwrap();
        let outcome = cluster.cycle(0).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(cluster.attached_on(id), vec![a]);

        // B hears nothing for longer than the liveness timeout and asks to be promoted.
        tokio::time::sleep(SILENCE).await;
        let outcome = cluster.cycle(1).await;
        assert_eq!(outcome.promotions, vec![(id, 1)]);
        let dataset = cluster.configuration().datasets[&id].clone();
        assert_eq!((dataset.primary, dataset.replica, dataset.epoch), (b, Some(a), 1));

        // One more write lands on A after its last snapshot, just before it learns it lost.
        cluster.nodes[0]
            .backend
            .write_file(id, "late.txt", b"also written on a")
            .unwrap();

        // A sees the new epoch and unmounts without handing anything off; only then may B mount.
        cluster.cycle(0).await;
        assert!(cluster.attached_on(id).is_empty());
        cluster.cycle(1).await;
        assert_eq!(cluster.attached_on(id), vec![b]);
        cluster.nodes[1]
            .backend
            .write_file(id, "after.txt", b"written on b")
            .unwrap();
        cluster.cycle(1).await;

        // Once the partition heals, B's history wins and A keeps its own side as a stash.
        cluster.heal();
        cluster.converge(20).await;

        assert_eq!(cluster.attached_on(id), vec![b]);
        assert_eq!(
            cluster.nodes[0].backend.read_file(id, "after.txt"),
            Some(b"written on b".to_vec())
        );
        assert_eq!(cluster.nodes[0].backend.read_file(id, "lost.txt"), None);
        let stashes = cluster.nodes[0].backend.stashes().unwrap();
        assert_eq!(stashes.len(), 1);
        assert_eq!(
            cluster.nodes[0]
                .backend
                .read_stashed_file(&stashes[0], "lost.txt"),
            Some(b"written on a".to_vec())
        );
        assert_eq!(cluster.nodes[0].backend.read_file(id, "late.txt"), None);
        assert_eq!(
            cluster.nodes[0]
                .backend
                .read_stashed_file(&stashes[0], "late.txt"),
            Some(b"also written on a".to_vec())
        );
        assert_eq!(cluster.nodes[1].agent.failover().role(id), Some(Role::Master));
        assert_eq!(cluster.nodes[0].agent.failover().role(id), Some(Role::Slave));
    }

    #[tokio::test]
    async fn replica_cut_off_from_everything_does_not_promote() {
        let mut cluster = TestCluster::with_failover(2, fast_failover());
        cluster.round().await;
        let a = cluster.node_id(0);
        let id = cluster.create_dataset(0, Some(1)).await;
        cluster.converge(10).await;

        cluster.partition(0, 1);
        cluster.set_control_reachable(1, false);
        tokio::time::sleep(SILENCE).await;

        let outcome = cluster.cycle(1).await;
        assert!(outcome.promotions.is_empty());
        assert!(outcome.actions.is_empty());
        assert_eq!(cluster.configuration().datasets[&id].primary, a);
        assert_eq!(cluster.attached_on(id), vec![a]);
    }

    #[tokio::test]
    async fn isolated_primary_stops_serving() {
        let mut cluster = TestCluster::with_failover(2, fast_failover());
        cluster.round().await;
        let id = cluster.create_dataset(0, Some(1)).await;
        cluster.converge(10).await;

        cluster.partition(0, 1);
        cluster.set_control_reachable(0, false);
        tokio::time::sleep(SILENCE).await;
        cluster.cycle(0).await;

        assert!(cluster.attached_on(id).is_empty());
        assert_eq!(cluster.nodes[0].agent.failover().role(id), Some(Role::Demoting));
    }
}
