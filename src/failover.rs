// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The failover coordinator for datasets with a replica.
//!
//! Each node that holds a copy of a failover dataset runs one `Coordinator` for it. The two
//! coordinators of a pair exchange `PeerStatus` messages; silence for longer than the liveness
//! timeout and an explicit "unhealthy" status are the same event, the peer becoming unavailable.
//!
//! The coordinator never mounts anything itself. It decides when to ask the control service to
//! promote this node (the promotion only takes effect once it is recorded in the configuration
//! with a higher epoch) and whether this node may currently serve the dataset, which the deployer
//! honours.
//!
//! Whether a node may act alone is decided by a `Quorum`. Two nodes cannot form a majority on
//! their own, so the control service acts as the third voter: a slave may only promote itself if
//! it can still reach the control service, and a master that can reach neither its peer nor the
//! control service stops serving.

use std::{
    collections::BTreeSet,
    fmt,
    time::{Duration, Instant},
};

use {
    log::{info, warn},
    serde::{Deserialize, Serialize},
};

use crate::model::{DatasetId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Mounts the dataset read-write and runs its workload.
    Master,
    /// Receives replication and stands by.
    Slave,
    /// Taking over: promotion requested or recorded, but not yet mounted.
    Promoting,
    /// Giving up the dataset: must stop serving and detach.
    Demoting,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Role::Master => "master",
                Role::Slave => "slave",
                Role::Promoting => "promoting",
                Role::Demoting => "demoting",
            }
        )
    }
}

/// The heartbeat exchanged between the two nodes of a failover pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub node_id: NodeId,
    /// Whether the sender's storage backend is answering.
    pub storage_healthy: bool,
    /// Whether the sender currently has a working connection to the control service.
    pub control_reachable: bool,
    /// The datasets the sender is currently serving.
    pub masters: BTreeSet<DatasetId>,
}

/// Decides whether the members of a replica set that can still talk to each other may act.
pub trait Quorum: Send + Sync {
    /// `reachable` counts the voters this node can reach, itself included.
    fn has_quorum(&self, reachable: usize) -> bool;
}

/// A primary, one replica and the control service as witness.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoNodeQuorum;

impl TwoNodeQuorum {
    pub const VOTERS: usize = 3;
}

impl Quorum for TwoNodeQuorum {
    fn has_quorum(&self, reachable: usize) -> bool {
        reachable * 2 > Self::VOTERS
    }
}

/// What the coordinator knows about the rest of the world when it takes a step.
#[derive(Debug, Clone)]
pub struct LocalView {
    /// The primary according to the latest configuration this node has.
    pub primary: NodeId,
    pub epoch: u64,
    /// Whether the local copy is mounted read-write.
    pub attached: bool,
    /// Whether there is a local copy with at least one snapshot to take over from.
    pub has_copy: bool,
    pub control_reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Ask the control service to record this node as primary at `epoch`.
    RequestPromotion { epoch: u64 },
}

#[derive(Debug)]
pub struct Coordinator<Q: Quorum> {
    dataset_id: DatasetId,
    local: NodeId,
    peer: NodeId,
    role: Role,
    quorum: Q,
    liveness_timeout: Duration,
    last_heard: Instant,
    peer_healthy: bool,
    /// The peer's last status listed this dataset among the ones it serves.
    peer_serving: bool,
    /// Promoting, but the peer is reachable and still serving: do not mount yet.
    held: bool,
}

impl<Q: Quorum> Coordinator<Q> {
    /// The peer is given a full liveness timeout from `now` before its silence counts.
    pub fn new(
        dataset_id: DatasetId,
        local: NodeId,
        peer: NodeId,
        primary: NodeId,
        quorum: Q,
        liveness_timeout: Duration,
        now: Instant,
    ) -> Self {
        Coordinator {
            dataset_id,
            local,
            peer,
            role: if primary == local {
                Role::Master
            } else {
                Role::Slave
            },
            quorum,
            liveness_timeout,
            last_heard: now,
            peer_healthy: true,
            peer_serving: false,
            held: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Whether the deployer may keep (or put) the dataset mounted on this node.
    pub fn may_serve(&self) -> bool {
        match self.role {
            Role::Master => true,
            Role::Promoting => !self.held,
            Role::Slave | Role::Demoting => false,
        }
    }

    /// The peer was replaced in the configuration.
    pub fn set_peer(&mut self, peer: NodeId, now: Instant) {
        if peer != self.peer {
            self.peer = peer;
            self.last_heard = now;
            self.peer_healthy = true;
            self.peer_serving = false;
        }
    }

    /// A status message arrived from the peer.
    pub fn observe(&mut self, status: &PeerStatus, now: Instant) {
        if status.node_id != self.peer {
            return;
        }
        self.last_heard = now;
        if self.peer_healthy && !status.storage_healthy {
            warn!(
                "dataset={} peer={} reports unhealthy storage",
                self.dataset_id, self.peer
            );
        }
        self.peer_healthy = status.storage_healthy;
        self.peer_serving = status.masters.contains(&self.dataset_id);
    }

    pub fn peer_available(&self, now: Instant) -> bool {
        self.peer_healthy && now.saturating_duration_since(self.last_heard) < self.liveness_timeout
    }

    fn transition(&mut self, role: Role) {
        if role != self.role {
            info!(
                "dataset={} node={} failover role {} -> {}",
                self.dataset_id, self.local, self.role, role
            );
            self.role = role;
        }
    }

    pub fn step(&mut self, view: &LocalView, now: Instant) -> Option<Decision> {
        let decision = self.decide(view, now);
        self.hold_while_peer_serves(self.peer_available(now));
        decision
    }

    fn decide(&mut self, view: &LocalView, now: Instant) -> Option<Decision> {
        let peer_available = self.peer_available(now);
        let reachable = 1 + usize::from(peer_available) + usize::from(view.control_reachable);
        let has_quorum = self.quorum.has_quorum(reachable);
        let configured_here = view.primary == self.local;

        match self.role {
            Role::Slave => {
                if configured_here && has_quorum {
                    self.transition(Role::Promoting);
                } else if !configured_here
                    && !peer_available
                    && view.has_copy
                    && view.control_reachable
                    && has_quorum
                {
                    self.transition(Role::Promoting);
                    return Some(Decision::RequestPromotion {
                        epoch: view.epoch + 1,
                    });
                }
            }
            Role::Promoting => {
                if configured_here {
                    if view.attached {
                        self.transition(Role::Master);
                    }
                } else if peer_available || !has_quorum {
                    self.transition(Role::Slave);
                } else {
                    // Not recorded yet: the request was lost or refused. Keep asking.
                    return Some(Decision::RequestPromotion {
                        epoch: view.epoch + 1,
                    });
                }
            }
            Role::Master => {
                if !configured_here || !has_quorum {
                    if !has_quorum {
                        warn!(
                            "dataset={} node={} lost both its peer and the control service",
                            self.dataset_id, self.local
                        );
                    }
                    self.transition(Role::Demoting);
                }
            }
            Role::Demoting => {
                if !view.attached {
                    self.transition(Role::Slave);
                }
            }
        }
        None
    }

    fn hold_while_peer_serves(&mut self, peer_available: bool) {
        let held = self.role == Role::Promoting && peer_available && self.peer_serving;
        if held && !self.held {
            info!(
                "dataset={} node={} waiting for peer={} to stop serving",
                self.dataset_id, self.local, self.peer
            );
        }
        self.held = held;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Pair {
        dataset: DatasetId,
        a: NodeId,
        b: NodeId,
        start: Instant,
    }

    impl Pair {
        fn new() -> Self {
            Pair {
                dataset: DatasetId::new_random(),
                a: NodeId::new_random(),
                b: NodeId::new_random(),
                start: Instant::now(),
            }
        }

        fn coordinator(&self, local: NodeId, peer: NodeId) -> Coordinator<TwoNodeQuorum> {
            Coordinator::new(
                self.dataset,
                local,
                peer,
                self.a,
                TwoNodeQuorum,
                TIMEOUT,
                self.start,
            )
        }

        fn status(&self, node: NodeId, healthy: bool) -> PeerStatus {
            PeerStatus {
                node_id: node,
                storage_healthy: healthy,
                control_reachable: true,
                masters: BTreeSet::new(),
            }
        }

        fn at(&self, secs: u64) -> Instant {
            self.start + Duration::from_secs(secs)
        }
    }

    fn view(primary: NodeId, epoch: u64, attached: bool, control: bool) -> LocalView {
        LocalView {
            primary,
            epoch,
            attached,
            has_copy: true,
            control_reachable: control,
        }
    }

    #[test]
    fn quorum_needs_two_of_three() {
        assert!(!TwoNodeQuorum.has_quorum(1));
        assert!(TwoNodeQuorum.has_quorum(2));
        assert!(TwoNodeQuorum.has_quorum(3));
    }

    #[test]
    fn silent_master_is_replaced() {
        let pair = Pair::new();
        let mut slave = pair.coordinator(pair.b, pair.a);
        assert_eq!(slave.role(), Role::Slave);

        slave.observe(&pair.status(pair.a, true), pair.at(10));
        assert_eq!(slave.step(&view(pair.a, 0, false, true), pair.at(20)), None);
        assert_eq!(slave.role(), Role::Slave);

        // Silence past the timeout: promotion is requested at the next epoch.
        assert_eq!(
            slave.step(&view(pair.a, 0, false, true), pair.at(41)),
            Some(Decision::RequestPromotion { epoch: 1 })
        );
        assert_eq!(slave.role(), Role::Promoting);
        assert!(slave.may_serve());

        // Recorded, then mounted.
        assert_eq!(slave.step(&view(pair.b, 1, false, true), pair.at(42)), None);
        assert_eq!(slave.role(), Role::Promoting);
        slave.step(&view(pair.b, 1, true, true), pair.at(43));
        assert_eq!(slave.role(), Role::Master);
    }

    #[test]
    fn unhealthy_status_counts_as_unavailable() {
        let pair = Pair::new();
        let mut slave = pair.coordinator(pair.b, pair.a);

        slave.observe(&pair.status(pair.a, false), pair.at(1));

        assert!(!slave.peer_available(pair.at(2)));
        assert!(slave.step(&view(pair.a, 0, false, true), pair.at(2)).is_some());
    }

    #[test]
    fn isolated_slave_does_not_promote() {
        let pair = Pair::new();
        let mut slave = pair.coordinator(pair.b, pair.a);

        assert_eq!(slave.step(&view(pair.a, 0, false, false), pair.at(100)), None);
        assert_eq!(slave.role(), Role::Slave);
    }

    #[test]
    fn isolated_master_stops_serving_until_connectivity_returns() {
        let pair = Pair::new();
        let mut master = pair.coordinator(pair.a, pair.b);
        assert!(master.may_serve());

        master.step(&view(pair.a, 0, true, false), pair.at(100));
        assert_eq!(master.role(), Role::Demoting);
        assert!(!master.may_serve());

        master.step(&view(pair.a, 0, false, false), pair.at(101));
        assert_eq!(master.role(), Role::Slave);
        master.step(&view(pair.a, 0, false, false), pair.at(102));
        assert_eq!(master.role(), Role::Slave);

        // The control service is back and still names this node: resume.
        master.step(&view(pair.a, 0, false, true), pair.at(103));
        assert_eq!(master.role(), Role::Promoting);
        master.step(&view(pair.a, 0, true, true), pair.at(104));
        assert_eq!(master.role(), Role::Master);
    }

    #[test]
    fn returning_master_demotes_after_promotion_elsewhere() {
        let pair = Pair::new();
        let mut old = pair.coordinator(pair.a, pair.b);

        old.observe(&pair.status(pair.b, true), pair.at(1));
        old.step(&view(pair.b, 1, true, true), pair.at(2));
        assert_eq!(old.role(), Role::Demoting);

        old.step(&view(pair.b, 1, false, true), pair.at(3));
        assert_eq!(old.role(), Role::Slave);
        old.observe(&pair.status(pair.b, true), pair.at(4));
        assert_eq!(old.step(&view(pair.b, 1, false, true), pair.at(5)), None);
        assert_eq!(old.role(), Role::Slave);
    }

    #[test]
    fn promoted_node_waits_until_the_peer_stops_serving() {
        let pair = Pair::new();
        let mut new = pair.coordinator(pair.b, pair.a);
        let mut serving = pair.status(pair.a, true);
        serving.masters.insert(pair.dataset);

        // The configuration moved the dataset to b while a still serves it.
        new.observe(&serving, pair.at(1));
        new.step(&view(pair.b, 1, false, true), pair.at(2));
        assert_eq!(new.role(), Role::Promoting);
        assert!(!new.may_serve());

        new.observe(&pair.status(pair.a, true), pair.at(3));
        new.step(&view(pair.b, 1, false, true), pair.at(4));
        assert!(new.may_serve());
        new.step(&view(pair.b, 1, true, true), pair.at(5));
        assert_eq!(new.role(), Role::Master);
    }

    #[test]
    fn silent_peer_does_not_hold_a_promotion() {
        let pair = Pair::new();
        let mut slave = pair.coordinator(pair.b, pair.a);
        let mut serving = pair.status(pair.a, true);
        serving.masters.insert(pair.dataset);

        slave.observe(&serving, pair.at(1));
        assert!(slave.step(&view(pair.a, 0, false, true), pair.at(40)).is_some());
        assert_eq!(slave.role(), Role::Promoting);
        assert!(slave.may_serve());
    }

    #[test]
    fn promotion_is_abandoned_when_the_master_reappears() {
        let pair = Pair::new();
        let mut slave = pair.coordinator(pair.b, pair.a);

        assert!(slave.step(&view(pair.a, 0, false, true), pair.at(31)).is_some());
        slave.observe(&pair.status(pair.a, true), pair.at(32));
        assert_eq!(slave.step(&view(pair.a, 0, false, true), pair.at(33)), None);
        assert_eq!(slave.role(), Role::Slave);
    }
}
