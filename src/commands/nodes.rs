// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{Api, HandledResult},
    control::NodeInfo,
};

pub fn nodes(api: &Api) -> HandledResult<()> {
    let nodes: Vec<NodeInfo> = api.get("/v1/state/nodes")?;
    for node in nodes {
        let last_report = node
            .last_report
            .map_or("never".to_string(), |at| at.to_rfc3339());
        println!(
            "{}  {:<24} {:<6} last report: {last_report}",
            node.node_id,
            node.address,
            if node.live { "live" } else { "DOWN" },
        );
    }
    Ok(())
}
