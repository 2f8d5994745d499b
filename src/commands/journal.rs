// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{Api, HandledResult},
    control::http::JournalEntryJson,
};

pub fn journal(api: &Api) -> HandledResult<()> {
    let entries: Vec<JournalEntryJson> = api.get("/v1/journal")?;
    for entry in entries {
        println!(
            "{}  {:<16} {}  {}",
            entry.timestamp,
            entry.event,
            entry.object,
            entry.comment.unwrap_or_default()
        );
    }
    Ok(())
}
