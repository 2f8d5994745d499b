// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use flocker_lib::commands::{self, Cli};

/// The flocker binary is used to inspect and change the cluster configuration: "nodes",
/// "datasets move", etc.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("FLOCKER_LOG", "warn"))
        .init();

    let args = Cli::parse();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
