// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use flocker_lib::agent::{self, Cli};

fn main() {
    let args = Cli::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("FLOCKER_LOG", default_level),
    )
    .init();

    if agent::main(args).is_err() {
        std::process::exit(1);
    }
}
