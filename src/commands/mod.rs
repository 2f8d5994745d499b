// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod containers;
pub mod datasets;
pub mod journal;
pub mod nodes;

use {
    containers::ContainersArgs,
    datasets::DatasetsArgs,
};

use {
    clap::{Parser, Subcommand},
    reqwest::blocking::{Client, RequestBuilder, Response},
    serde::de::DeserializeOwned,
};

use crate::control::http::{ErrorJson, VersionJson};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` intentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// The control service's management socket.
    #[arg(long, global = true)]
    pub socket: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List cluster nodes and whether they are reporting.
    Nodes,
    Datasets(DatasetsArgs),
    Containers(ContainersArgs),
    /// Print the audit journal of accepted configuration changes, oldest first.
    Journal,
    /// Print the control service's version.
    Version,
}

/// A client for the management API on the control service's unix socket.
pub struct Api {
    client: Client,
}

impl Api {
    pub fn new(cli: &Cli) -> HandledResult<Self> {
        let socket = match &cli.socket {
            Some(s) => s.clone(),
            None => crate::default_socket(),
        };
        let client = Client::builder()
            .unix_socket(socket.as_str())
            .build()
            .handle_err(|e| eprintln!("Could not create HTTP client: {e}"))?;
        Ok(Api { client })
    }

    fn url(path: &str) -> String {
        format!("http://flocker{path}")
    }

    pub fn get<T: DeserializeOwned>(&self, path: &str) -> HandledResult<T> {
        let response = self.send(self.client.get(Self::url(path)))?;
        decode(response)
    }

    pub fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> HandledResult<T> {
        let response = self.send(self.client.post(Self::url(path)).json(body))?;
        decode(response)
    }

    pub fn delete(&self, path: &str) -> HandledResult<Response> {
        self.send(self.client.delete(Self::url(path)))
    }

    /// Send a request, reporting connection failures and error statuses to stderr.
    fn send(&self, request: RequestBuilder) -> HandledResult<Response> {
        let response = request
            .send()
            .handle_err(|e| eprintln!("Error making HTTP request: {e}"))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ErrorJson>() {
            Ok(error) => eprintln!("{}", error.description),
            Err(_) => eprintln!("unexpected error: {status}"),
        }
        Err(HandledError {})
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> HandledResult<T> {
    response
        .json()
        .handle_err(|e| eprintln!("Error decoding response: {e}"))
}

/// Format a size in bytes the way the commands print it.
fn format_size(size: Option<u64>) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let Some(size) = size else {
        return "unlimited".to_string();
    };
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    let api = Api::new(cli)?;
    match &cli.command {
        Commands::Nodes => nodes::nodes(&api),
        Commands::Datasets(args) => datasets::datasets(&api, args),
        Commands::Containers(args) => containers::containers(&api, args),
        Commands::Journal => journal::journal(&api),
        Commands::Version => {
            let version: VersionJson = api.get("/v1/version")?;
            println!("{}", version.flocker);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(None), "unlimited");
        assert_eq!(format_size(Some(512)), "512 B");
        assert_eq!(format_size(Some(64 << 20)), "64.0 MiB");
        assert_eq!(format_size(Some(3 << 39)), "1.5 TiB");
    }

    #[test]
    fn move_parses() {
        let dataset = crate::model::DatasetId::new_random();
        let node = crate::model::NodeId::new_random();
        let cli = Cli::try_parse_from([
            "flocker".to_string(),
            "datasets".to_string(),
            "move".to_string(),
            dataset.to_string(),
            "--to".to_string(),
            node.to_string(),
        ])
        .unwrap();
        let Commands::Datasets(args) = cli.command else {
            panic!("expected the datasets command");
        };
        assert_eq!(
            args.command,
            datasets::DatasetCommand::Move {
                dataset_id: dataset,
                to: node
            }
        );
    }
}
