// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod agent;
pub mod backend;
pub mod commands;
pub mod config;
pub mod container;
pub mod control;
pub mod error;
pub mod failover;
pub mod journal;
pub mod model;
pub mod protocol;
pub mod replication;
pub mod test_env;
pub mod tls;

/// Gets the port that the control service accepts agent connections on.
pub fn control_port() -> u16 {
    match std::env::var("FLOCKER_CONTROL_PORT") {
        Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
            log::warn!("FLOCKER_CONTROL_PORT is not a valid port number: '{port}'");
            4524
        }),
        Err(_) => 4524,
    }
}

/// Gets the port that agents accept replication connections from their peers on.
pub fn peer_port() -> u16 {
    match std::env::var("FLOCKER_PEER_PORT") {
        Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
            log::warn!("FLOCKER_PEER_PORT is not a valid port number: '{port}'");
            4525
        }),
        Err(_) => 4525,
    }
}

pub fn default_socket() -> String {
    match std::env::var("FLOCKER_SOCKET") {
        Ok(sock) => sock,
        Err(_) => "/var/run/flocker/control.socket".to_string(),
    }
}

pub fn default_agent_config_path() -> String {
    match std::env::var("FLOCKER_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/flocker/agent.yml".to_string(),
    }
}

pub fn default_control_config_path() -> String {
    match std::env::var("FLOCKER_CONTROL_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/flocker/control.toml".to_string(),
    }
}

/// Where an agent persists its node identifier when `agent.yml` does not fix one.
pub fn default_node_uuid_path() -> String {
    match std::env::var("FLOCKER_NODE_UUID") {
        Ok(path) => path,
        Err(_) => "/var/lib/flocker/node.uuid".to_string(),
    }
}

pub fn default_state_path() -> String {
    match std::env::var("FLOCKER_STATE") {
        Ok(path) => path,
        Err(_) => "/var/lib/flocker/current_configuration.json".to_string(),
    }
}

pub fn default_journal_path() -> String {
    match std::env::var("FLOCKER_JOURNAL") {
        Ok(path) => path,
        Err(_) => "/var/lib/flocker/configuration.journal".to_string(),
    }
}

pub fn default_server_cert() -> String {
    match std::env::var("FLOCKER_SERVER_CERT") {
        Ok(cert) => cert,
        Err(_) => "/etc/flocker/control-service.crt".to_string(),
    }
}

pub fn default_server_key() -> String {
    match std::env::var("FLOCKER_SERVER_KEY") {
        Ok(key) => key,
        Err(_) => "/etc/flocker/control-service.key".to_string(),
    }
}

pub fn default_client_cert() -> String {
    match std::env::var("FLOCKER_CLIENT_CERT") {
        Ok(cert) => cert,
        Err(_) => "/etc/flocker/node.crt".to_string(),
    }
}

pub fn default_client_key() -> String {
    match std::env::var("FLOCKER_CLIENT_KEY") {
        Ok(key) => key,
        Err(_) => "/etc/flocker/node.key".to_string(),
    }
}

pub fn default_ca_cert() -> String {
    match std::env::var("FLOCKER_CA_CERT") {
        Ok(cert) => cert,
        Err(_) => "/etc/flocker/cluster.crt".to_string(),
    }
}

/// The DNS name that TLS connections expect the control service (and peer agents) to present in
/// their certificates.
pub fn default_server_name() -> String {
    match std::env::var("FLOCKER_SERVER_NAME") {
        Ok(name) => name,
        Err(_) => "control-service".to_string(),
    }
}
