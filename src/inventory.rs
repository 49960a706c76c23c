//! Server inventory: frozen lookup table of execution targets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::GateError;

/// Name of the bastion itself, the target of `run_local_command`.
pub const LOCAL_SERVER: &str = "localhost";

/// Connection details for a server reached over SSH.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// The server's dedicated private key. Only the path is ever held.
    pub key_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Connection {
    Local,
    Remote(RemoteEndpoint),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub name: String,
    pub role: String,
    pub connection: Connection,
    pub description: String,
    pub services: Vec<String>,
}

impl Server {
    pub fn local(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            connection: Connection::Local,
            description: String::new(),
            services: Vec::new(),
        }
    }

    pub fn remote(name: impl Into<String>, role: impl Into<String>, endpoint: RemoteEndpoint) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            connection: Connection::Remote(endpoint),
            description: String::new(),
            services: Vec::new(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.connection, Connection::Remote(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    servers: BTreeMap<String, Server>,
}

impl Inventory {
    pub fn new(servers: Vec<Server>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Server, GateError> {
        self.servers.get(name).ok_or_else(|| {
            GateError::configuration(format!(
                "unknown server: '{name}'. Available: {}",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Human-readable listing for the decision-maker.
    pub fn summary(&self) -> String {
        if self.servers.is_empty() {
            return "No servers in inventory.".to_string();
        }
        let mut lines = Vec::new();
        for server in self.servers.values() {
            if server.description.is_empty() {
                lines.push(format!("- {} ({})", server.name, server.role));
            } else {
                lines.push(format!("- {} ({}): {}", server.name, server.role, server.description));
            }
            match &server.connection {
                Connection::Local => lines.push("  Local execution".to_string()),
                Connection::Remote(ep) => {
                    lines.push(format!("  Host: {}:{} | User: {}", ep.host, ep.port, ep.user))
                }
            }
            if !server.services.is_empty() {
                lines.push(format!("  Services: {}", server.services.join(", ")));
            }
        }
        lines.join("\n")
    }
}
