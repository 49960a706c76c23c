use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::GateError;
use crate::exec::DEFAULT_MAX_OUTPUT_BYTES;
use crate::inventory::{Inventory, RemoteEndpoint, Server};
use crate::security::allowlist::{Policy, Role};
use crate::security::approval::ApprovalMode;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    /// Bound on a single command, in seconds (1..=300)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_server: usize,
    /// Per stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            audit_log_path: default_audit_log_path(),
            approval_mode: ApprovalMode::default(),
            max_sessions_per_server: default_max_sessions(),
            max_output_bytes: default_max_output_bytes(),
            ssh_program: default_ssh_program(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Case-insensitive substrings that send a command to the approval gate
    #[serde(default)]
    pub approval_required_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RoleConfig {
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub allowed_paths_read: Vec<String>,
    #[serde(default)]
    pub allowed_paths_write: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    Local,
    #[default]
    Remote,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub role: String,
    #[serde(default)]
    pub mode: ServerMode,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub services: Vec<String>,
    pub host: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Private key for this server. Supports `~`
    pub key_path: Option<String>,
    pub known_hosts_path: Option<String>,
}

fn default_command_timeout() -> u64 {
    30
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("./logs/audit.jsonl")
}

fn default_max_sessions() -> usize {
    4
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "bastion-agent".to_string()
}

impl GateConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a config document. `${VAR}` references are
    /// expanded from the environment first.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks numeric bounds and that roles and servers build cleanly.
    pub fn validate(&self) -> Result<(), GateError> {
        let gate = &self.gate;
        if !(1..=300).contains(&gate.command_timeout_secs) {
            return Err(GateError::configuration(format!(
                "command_timeout_secs must be within 1..=300, got {}",
                gate.command_timeout_secs
            )));
        }
        if gate.max_sessions_per_server == 0 {
            return Err(GateError::configuration(
                "max_sessions_per_server must be at least 1",
            ));
        }
        if gate.max_output_bytes == 0 {
            return Err(GateError::configuration("max_output_bytes must be at least 1"));
        }
        if gate.connect_timeout_secs == 0 {
            return Err(GateError::configuration(
                "connect_timeout_secs must be at least 1",
            ));
        }
        if gate.ssh_program.trim().is_empty() {
            return Err(GateError::configuration("ssh_program must not be empty"));
        }
        let policy = self.build_policy()?;
        self.build_inventory(&policy)?;
        Ok(())
    }

    /// Compiles the role table and approval triggers.
    pub fn build_policy(&self) -> Result<Policy, GateError> {
        let roles = self
            .roles
            .iter()
            .map(|(name, role)| {
                Role::new(
                    name.clone(),
                    role.allowed_commands.clone(),
                    role.allowed_paths_read.clone(),
                    role.allowed_paths_write.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Policy::new(
            roles,
            self.policy.approval_required_patterns.clone(),
        ))
    }

    /// Builds the server inventory. Every server must reference a role in
    /// `policy`, and remote servers need a host and a key.
    pub fn build_inventory(&self, policy: &Policy) -> Result<Inventory, GateError> {
        let mut servers = Vec::with_capacity(self.servers.len());
        for (name, def) in &self.servers {
            if name.is_empty() || !name.chars().all(valid_name_char) {
                return Err(GateError::configuration(format!(
                    "invalid server name '{name}'"
                )));
            }
            if !policy.has_role(&def.role) {
                return Err(GateError::configuration(format!(
                    "server '{name}' references unknown role '{}'",
                    def.role
                )));
            }
            let mut server = match def.mode {
                ServerMode::Local => Server::local(name.clone(), def.role.clone()),
                ServerMode::Remote => {
                    Server::remote(name.clone(), def.role.clone(), remote_endpoint(name, def)?)
                }
            };
            server.description = def.description.clone();
            server.services = def.services.clone();
            servers.push(server);
        }
        Ok(Inventory::new(servers))
    }
}

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | ':' | '-')
}

fn remote_endpoint(name: &str, def: &ServerConfig) -> Result<RemoteEndpoint, GateError> {
    let host = def
        .host
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| GateError::configuration(format!("remote server '{name}' has no host")))?;
    let key_path = def
        .key_path
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            GateError::configuration(format!("remote server '{name}' has no key_path"))
        })?;
    Ok(RemoteEndpoint {
        host: host.to_string(),
        port: def.port,
        user: def.user.clone(),
        key_path: expand_path(key_path),
        known_hosts_path: def.known_hosts_path.as_deref().map(expand_path),
    })
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}
