//! Remote execution over the system OpenSSH client.
//!
//! The remote shell interprets the command string, so the sanitizer is the
//! only guard against metacharacters on this path. Each server gets a fixed
//! number of concurrent sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{run_bounded, CommandResult, ExecError, Executor, DEFAULT_MAX_OUTPUT_BYTES};
use crate::inventory::{Connection, Inventory, RemoteEndpoint, Server};

/// ssh reserves this exit status for its own errors.
const SSH_TRANSPORT_FAILURE: i32 = 255;

pub struct RemoteExecutor {
    ssh_program: String,
    connect_timeout: Duration,
    max_output_bytes: usize,
    sessions: HashMap<String, Arc<Semaphore>>,
}

impl RemoteExecutor {
    /// One session pool per remote server in `inventory`.
    pub fn new(inventory: &Inventory, max_sessions_per_server: usize) -> Self {
        let permits = max_sessions_per_server.max(1);
        let sessions = inventory
            .servers()
            .filter(|s| s.is_remote())
            .map(|s| (s.name.clone(), Arc::new(Semaphore::new(permits))))
            .collect();
        Self {
            ssh_program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            sessions,
        }
    }

    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Arguments passed to the ssh client, command last.
    pub fn ssh_args(&self, endpoint: &RemoteEndpoint, command: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            endpoint.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
        ];
        if let Some(known_hosts) = &endpoint.known_hosts_path {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            endpoint.port.to_string(),
            format!("{}@{}", endpoint.user, endpoint.host),
            "--".to_string(),
            command.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn run(
        &self,
        server: &Server,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let Connection::Remote(endpoint) = &server.connection else {
            return Err(ExecError::Failed(format!(
                "server '{}' is local, not remote",
                server.name
            )));
        };
        if !endpoint.key_path.is_file() {
            return Err(ExecError::Failed(format!(
                "SSH key for '{}' not found at {}",
                server.name,
                endpoint.key_path.display()
            )));
        }
        let pool = self.sessions.get(&server.name).ok_or_else(|| {
            ExecError::Failed(format!("no session pool for server '{}'", server.name))
        })?;

        let started = Instant::now();
        let _permit = match tokio::time::timeout(timeout, pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ExecError::Failed("session pool closed".to_string())),
            Err(_) => {
                warn!("No free session to {} within {}s", server.name, timeout.as_secs());
                return Err(ExecError::Timeout(timeout));
            }
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(ExecError::Timeout(timeout));
        }

        debug!("Remote exec on {} ({}): {command}", server.name, endpoint.host);
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(self.ssh_args(endpoint, command));

        let mut result = run_bounded(
            cmd,
            &self.ssh_program,
            &server.name,
            remaining,
            self.max_output_bytes,
        )
        .await
        .map_err(|e| match e {
            ExecError::Timeout(_) => ExecError::Timeout(timeout),
            other => other,
        })?;

        if result.exit_code == SSH_TRANSPORT_FAILURE {
            let reason = if result.stderr.is_empty() {
                "connection failed".to_string()
            } else {
                std::mem::take(&mut result.stderr)
            };
            return Err(ExecError::Failed(format!(
                "ssh to {} ({}) failed: {reason}",
                server.name, endpoint.host
            )));
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}
