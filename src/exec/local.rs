//! Local execution: the command is split into an argument vector and run
//! directly. No shell is involved, so `;`, `|` or `$VAR` reaching this point
//! are passed to the program as literal bytes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{run_bounded, CommandResult, ExecError, Executor, DEFAULT_MAX_OUTPUT_BYTES};
use crate::inventory::Server;

pub struct LocalExecutor {
    max_output_bytes: usize,
}

impl LocalExecutor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

/// Splits `command` with POSIX-shell quoting rules into program and arguments.
pub fn tokenize(command: &str) -> Result<Vec<String>, ExecError> {
    let argv = shell_words::split(command)
        .map_err(|e| ExecError::Failed(format!("cannot parse command: {e}")))?;
    if argv.is_empty() {
        return Err(ExecError::Failed("empty command".to_string()));
    }
    Ok(argv)
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(
        &self,
        server: &Server,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        if server.is_remote() {
            return Err(ExecError::Failed(format!(
                "server '{}' is remote, not local",
                server.name
            )));
        }
        let argv = tokenize(command)?;
        debug!("Local exec on {}: {:?}", server.name, argv);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        run_bounded(cmd, &argv[0], &server.name, timeout, self.max_output_bytes).await
    }
}
