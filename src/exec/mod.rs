//! Execution engine: runs an approved command on its target server.
//!
//! Local and remote execution are two implementations of one `Executor`
//! contract: same signature, same timeout and teardown guarantees. A
//! non-zero exit status is a normal result; only launch and transport
//! failures are errors.

pub mod local;
pub mod remote;

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::GateError;
use crate::inventory::Server;

pub use local::LocalExecutor;
pub use remote::RemoteExecutor;

/// Default cap on captured stdout/stderr, per stream (100KB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 100_000;

/// Minimum time left to drain the pipes after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub server: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
}

impl From<ExecError> for GateError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Timeout(bound) => GateError::Timeout { bound },
            ExecError::Failed(msg) => GateError::Execution(msg),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` on `server`, bounded by `timeout`. On expiry the
    /// process (or session channel) is killed before `Timeout` is returned.
    async fn run(
        &self,
        server: &Server,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;
}

/// Spawns `cmd` in its own process group and waits for it, killing the
/// whole group if `timeout` expires first. The bound covers collecting the
/// output too.
pub(crate) async fn run_bounded(
    mut cmd: Command,
    program: &str,
    server: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<CommandResult, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| launch_error(program, e))?;
    let group = child.id();

    let mut stdout = spawn_reader(child.stdout.take(), max_output_bytes);
    let mut stderr = spawn_reader(child.stderr.take(), max_output_bytes);

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map_err(|e| ExecError::Failed(format!("waiting for {program}: {e}")))?,
        Err(_) => {
            kill_group(group);
            let _ = child.kill().await;
            stdout.abort();
            stderr.abort();
            return Err(ExecError::Timeout(timeout));
        }
    };
    // Leftover group members would hold the pipes open.
    kill_group(group);

    // A descendant that left the group (setsid, daemons) is out of reach of
    // killpg and can keep the pipes open, so draining shares the bound.
    let remaining = timeout.saturating_sub(started.elapsed()).max(DRAIN_GRACE);
    let drained = tokio::time::timeout(remaining, async {
        (
            (&mut stdout).await.unwrap_or_default(),
            (&mut stderr).await.unwrap_or_default(),
        )
    })
    .await;
    let (stdout, stderr) = match drained {
        Ok(output) => output,
        Err(_) => {
            stdout.abort();
            stderr.abort();
            warn!("{program} exited but a detached process kept its output open past {timeout:?}");
            return Err(ExecError::Timeout(timeout));
        }
    };

    Ok(CommandResult {
        stdout: stdout.trim_end().to_string(),
        stderr: stderr.trim_end().to_string(),
        exit_code: status.code().unwrap_or(-1),
        duration_ms: started.elapsed().as_millis() as u64,
        server: server.to_string(),
    })
}

fn kill_group(group: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = group {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = group;
}

fn spawn_reader<R>(pipe: Option<R>, max_bytes: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        truncate_output(&buf, max_bytes)
    })
}

/// Lossy UTF-8 decode, cut at `max_bytes` on a character boundary.
pub(crate) fn truncate_output(bytes: &[u8], max_bytes: usize) -> String {
    if bytes.len() <= max_bytes {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut end = max_bytes;
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    format!(
        "{}...\n[Output truncated, {} bytes total]",
        String::from_utf8_lossy(&bytes[..end]),
        bytes.len()
    )
}

fn launch_error(program: &str, e: std::io::Error) -> ExecError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ExecError::Failed(format!("command not found: {program}")),
        std::io::ErrorKind::PermissionDenied => {
            ExecError::Failed(format!("permission denied: {program}"))
        }
        _ => ExecError::Failed(format!("cannot start {program}: {e}")),
    }
}
