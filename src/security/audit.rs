//! Append-only JSONL audit log.
//!
//! One JSON object per line. A single writer serializes all `record()` calls,
//! stamps each event and flushes it to disk before returning, so file order
//! is the order events happened in. Nothing is ever rewritten or deleted.
//!
//! A failed write aborts the process: if an attempt cannot be recorded,
//! nothing may run.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::invocation::{ArgValue, Arguments, Invocation};

/// String inputs longer than this are truncated in the record.
const MAX_INPUT_CHARS: usize = 2000;

/// Detail messages longer than this are truncated in the record.
const MAX_DETAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Attempt,
    /// Non-terminal: records the operator decision for a flagged invocation.
    Approval,
    DeniedSanitizer,
    DeniedPolicy,
    DeniedApproval,
    Timeout,
    Error,
    Success,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Attempt | Self::Approval)
    }
}

/// A single line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub invocation_id: Uuid,
    pub event: EventKind,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub sanitized_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: EventKind, invocation: &Invocation) -> Self {
        Self {
            timestamp: Utc::now(),
            invocation_id: invocation.id,
            event: kind,
            capability: invocation.capability.clone(),
            server: invocation.server.clone(),
            role: invocation.role.clone(),
            actor: (!invocation.actor.is_empty()).then(|| invocation.actor.clone()),
            sanitized_input: input_record(&invocation.arguments),
            exit_code: None,
            error_kind: None,
            detail: None,
            duration_ms: None,
            approved: None,
            operator: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_error(mut self, kind: &str, detail: impl Into<String>) -> Self {
        self.error_kind = Some(kind.to_string());
        self.detail = Some(truncate(&detail.into(), MAX_DETAIL_CHARS));
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_decision(mut self, approved: bool, operator: Option<String>) -> Self {
        self.approved = Some(approved);
        self.operator = operator;
        self
    }
}

/// Arguments as recorded: unchanged, except oversized strings are cut.
fn input_record(arguments: &Arguments) -> Value {
    let map = arguments
        .iter()
        .map(|(k, v)| {
            let value = match v {
                ArgValue::Str(s) => Value::String(truncate(s, MAX_INPUT_CHARS)),
                ArgValue::Int(n) => Value::from(*n),
                ArgValue::Bool(b) => Value::Bool(*b),
            };
            (k.clone(), value)
        })
        .collect();
    Value::Object(map)
}

fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... (truncated, {total} chars total)")
}

/// The single audit writer.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("Audit log opened at {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `event` and syncs it to disk. The timestamp is set here,
    /// under the writer lock, so timestamps never go backwards in file order
    /// (barring wall-clock adjustments).
    pub async fn record(&self, mut event: AuditEvent) {
        let mut file = self.file.lock().await;
        event.timestamp = Utc::now();
        if let Err(e) = write_line(&mut file, &event).await {
            error!(
                "Audit log write to {} failed: {e}. Aborting.",
                self.path.display()
            );
            std::process::abort();
        }
    }

    /// Parses an audit log back into events, for review and tests.
    pub async fn read_events(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>> {
        let content = fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }
}

async fn write_line(file: &mut File, event: &AuditEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}
