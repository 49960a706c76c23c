//! Human-in-the-loop approval gate for destructive operations.
//!
//! Classification is a case-insensitive substring match against the global
//! `approval_required_patterns`, independent of role. Arbitration hands the
//! request to an operator surface and waits for a verdict keyed by
//! invocation id. In `auto_deny` mode every request is refused without
//! surfacing anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// How the gate handles approval-flagged operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Interactive,
    AutoDeny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    FreeToRun,
    /// Carries the trigger fragment that matched.
    RequiresApproval(String),
}

/// Arbitration state of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
}

impl ApprovalState {
    /// Moves `Pending` to a terminal state. Terminal states never change.
    pub fn resolve(self, approved: bool) -> Self {
        match self {
            Self::Pending if approved => Self::Approved,
            Self::Pending => Self::Denied,
            terminal => terminal,
        }
    }
}

/// What the operator is asked about.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub invocation_id: Uuid,
    pub capability: String,
    pub server: String,
    pub command: String,
    pub matched_pattern: String,
}

/// The verdict for one invocation. Never cached or reused.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub invocation_id: Uuid,
    pub approved: bool,
    pub decided_at: DateTime<Utc>,
    pub operator: Option<String>,
}

impl ApprovalDecision {
    fn new(invocation_id: Uuid, state: ApprovalState, operator: Option<String>) -> Self {
        Self {
            invocation_id,
            approved: state == ApprovalState::Approved,
            decided_at: Utc::now(),
            operator,
        }
    }
}

struct Verdict {
    approved: bool,
    operator: Option<String>,
}

/// Requests waiting for an operator, keyed by invocation id.
struct PendingApprovals {
    waiting: Mutex<HashMap<Uuid, oneshot::Sender<Verdict>>>,
    requests: mpsc::UnboundedSender<ApprovalRequest>,
}

impl PendingApprovals {
    fn waiting(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Verdict>>> {
        self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, invocation_id: Uuid, approved: bool, operator: Option<String>) -> bool {
        let sender = self.waiting().remove(&invocation_id);
        match sender {
            Some(tx) => tx.send(Verdict { approved, operator }).is_ok(),
            None => false,
        }
    }
}

/// Operator side of interactive arbitration.
///
/// The surface (terminal prompt, chat bridge, test) pulls requests with
/// `recv()` and answers each one with `resolve()`. Dropping the inbox
/// denies everything still pending.
pub struct ApprovalInbox {
    requests: mpsc::UnboundedReceiver<ApprovalRequest>,
    pending: Arc<PendingApprovals>,
}

impl ApprovalInbox {
    /// Next request awaiting a decision, or `None` once the gate is gone.
    pub async fn recv(&mut self) -> Option<ApprovalRequest> {
        self.requests.recv().await
    }

    /// Delivers a verdict. Returns false if the invocation is not pending
    /// (unknown id, or already decided).
    pub fn resolve(&self, invocation_id: Uuid, approved: bool, operator: Option<String>) -> bool {
        self.pending.resolve(invocation_id, approved, operator)
    }

    /// Handle that can resolve requests from another task.
    pub fn resolver(&self) -> ApprovalResolver {
        ApprovalResolver {
            pending: self.pending.clone(),
        }
    }
}

impl Drop for ApprovalInbox {
    fn drop(&mut self) {
        // Dropping the senders wakes every waiter with a denial.
        self.pending.waiting().clear();
    }
}

/// Cloneable resolving half of an `ApprovalInbox`.
#[derive(Clone)]
pub struct ApprovalResolver {
    pending: Arc<PendingApprovals>,
}

impl ApprovalResolver {
    pub fn resolve(&self, invocation_id: Uuid, approved: bool, operator: Option<String>) -> bool {
        self.pending.resolve(invocation_id, approved, operator)
    }
}

enum Arbitration {
    Interactive(Arc<PendingApprovals>),
    AutoDeny,
}

pub struct ApprovalGate {
    triggers: Vec<String>,
    arbitration: Arbitration,
}

impl ApprovalGate {
    /// Gate that surfaces requests to the returned inbox.
    pub fn interactive(patterns: &[String]) -> (Self, ApprovalInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingApprovals {
            waiting: Mutex::new(HashMap::new()),
            requests: tx,
        });
        let gate = Self {
            triggers: lowercase(patterns),
            arbitration: Arbitration::Interactive(pending.clone()),
        };
        (gate, ApprovalInbox { requests: rx, pending })
    }

    /// Gate that denies every approval-flagged request.
    pub fn auto_deny(patterns: &[String]) -> Self {
        Self {
            triggers: lowercase(patterns),
            arbitration: Arbitration::AutoDeny,
        }
    }

    pub fn mode(&self) -> ApprovalMode {
        match self.arbitration {
            Arbitration::Interactive(_) => ApprovalMode::Interactive,
            Arbitration::AutoDeny => ApprovalMode::AutoDeny,
        }
    }

    pub fn classify(&self, command: &str) -> Classification {
        let lowered = command.to_lowercase();
        match self
            .triggers
            .iter()
            .find(|t| !t.is_empty() && lowered.contains(t.as_str()))
        {
            Some(trigger) => {
                info!("Approval required for '{command}' (matched '{trigger}')");
                Classification::RequiresApproval(trigger.clone())
            }
            None => Classification::FreeToRun,
        }
    }

    /// Takes a `Pending` request to `Approved` or `Denied`.
    ///
    /// In interactive mode this suspends until the operator answers. There is
    /// no timeout here; the wait ends only with a verdict or with the
    /// inbox being dropped.
    pub async fn arbitrate(&self, request: ApprovalRequest) -> ApprovalDecision {
        let id = request.invocation_id;
        let state = ApprovalState::Pending;

        let pending = match &self.arbitration {
            Arbitration::AutoDeny => {
                info!("Approval auto-denied for {} ({})", request.capability, id);
                return ApprovalDecision::new(id, state.resolve(false), None);
            }
            Arbitration::Interactive(pending) => pending,
        };

        let (tx, rx) = oneshot::channel();
        pending.waiting().insert(id, tx);

        if pending.requests.send(request).is_err() {
            pending.waiting().remove(&id);
            warn!("No approval surface attached, denying {id}");
            return ApprovalDecision::new(id, state.resolve(false), None);
        }

        match rx.await {
            Ok(verdict) => {
                let decision =
                    ApprovalDecision::new(id, state.resolve(verdict.approved), verdict.operator);
                if decision.approved {
                    info!("Approval granted for {id}");
                } else {
                    info!("Approval denied for {id}");
                }
                decision
            }
            Err(_) => {
                warn!("Approval surface went away, denying {id}");
                ApprovalDecision::new(id, state.resolve(false), None)
            }
        }
    }
}

fn lowercase(patterns: &[String]) -> Vec<String> {
    patterns.iter().map(|p| p.to_lowercase()).collect()
}
