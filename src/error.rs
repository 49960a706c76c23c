//! Closed error taxonomy for the mediation pipeline.
//!
//! Every denial or failure an invocation can end with is one of these
//! variants. The dispatcher resolves each of them into exactly one terminal
//! audit event and a structured error returned to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::security::audit::EventKind;
use crate::security::sanitizer::Pattern;

#[derive(Debug, Error)]
pub enum GateError {
    /// Input matched the sanitizer deny-list.
    #[error("input rejected by sanitizer: argument '{field}' contains {}", .pattern.description())]
    SanitizationRejected { field: String, pattern: Pattern },

    /// The server's role does not allow the command or path.
    #[error("operation not permitted by policy for role '{role}': {reason}")]
    PolicyDenied { role: String, reason: String },

    /// The approval gate refused an approval-flagged operation.
    #[error("operation denied at approval gate (matched '{pattern}'): {reason}")]
    ApprovalDenied { pattern: String, reason: String },

    /// The command exceeded the configured time bound.
    #[error("operation timed out after {bound:?}")]
    Timeout { bound: Duration },

    /// Transport or process-launch failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Arguments that do not match the capability's input schema. Reported
    /// with the same wire kind as `Configuration`.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Unknown capability/server/role or inconsistent inventory data.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GateError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Stable wire name, used in responses and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SanitizationRejected { .. } => "sanitization_rejected",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::Timeout { .. } => "timeout",
            Self::Execution(_) => "execution_error",
            Self::InvalidArguments(_) | Self::Configuration(_) => "configuration_error",
        }
    }

    /// The terminal audit event this error closes an invocation with.
    pub fn terminal_event(&self) -> EventKind {
        match self {
            Self::SanitizationRejected { .. } => EventKind::DeniedSanitizer,
            Self::PolicyDenied { .. } => EventKind::DeniedPolicy,
            Self::ApprovalDenied { .. } => EventKind::DeniedApproval,
            Self::Timeout { .. } => EventKind::Timeout,
            Self::Execution(_) | Self::InvalidArguments(_) | Self::Configuration(_) => {
                EventKind::Error
            }
        }
    }

    /// Pipeline stage that produced the error, for operator-facing messages.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::SanitizationRejected { .. } => "sanitizer",
            Self::PolicyDenied { .. } => "policy",
            Self::ApprovalDenied { .. } => "approval",
            Self::Timeout { .. } | Self::Execution(_) => "execution",
            Self::InvalidArguments(_) => "validation",
            Self::Configuration(_) => "dispatch",
        }
    }
}
