//! The checks every invocation passes before anything runs.

pub mod allowlist;
pub mod approval;
pub mod audit;
pub mod sanitizer;

pub use allowlist::{is_path_allowed, is_permitted, PathMode, Policy, Role};
pub use approval::{ApprovalGate, ApprovalInbox, ApprovalMode, ApprovalRequest, Classification};
pub use audit::{AuditEvent, AuditLog, EventKind};
