pub mod builtin;
pub mod registry;
pub mod schema;

use crate::error::GateError;
use crate::invocation::Arguments;
use crate::inventory::Inventory;

pub use registry::{
    CapabilityOutput, CapabilityRegistry, Executors, InvocationRequest, InvocationResponse,
};
pub use schema::{Charset, FieldKind, FieldSpec, InputSchema};

/// Whether a capability can change state on the target, independent of role.
///
/// Exported with the schemas for the decision-maker. Roles and approval
/// patterns still decide what runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ReadOnly,
    Mutating,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Mutating => "mutating",
        }
    }
}

/// What the dispatcher should do for an invocation, after planning.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Run `command` on `server`, checked against the command allowlist.
    Run { server: String, command: String },
    /// Read the first `lines` lines of `path`, checked against the role's
    /// read prefixes.
    Read {
        server: String,
        path: String,
        lines: i64,
    },
    /// Answer produced in-process; nothing is executed.
    Report(String),
}

impl Action {
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Run { server, .. } | Self::Read { server, .. } => Some(server),
            Self::Report(_) => None,
        }
    }

    /// The command line the executor will run, if any.
    pub fn command_text(&self) -> Option<String> {
        match self {
            Self::Run { command, .. } => Some(command.clone()),
            Self::Read { path, lines, .. } => Some(format!(
                "head -n {lines} {}",
                shell_words::quote(path)
            )),
            Self::Report(_) => None,
        }
    }
}

/// A named action the decision-maker may request.
///
/// Capabilities never execute anything. They turn validated arguments into
/// an `Action`, and the registry runs that action through the pipeline.
pub trait Capability: Send + Sync {
    /// Unique identifier, lowercase with underscores (e.g. "docker_ps").
    fn name(&self) -> &str;

    /// Shown to the decision-maker so it knows when to use the capability.
    fn description(&self) -> &str;

    fn input_schema(&self) -> InputSchema;

    fn effect(&self) -> Effect;

    /// Server the invocation targets, read from raw arguments. Used to
    /// annotate audit records before validation.
    fn target(&self, arguments: &Arguments) -> Option<String> {
        arguments
            .get("server")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Builds the action from arguments already validated against
    /// `input_schema()`, defaults included.
    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError>;
}

/// Fetches a string argument the schema guarantees.
pub(crate) fn str_arg<'a>(arguments: &'a Arguments, name: &str) -> Result<&'a str, GateError> {
    arguments
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GateError::configuration(format!("missing required argument '{name}'")))
}

pub(crate) fn int_arg(arguments: &Arguments, name: &str) -> Result<i64, GateError> {
    arguments
        .get(name)
        .and_then(|v| v.as_int())
        .ok_or_else(|| GateError::configuration(format!("missing required argument '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_action_renders_head() {
        let action = Action::Read {
            server: "web-01".to_string(),
            path: "/var/log/syslog".to_string(),
            lines: 20,
        };
        assert_eq!(action.server(), Some("web-01"));
        assert_eq!(
            action.command_text().as_deref(),
            Some("head -n 20 /var/log/syslog")
        );
    }

    #[test]
    fn test_report_has_no_command() {
        let action = Action::Report("ok".to_string());
        assert_eq!(action.server(), None);
        assert_eq!(action.command_text(), None);
    }
}
