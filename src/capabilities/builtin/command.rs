use crate::capabilities::{str_arg, Action, Capability, Charset, Effect, FieldSpec, InputSchema};
use crate::error::GateError;
use crate::invocation::Arguments;
use crate::inventory::{Inventory, LOCAL_SERVER};

/// Runs a command on the bastion itself.
pub struct RunLocalCommand;

impl Capability for RunLocalCommand {
    fn name(&self) -> &str {
        "run_local_command"
    }

    fn description(&self) -> &str {
        "Run a command on the bastion host. The command must match the bastion \
         role's allowlist. It is executed directly, without a shell: pipes, \
         redirections and chaining are not available."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![FieldSpec::string(
            "command",
            "The command line to run, e.g. 'df -h'.",
        )])
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    fn target(&self, _arguments: &Arguments) -> Option<String> {
        Some(LOCAL_SERVER.to_string())
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(LOCAL_SERVER)?;
        if server.is_remote() {
            return Err(GateError::configuration(format!(
                "server '{LOCAL_SERVER}' must be local"
            )));
        }
        Ok(Action::Run {
            server: server.name.clone(),
            command: str_arg(arguments, "command")?.to_string(),
        })
    }
}

/// Runs a command on a remote server over SSH.
pub struct RunRemoteCommand;

impl Capability for RunRemoteCommand {
    fn name(&self) -> &str {
        "run_remote_command"
    }

    fn description(&self) -> &str {
        "Run a command on a remote server over SSH. The command must match the \
         server role's allowlist. Use list_servers to see available servers."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec::string("server", "Server name from the inventory.")
                .charset(Charset::Token),
            FieldSpec::string("command", "The command line to run on the server."),
        ])
    }

    fn effect(&self) -> Effect {
        Effect::Mutating
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(str_arg(arguments, "server")?)?;
        if !server.is_remote() {
            return Err(GateError::configuration(format!(
                "server '{}' is local; use run_local_command",
                server.name
            )));
        }
        Ok(Action::Run {
            server: server.name.clone(),
            command: str_arg(arguments, "command")?.to_string(),
        })
    }
}
