use crate::capabilities::{
    int_arg, str_arg, Action, Capability, Charset, Effect, FieldSpec, InputSchema,
};
use crate::error::GateError;
use crate::invocation::{ArgValue, Arguments};
use crate::inventory::Inventory;

pub struct ServiceStatus;

impl Capability for ServiceStatus {
    fn name(&self) -> &str {
        "service_status"
    }

    fn description(&self) -> &str {
        "Check the status of a systemd service on a server."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec::string("server", "Server name from the inventory.")
                .charset(Charset::Token),
            FieldSpec::string("service", "Systemd service name (e.g. 'docker', 'nginx').")
                .charset(Charset::Token),
        ])
    }

    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(str_arg(arguments, "server")?)?;
        Ok(Action::Run {
            server: server.name.clone(),
            command: format!("systemctl status {}", str_arg(arguments, "service")?),
        })
    }
}

pub struct ServiceJournal;

impl Capability for ServiceJournal {
    fn name(&self) -> &str {
        "service_journal"
    }

    fn description(&self) -> &str {
        "Read the systemd journal for a service on a server. Optionally limit \
         by number of lines or time range."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec::string("server", "Server name from the inventory.")
                .charset(Charset::Token),
            FieldSpec::string("service", "Systemd service name.").charset(Charset::Token),
            FieldSpec::integer("lines", "Number of journal lines to return (default 50).")
                .range(1, 10_000)
                .default(ArgValue::Int(50)),
            FieldSpec::string(
                "since",
                "Show entries since this time (e.g. '1 hour ago', 'today').",
            )
            .charset(Charset::Phrase)
            .optional(),
        ])
    }

    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(str_arg(arguments, "server")?)?;
        let mut command = format!(
            "journalctl -u {} --no-pager -n {}",
            str_arg(arguments, "service")?,
            int_arg(arguments, "lines")?
        );
        if let Some(since) = arguments.get("since").and_then(ArgValue::as_str) {
            command.push_str(&format!(" --since {}", shell_words::quote(since)));
        }
        Ok(Action::Run {
            server: server.name.clone(),
            command,
        })
    }
}
