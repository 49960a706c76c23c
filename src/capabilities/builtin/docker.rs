use crate::capabilities::{
    int_arg, str_arg, Action, Capability, Charset, Effect, FieldSpec, InputSchema,
};
use crate::error::GateError;
use crate::invocation::{ArgValue, Arguments};
use crate::inventory::Inventory;

pub struct DockerPs;

impl Capability for DockerPs {
    fn name(&self) -> &str {
        "docker_ps"
    }

    fn description(&self) -> &str {
        "List running Docker containers on a server. Set 'all' to true to \
         include stopped containers."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec::string("server", "Server name from the inventory.")
                .charset(Charset::Token),
            FieldSpec::boolean("all", "Include stopped containers (default false).")
                .default(ArgValue::Bool(false)),
        ])
    }

    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(str_arg(arguments, "server")?)?;
        let all = arguments.get("all").and_then(ArgValue::as_bool).unwrap_or(false);
        let command = if all { "docker ps -a" } else { "docker ps" };
        Ok(Action::Run {
            server: server.name.clone(),
            command: command.to_string(),
        })
    }
}

pub struct DockerLogs;

impl Capability for DockerLogs {
    fn name(&self) -> &str {
        "docker_logs"
    }

    fn description(&self) -> &str {
        "Fetch logs from a Docker container on a server. Optionally limit by \
         number of lines or time range."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec::string("server", "Server name from the inventory.")
                .charset(Charset::Token),
            FieldSpec::string("container", "Container name or ID.").charset(Charset::Token),
            FieldSpec::integer("lines", "Number of log lines to return (default 100).")
                .range(1, 10_000)
                .default(ArgValue::Int(100)),
            FieldSpec::string("since", "Show logs since this time (e.g. '1h', '2024-01-01').")
                .charset(Charset::Token)
                .optional(),
        ])
    }

    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(str_arg(arguments, "server")?)?;
        let mut command = format!("docker logs --tail {}", int_arg(arguments, "lines")?);
        if let Some(since) = arguments.get("since").and_then(ArgValue::as_str) {
            command.push_str(&format!(" --since {since}"));
        }
        command.push(' ');
        command.push_str(str_arg(arguments, "container")?);
        Ok(Action::Run {
            server: server.name.clone(),
            command,
        })
    }
}
