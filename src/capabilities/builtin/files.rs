use crate::capabilities::{
    int_arg, str_arg, Action, Capability, Charset, Effect, FieldSpec, InputSchema,
};
use crate::error::GateError;
use crate::invocation::{ArgValue, Arguments};
use crate::inventory::Inventory;

/// Reads the head of a file. Checked against the role's read paths rather
/// than its command allowlist.
pub struct ReadFile;

impl Capability for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the first lines of a file on a server. The path must be under one \
         of the server role's allowed read paths."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec::string("server", "Server name from the inventory.")
                .charset(Charset::Token),
            FieldSpec::string("path", "Absolute path of the file to read.")
                .charset(Charset::Path),
            FieldSpec::integer("lines", "Number of lines to return (default 100).")
                .range(1, 10_000)
                .default(ArgValue::Int(100)),
        ])
    }

    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    fn plan(&self, arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        let server = inventory.get(str_arg(arguments, "server")?)?;
        Ok(Action::Read {
            server: server.name.clone(),
            path: str_arg(arguments, "path")?.to_string(),
            lines: int_arg(arguments, "lines")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::args;
    use crate::inventory::{Server, LOCAL_SERVER};

    #[test]
    fn test_plan_with_default_lines() {
        let cap = ReadFile;
        let raw = args([("server", LOCAL_SERVER), ("path", "/var/log/syslog")]);
        let validated = cap.input_schema().validate(&raw).unwrap();
        let inventory = Inventory::new(vec![Server::local(LOCAL_SERVER, "bastion")]);

        let action = cap.plan(&validated, &inventory).unwrap();
        assert_eq!(
            action.command_text().as_deref(),
            Some("head -n 100 /var/log/syslog")
        );
        assert_eq!(cap.effect(), Effect::ReadOnly);
    }

    #[test]
    fn test_path_with_spaces_rejected_by_schema() {
        let raw = args([("server", LOCAL_SERVER), ("path", "/tmp/a b")]);
        assert!(ReadFile.input_schema().validate(&raw).is_err());
    }
}
