use crate::capabilities::{Action, Capability, Effect, InputSchema};
use crate::error::GateError;
use crate::invocation::Arguments;
use crate::inventory::Inventory;

/// Describes the inventory. Answered in-process, nothing runs.
pub struct ListServers;

impl Capability for ListServers {
    fn name(&self) -> &str {
        "list_servers"
    }

    fn description(&self) -> &str {
        "List the servers in the inventory with their role, address and services."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::default()
    }

    fn effect(&self) -> Effect {
        Effect::ReadOnly
    }

    fn target(&self, _arguments: &Arguments) -> Option<String> {
        None
    }

    fn plan(&self, _arguments: &Arguments, inventory: &Inventory) -> Result<Action, GateError> {
        Ok(Action::Report(inventory.summary()))
    }
}
