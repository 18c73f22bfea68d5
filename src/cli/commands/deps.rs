use crate::cli::commands::{to_json, Command};
use crate::cli::DepsCommands;
use crate::coordinator::Coordinator;
use crate::error::HiveResult;
use serde_json::Value;

pub struct DepsCommand<'a> {
    command: &'a DepsCommands,
}

impl<'a> DepsCommand<'a> {
    pub fn new(command: &'a DepsCommands) -> Self {
        Self { command }
    }
}

impl Command for DepsCommand<'_> {
    async fn execute(&self, coordinator: &Coordinator) -> HiveResult<Value> {
        match self.command {
            DepsCommands::Validate { task, dependencies } => to_json(
                coordinator
                    .validate_dependencies(task.as_deref(), dependencies)
                    .await?,
            ),
        }
    }
}
