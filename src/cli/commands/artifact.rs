use crate::cli::commands::{parse_payload, to_json, Command};
use crate::cli::ArtifactCommands;
use crate::coordinator::Coordinator;
use crate::error::{CoordinationError, HiveResult};
use serde_json::Value;
use std::time::Duration;

pub struct ArtifactCommand<'a> {
    command: &'a ArtifactCommands,
    agent_id: String,
}

impl<'a> ArtifactCommand<'a> {
    pub fn new(command: &'a ArtifactCommands, agent_id: String) -> Self {
        Self { command, agent_id }
    }
}

impl Command for ArtifactCommand<'_> {
    async fn execute(&self, coordinator: &Coordinator) -> HiveResult<Value> {
        match self.command {
            ArtifactCommands::Share { name, content, ttl } => to_json(
                coordinator
                    .share_artifact(
                        &self.agent_id,
                        name,
                        parse_payload(content),
                        ttl.map(Duration::from_secs),
                    )
                    .await?,
            ),
            ArtifactCommands::Get { name } => match coordinator.get_artifact(name).await? {
                Some(artifact) => to_json(artifact),
                None => Err(CoordinationError::not_found("artifact", name.clone())),
            },
        }
    }
}
