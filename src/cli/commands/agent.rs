use crate::agents::{AgentFilter, AgentRecord};
use crate::cli::commands::{to_json, Command};
use crate::cli::AgentCommands;
use crate::coordinator::Coordinator;
use crate::error::HiveResult;
use serde_json::{json, Value};

pub struct AgentCommand<'a> {
    command: &'a AgentCommands,
    agent_id: String,
}

impl<'a> AgentCommand<'a> {
    pub fn new(command: &'a AgentCommands, agent_id: String) -> Self {
        Self { command, agent_id }
    }
}

impl Command for AgentCommand<'_> {
    async fn execute(&self, coordinator: &Coordinator) -> HiveResult<Value> {
        match self.command {
            AgentCommands::Register {
                agent_type,
                capabilities,
            } => {
                let record = AgentRecord::new(&self.agent_id, agent_type, capabilities.iter().cloned());
                to_json(coordinator.register_agent(record).await?)
            }
            AgentCommands::Heartbeat => {
                coordinator.heartbeat(&self.agent_id).await?;
                Ok(json!({
                    "agentId": self.agent_id,
                    "ttlSeconds": coordinator.agents().heartbeat_ttl().as_secs(),
                }))
            }
            AgentCommands::List {
                alive,
                capability,
                agent_type,
                status,
            } => {
                let filter = AgentFilter {
                    agent_type: agent_type.clone(),
                    capability: capability.clone(),
                    status: *status,
                    alive_only: *alive,
                };
                to_json(coordinator.list_agents(&filter).await?)
            }
            AgentCommands::Deregister => {
                let removed = coordinator.deregister_agent(&self.agent_id).await?;
                Ok(json!({ "agentId": self.agent_id, "removed": removed }))
            }
        }
    }
}
