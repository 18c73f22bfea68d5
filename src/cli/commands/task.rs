use crate::cli::commands::{parse_payload, to_json, Command};
use crate::cli::{TaskCommands, TaskSpec};
use crate::coordinator::Coordinator;
use crate::error::{CoordinationError, HiveResult};
use crate::tasks::{ClaimOutcome, NewTask};
use serde_json::{json, Value};

pub struct TaskCommand<'a> {
    command: &'a TaskCommands,
    agent_id: String,
}

impl<'a> TaskCommand<'a> {
    pub fn new(command: &'a TaskCommands, agent_id: String) -> Self {
        Self { command, agent_id }
    }
}

fn new_task(spec: &TaskSpec) -> NewTask {
    let mut task = NewTask::new(&spec.title)
        .with_description(&spec.description)
        .with_kind(spec.kind)
        .with_priority(spec.priority)
        .with_dependencies(spec.depends_on.iter().cloned());
    if let Some(id) = &spec.id {
        task = task.with_id(id);
    }
    task
}

impl Command for TaskCommand<'_> {
    async fn execute(&self, coordinator: &Coordinator) -> HiveResult<Value> {
        let agent = self.agent_id.as_str();
        match self.command {
            TaskCommands::Send { spec, to } => {
                to_json(coordinator.send_task(agent, to.as_deref(), new_task(spec)).await?)
            }
            TaskCommands::Broadcast { spec } => {
                to_json(coordinator.broadcast_task(agent, new_task(spec)).await?)
            }
            TaskCommands::Status { task_id } => to_json(coordinator.task_status(task_id).await?),
            TaskCommands::Cancel { task_id } => to_json(coordinator.cancel_task(task_id).await?),
            TaskCommands::Claim { task_id: Some(task_id) } => {
                match coordinator.claim_task(task_id, agent).await? {
                    ClaimOutcome::Claimed(task) => to_json(task),
                    ClaimOutcome::Rejected(rejection) => Err(rejection.into_error(task_id)),
                }
            }
            TaskCommands::Claim { task_id: None } => match coordinator.claim_next(agent).await? {
                Some(task) => to_json(task),
                None => Err(CoordinationError::not_found("claimable task", agent)),
            },
            TaskCommands::Start { task_id } => {
                to_json(coordinator.start_task(task_id, agent).await?)
            }
            TaskCommands::Complete { task_id, result } => {
                let result = result.as_deref().map_or(Value::Null, parse_payload);
                to_json(coordinator.complete_task(task_id, agent, result).await?)
            }
            TaskCommands::Fail { task_id, error } => {
                let error = error.as_deref().map_or(Value::Null, parse_payload);
                to_json(coordinator.fail_task(task_id, agent, error).await?)
            }
            TaskCommands::Release { task_id } => {
                to_json(coordinator.release_task(task_id, agent).await?)
            }
            TaskCommands::List { limit, status } => {
                to_json(coordinator.list_tasks(*limit, *status).await?)
            }
            TaskCommands::Recover => {
                let recovered = coordinator.recover_orphans().await?;
                Ok(json!({ "recovered": recovered }))
            }
        }
    }
}
