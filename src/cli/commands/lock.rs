use crate::cli::commands::{to_json, Command};
use crate::cli::LockCommands;
use crate::coordinator::Coordinator;
use crate::error::HiveResult;
use serde_json::{json, Value};
use std::time::Duration;

pub struct LockCommand<'a> {
    command: &'a LockCommands,
    owner_id: String,
}

impl<'a> LockCommand<'a> {
    pub fn new(command: &'a LockCommands, owner_id: String) -> Self {
        Self { command, owner_id }
    }
}

impl Command for LockCommand<'_> {
    async fn execute(&self, coordinator: &Coordinator) -> HiveResult<Value> {
        let owner = self.owner_id.as_str();
        match self.command {
            LockCommands::Acquire { path, ttl } => {
                to_json(coordinator.lock(path, owner, ttl.map(Duration::from_secs)).await?)
            }
            LockCommands::Release { path } => {
                coordinator.unlock(path, owner).await?;
                Ok(json!({ "path": coordinator.locks().canonicalize(path)?, "released": true }))
            }
            LockCommands::Renew { path, ttl } => {
                let ttl = coordinator
                    .renew_lock(path, owner, ttl.map(Duration::from_secs))
                    .await?;
                Ok(json!({ "path": coordinator.locks().canonicalize(path)?, "ttlSeconds": ttl.as_secs() }))
            }
            LockCommands::Holder { path } => to_json(coordinator.locks().holder(path).await?),
            LockCommands::List => to_json(coordinator.list_locks().await?),
        }
    }
}
