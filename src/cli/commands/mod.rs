use crate::cli::{Cli, Commands, ConfigCommands};
use crate::config::HiveConfig;
use crate::coordinator::Coordinator;
use crate::error::{CoordinationError, HiveResult};
use serde::Serialize;
use serde_json::Value;

pub mod agent;
pub mod artifact;
pub mod deps;
pub mod lock;
pub mod task;

pub use agent::AgentCommand;
pub use artifact::ArtifactCommand;
pub use deps::DepsCommand;
pub use lock::LockCommand;
pub use task::TaskCommand;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self, coordinator: &Coordinator) -> HiveResult<Value>;
}

/// JSON envelope printed by every command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl Output {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &CoordinationError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn from_result(result: HiveResult<Value>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }

    pub fn render(&self, compact: bool) -> serde_json::Result<String> {
        if compact {
            serde_json::to_string(self)
        } else {
            serde_json::to_string_pretty(self)
        }
    }
}

/// Execute the parsed command line. Failures are folded into the envelope.
pub async fn run(cli: &Cli, config: &HiveConfig) -> Output {
    // Commands that never touch the store.
    match &cli.command {
        Commands::Config(ConfigCommands::Show) => {
            return Output::from_result(to_json(config));
        }
        Commands::Search { query } => {
            return Output::from_result(
                crate::sanitize::sanitize_search_query(query).map(Value::String),
            );
        }
        _ => {}
    }

    let coordinator = match Coordinator::connect(config).await {
        Ok(coordinator) => coordinator,
        Err(err) => return Output::failure(&err),
    };
    Output::from_result(dispatch(cli, &coordinator).await)
}

async fn dispatch(cli: &Cli, coordinator: &Coordinator) -> HiveResult<Value> {
    let agent_id = agent_id(cli.agent.as_deref());
    match &cli.command {
        Commands::Task(command) => TaskCommand::new(command, agent_id).execute(coordinator).await,
        Commands::Lock(command) => LockCommand::new(command, agent_id).execute(coordinator).await,
        Commands::Agent(command) => AgentCommand::new(command, agent_id).execute(coordinator).await,
        Commands::Deps(command) => DepsCommand::new(command).execute(coordinator).await,
        Commands::Artifact(command) => {
            ArtifactCommand::new(command, agent_id).execute(coordinator).await
        }
        Commands::Message { to, kind, payload } => {
            let receivers = coordinator
                .send_message(&agent_id, to.as_deref(), kind, parse_payload(payload))
                .await?;
            Ok(serde_json::json!({ "receivers": receivers }))
        }
        Commands::Config(_) | Commands::Search { .. } => Err(CoordinationError::invalid(
            "command",
            "handled without a store connection",
        )),
    }
}

/// `--agent` / `AGENT_HIVE_AGENT_ID`, else an id derived from the hostname.
pub fn agent_id(explicit: Option<&str>) -> String {
    match explicit {
        Some(id) => id.to_string(),
        None => {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "local".to_string());
            let host: String = host
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
                .take(crate::sanitize::MAX_AGENT_ID_LEN - "agent-".len())
                .collect();
            format!("agent-{host}")
        }
    }
}

/// JSON when it parses, otherwise the raw text as a JSON string.
pub fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub(crate) fn to_json<T: Serialize>(value: T) -> HiveResult<Value> {
    Ok(serde_json::to_value(value)?)
}
