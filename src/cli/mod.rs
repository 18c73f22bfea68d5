use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

pub use commands::{run, Output};

#[derive(Parser)]
#[command(name = "agent-hive")]
#[command(about = "Coordination kernel for independent coding agents")]
#[command(long_about = "agent-hive lets independent agent processes share a task backlog, \
                       file locks and a message bus through one key-value store. Every command \
                       prints a JSON envelope {ok, data, error}.")]
pub struct Cli {
    /// Explicit configuration file (defaults to agent-hive.toml / .agent-hive-rc)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Identity used for claims, locks and messages
    #[arg(long, global = true, env = "AGENT_HIVE_AGENT_ID")]
    pub agent: Option<String>,

    /// Print the envelope on a single line
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, claim and finish tasks
    #[command(subcommand)]
    Task(TaskCommands),
    /// Advisory file locks
    #[command(subcommand)]
    Lock(LockCommands),
    /// Agent registration and liveness
    #[command(subcommand)]
    Agent(AgentCommands),
    /// Dependency checks
    #[command(subcommand)]
    Deps(DepsCommands),
    /// Share and fetch named artifacts
    #[command(subcommand)]
    Artifact(ArtifactCommands),
    /// Send a message to one agent or to everyone
    Message {
        /// Recipient agent; broadcast when omitted
        #[arg(long)]
        to: Option<String>,
        /// Message type
        #[arg(long, default_value = "message")]
        kind: String,
        /// JSON payload (plain text is sent as a string)
        payload: String,
    },
    /// Validate a documentation search query
    Search {
        query: String,
    },
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug, Clone)]
pub struct TaskSpec {
    /// Short summary (at most 200 characters)
    #[arg(long)]
    pub title: String,
    #[arg(long, default_value = "")]
    pub description: String,
    /// implement, debug, review, test, security, refactor or docs
    #[arg(long, default_value = "implement")]
    pub kind: crate::tasks::TaskKind,
    /// 1 (lowest) to 10 (highest)
    #[arg(long, default_value_t = crate::tasks::DEFAULT_PRIORITY)]
    pub priority: u8,
    /// Task ids that must complete first (repeatable)
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,
    /// Explicit task id instead of a generated UUID
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task for an agent (routed to an idle specialist when --to is omitted)
    Send {
        #[command(flatten)]
        spec: TaskSpec,
        #[arg(long)]
        to: Option<String>,
    },
    /// Create an unassigned task and announce it on the broadcast channel
    Broadcast {
        #[command(flatten)]
        spec: TaskSpec,
    },
    /// Show a task record
    Status { task_id: String },
    /// Cancel a task
    Cancel { task_id: String },
    /// Claim a task, or the next claimable one when no id is given
    Claim { task_id: Option<String> },
    /// Mark a claimed task in progress
    Start { task_id: String },
    /// Mark a task completed
    Complete {
        task_id: String,
        /// JSON result
        #[arg(long)]
        result: Option<String>,
    },
    /// Mark a task failed
    Fail {
        task_id: String,
        /// JSON error detail
        #[arg(long)]
        error: Option<String>,
    },
    /// Return a held task to the queue
    Release { task_id: String },
    /// Tasks in queue order
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        status: Option<crate::tasks::TaskStatus>,
    },
    /// Return tasks with lapsed claim leases to the queue
    Recover,
}

#[derive(Subcommand)]
pub enum LockCommands {
    /// Take the lock on a path
    Acquire {
        path: String,
        /// Lease in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Release a lock you hold
    Release { path: String },
    /// Extend a lock you hold
    Renew {
        path: String,
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Show the holder of a path
    Holder { path: String },
    /// All live locks
    List,
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register this agent and start its heartbeat lease
    Register {
        #[arg(long = "type", default_value = "worker")]
        agent_type: String,
        /// Advertised capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Refresh this agent's heartbeat
    Heartbeat,
    /// Registered agents with liveness
    List {
        #[arg(long)]
        alive: bool,
        #[arg(long)]
        capability: Option<String>,
        #[arg(long = "type")]
        agent_type: Option<String>,
        #[arg(long)]
        status: Option<crate::agents::AgentStatus>,
    },
    /// Remove this agent's registration
    Deregister,
}

#[derive(Subcommand)]
pub enum DepsCommands {
    /// Dry-run a dependency set without creating anything
    Validate {
        /// Existing task the dependencies would be attached to
        #[arg(long)]
        task: Option<String>,
        dependencies: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// Store a named artifact
    Share {
        name: String,
        /// JSON content (plain text is stored as a string)
        content: String,
        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Fetch a named artifact
    Get { name: String },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
}
