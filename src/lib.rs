// Agent Hive Library - coordination kernel for concurrent coding agents
// This exposes the core components for testing and integration

pub mod agents;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dependency;
pub mod error;
pub mod events;
pub mod locks;
pub mod observability;
pub mod sanitize;
pub mod store;
pub mod tasks;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{AgentFilter, AgentInfo, AgentRecord, AgentRegistry, AgentStatus, SpecialistRouter};
pub use config::{HiveConfig, StoreBackend};
pub use coordinator::{Artifact, Coordinator};
pub use dependency::{DependencyGraph, DependencyReport, DependencyValidator};
pub use error::{CoordinationError, HiveResult};
pub use events::{Channel, Envelope, EventBus, EventKind, EventStream};
pub use locks::{FileLock, LockManager, PathCanonicalizer};
pub use observability::{store_metrics, OperationTimer, StoreStats};
pub use store::{
    CoordinationStore, MemoryStore, RedisStore, RetryConfig, RetryingStore, SharedStore,
    StoreError,
};
pub use tasks::{ClaimOutcome, ClaimRejection, NewTask, Task, TaskKind, TaskStatus, TaskStore};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
