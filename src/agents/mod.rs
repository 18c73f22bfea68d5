pub mod registry;
pub mod routing;

pub use registry::{
    AgentFilter, AgentInfo, AgentRecord, AgentRegistry, AgentStatus, DEFAULT_HEARTBEAT_TTL,
};
pub use routing::{RoutingRule, SpecialistRouter, GENERALIST};
