//! Key and channel namespace shared with every other collaborator of the store.
//! These strings are a wire contract; do not change them.

pub const TASK_DATA_PREFIX: &str = "tasks:data:";
pub const TASK_CLAIM_PREFIX: &str = "tasks:claimed:";
pub const TASK_STATUS_PREFIX: &str = "tasks:by_status:";
pub const TASK_QUEUE: &str = "tasks:queue";
pub const AGENTS: &str = "agents";
pub const HEARTBEAT_PREFIX: &str = "heartbeats:";
pub const FILE_LOCK_PREFIX: &str = "locks:file:";
pub const DIRECT_CHANNEL_PREFIX: &str = "messages:";
pub const BROADCAST_CHANNEL: &str = "broadcast";
pub const EVENTS_CHANNEL: &str = "events";
pub const ARTIFACT_PREFIX: &str = "artifacts:";

pub fn task_data(task_id: &str) -> String {
    format!("{TASK_DATA_PREFIX}{task_id}")
}

pub fn task_claim(task_id: &str) -> String {
    format!("{TASK_CLAIM_PREFIX}{task_id}")
}

pub fn tasks_by_status(status: &str) -> String {
    format!("{TASK_STATUS_PREFIX}{status}")
}

pub fn heartbeat(agent_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{agent_id}")
}

pub fn file_lock(normalized_path: &str) -> String {
    format!("{FILE_LOCK_PREFIX}{normalized_path}")
}

pub fn direct_channel(agent_id: &str) -> String {
    format!("{DIRECT_CHANNEL_PREFIX}{agent_id}")
}

pub fn artifact(name: &str) -> String {
    format!("{ARTIFACT_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_is_bit_exact() {
        assert_eq!(task_data("t1"), "tasks:data:t1");
        assert_eq!(task_claim("t1"), "tasks:claimed:t1");
        assert_eq!(tasks_by_status("in_progress"), "tasks:by_status:in_progress");
        assert_eq!(heartbeat("agent-1"), "heartbeats:agent-1");
        assert_eq!(file_lock("src/main.rs"), "locks:file:src/main.rs");
        assert_eq!(direct_channel("agent-1"), "messages:agent-1");
        assert_eq!(TASK_QUEUE, "tasks:queue");
        assert_eq!(AGENTS, "agents");
        assert_eq!(BROADCAST_CHANNEL, "broadcast");
        assert_eq!(EVENTS_CHANNEL, "events");
    }
}
