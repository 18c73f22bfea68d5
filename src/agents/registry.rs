use crate::error::{CoordinationError, HiveResult};
use crate::store::{keys, SharedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "error" => Ok(AgentStatus::Error),
            other => Err(CoordinationError::invalid(
                "status",
                format!("unknown agent status '{other}'"),
            )),
        }
    }
}

/// Registration record kept in the `agents` hash. It never expires; liveness lives
/// in the separate heartbeat key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new<I, S>(agent_id: impl Into<String>, agent_type: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Idle,
            registered_at: Utc::now(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// A record annotated with its liveness at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFilter {
    pub agent_type: Option<String>,
    pub capability: Option<String>,
    pub status: Option<AgentStatus>,
    pub alive_only: bool,
}

impl AgentFilter {
    pub fn alive() -> Self {
        Self {
            alive_only: true,
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches_record(&self, record: &AgentRecord) -> bool {
        self.agent_type
            .as_deref()
            .map_or(true, |t| record.agent_type == t)
            && self
                .capability
                .as_deref()
                .map_or(true, |c| record.has_capability(c))
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// Liveness registry. "Alive" means exactly one thing: the heartbeat key exists.
#[derive(Clone)]
pub struct AgentRegistry {
    store: SharedStore,
    heartbeat_ttl: Duration,
}

impl AgentRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self::with_heartbeat_ttl(store, DEFAULT_HEARTBEAT_TTL)
    }

    pub fn with_heartbeat_ttl(store: SharedStore, heartbeat_ttl: Duration) -> Self {
        Self {
            store,
            heartbeat_ttl,
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    /// Write (or overwrite) the record and start the heartbeat.
    pub async fn register(&self, record: AgentRecord) -> HiveResult<AgentRecord> {
        let value = serde_json::to_string(&record)?;
        self.store
            .hset(keys::AGENTS, &record.agent_id, &value)
            .await?;
        self.beat(&record.agent_id).await?;

        info!(
            agent_id = %record.agent_id,
            agent_type = %record.agent_type,
            capabilities = record.capabilities.len(),
            "Agent registered"
        );
        Ok(record)
    }

    /// Refresh the heartbeat TTL. The record itself is never rewritten.
    pub async fn heartbeat(&self, agent_id: &str) -> HiveResult<()> {
        if self.store.hget(keys::AGENTS, agent_id).await?.is_none() {
            return Err(CoordinationError::not_found("agent", agent_id));
        }
        self.beat(agent_id).await?;
        debug!(agent_id, "Heartbeat");
        Ok(())
    }

    async fn beat(&self, agent_id: &str) -> HiveResult<()> {
        self.store
            .set(
                &keys::heartbeat(agent_id),
                &Utc::now().to_rfc3339(),
                Some(self.heartbeat_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn is_alive(&self, agent_id: &str) -> HiveResult<bool> {
        Ok(self.store.exists(&keys::heartbeat(agent_id)).await?)
    }

    pub async fn get(&self, agent_id: &str) -> HiveResult<Option<AgentRecord>> {
        match self.store.hget(keys::AGENTS, agent_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Update the advertised status. Read-modify-write; the record is advisory.
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> HiveResult<AgentRecord> {
        let mut record = self
            .get(agent_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("agent", agent_id))?;
        record.status = status;
        self.store
            .hset(keys::AGENTS, agent_id, &serde_json::to_string(&record)?)
            .await?;
        debug!(agent_id, status = %status, "Agent status updated");
        Ok(record)
    }

    /// Remove the record and heartbeat. Returns whether a record existed.
    pub async fn deregister(&self, agent_id: &str) -> HiveResult<bool> {
        let existed = self.store.hdel(keys::AGENTS, agent_id).await?;
        self.store.delete(&keys::heartbeat(agent_id)).await?;
        info!(agent_id, existed, "Agent deregistered");
        Ok(existed)
    }

    /// All matching records with liveness, sorted by agent id.
    pub async fn list(&self, filter: &AgentFilter) -> HiveResult<Vec<AgentInfo>> {
        let mut agents = Vec::new();
        for (agent_id, raw) in self.store.hgetall(keys::AGENTS).await? {
            let record: AgentRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Skipping malformed agent record");
                    continue;
                }
            };
            if !filter.matches_record(&record) {
                continue;
            }

            let heartbeat_key = keys::heartbeat(&agent_id);
            let alive = self.store.exists(&heartbeat_key).await?;
            if filter.alive_only && !alive {
                continue;
            }
            let ttl = if alive {
                self.store.ttl(&heartbeat_key).await?
            } else {
                None
            };

            agents.push(AgentInfo {
                record,
                alive,
                heartbeat_ttl_seconds: ttl.map(|d| d.as_secs()),
            });
        }
        agents.sort_by(|a, b| a.record.agent_id.cmp(&b.record.agent_id));
        Ok(agents)
    }
}
