//! Single entry point for agents.
//!
//! Every write validates its inputs before touching the store. Notifications are sent
//! after the authoritative write; a failed publish is logged and never fails the call.

use crate::agents::{
    AgentFilter, AgentInfo, AgentRecord, AgentRegistry, AgentStatus, SpecialistRouter,
};
use crate::config::{HiveConfig, StoreBackend};
use crate::dependency::{DependencyReport, DependencyValidator};
use crate::error::{CoordinationError, HiveResult};
use crate::events::{Channel, EventBus, EventKind, EventStream};
use crate::locks::{FileLock, LockManager, PathCanonicalizer};
use crate::observability::{store_metrics, StoreStats};
use crate::sanitize;
use crate::store::{keys, MemoryStore, RedisStore, RetryingStore, SharedStore};
use crate::tasks::{ClaimOutcome, NewTask, Task, TaskStatus, TaskStore};
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use crate::time_operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Message kind announcing a new task on the broadcast channel.
pub const TASK_AVAILABLE: &str = "task_available";

/// Named blob shared between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub content: Value,
    pub from: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Coordinator {
    store: SharedStore,
    tasks: TaskStore,
    locks: LockManager,
    agents: AgentRegistry,
    events: EventBus,
    router: SpecialistRouter,
    validator: DependencyValidator,
}

impl Coordinator {
    pub fn new(store: SharedStore, config: &HiveConfig) -> Self {
        Self {
            tasks: TaskStore::with_claim_ttl(store.clone(), config.claim_ttl()),
            locks: LockManager::with_settings(
                store.clone(),
                config.lock_ttl(),
                PathCanonicalizer::with_max_length(config.locks.max_path_length),
            ),
            agents: AgentRegistry::with_heartbeat_ttl(store.clone(), config.heartbeat_ttl()),
            events: EventBus::new(store.clone()),
            router: SpecialistRouter::default(),
            validator: DependencyValidator::new(),
            store,
        }
    }

    /// Coordinator over a fresh process-local store with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), &HiveConfig::default())
    }

    /// Open the backend named in `config`. Redis connections are wrapped in the
    /// retrying adapter.
    pub async fn connect(config: &HiveConfig) -> HiveResult<Self> {
        let store: SharedStore = match config.store.backend {
            StoreBackend::Redis => {
                let redis = RedisStore::connect(&config.store.url).await?;
                Arc::new(RetryingStore::new(redis, config.store.retry.clone()))
            }
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        info!(backend = ?config.store.backend, "Coordinator connected");
        Ok(Self::new(store, config))
    }

    pub fn with_router(mut self, router: SpecialistRouter) -> Self {
        self.router = router;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- tasks ----

    /// Create a task for a specific agent, or for whichever idle specialist the
    /// router picks when `to` is `None`.
    pub async fn send_task(&self, from: &str, to: Option<&str>, new: NewTask) -> HiveResult<Task> {
        let span = create_coordination_span(
            "send_task",
            Some(from),
            None,
            Some(&generate_correlation_id()),
        );
        async move {
            time_operation!("send_task");
            sanitize::validate_agent_id(from)?;
            if let Some(to) = to {
                sanitize::validate_agent_id(to)?;
            }

            let mut task = self.prepare(from, new)?;
            let assignee = match to {
                Some(to) => Some(to.to_string()),
                None => self.route(&task).await?,
            };
            task.assigned_to = assignee.clone();

            let task = self.tasks.enqueue(task).await?;
            self.emit(EventKind::TaskCreated, task_payload(&task)).await;

            if let Some(agent_id) = assignee {
                let delivered = self
                    .events
                    .send_direct(from, &agent_id, EventKind::TaskAssigned.as_str(), task_payload(&task))
                    .await;
                log_publish("send_task", delivered);
            }
            Ok(task)
        }
        .instrument(span)
        .await
    }

    /// Create an unassigned task and announce it to every listening agent.
    pub async fn broadcast_task(&self, from: &str, new: NewTask) -> HiveResult<Task> {
        sanitize::validate_agent_id(from)?;
        let task = self.prepare(from, new)?;
        let task = self.tasks.enqueue(task).await?;

        self.emit(EventKind::TaskCreated, task_payload(&task)).await;
        let delivered = self
            .events
            .broadcast(from, TASK_AVAILABLE, task_payload(&task))
            .await;
        log_publish("broadcast_task", delivered);
        Ok(task)
    }

    fn prepare(&self, from: &str, mut new: NewTask) -> HiveResult<Task> {
        if let Some(id) = &new.id {
            sanitize::validate_task_id(id)?;
        }
        for dep in &new.dependencies {
            sanitize::validate_task_id(dep)?;
        }
        new.title = sanitize::validate_title(&new.title)?.to_string();
        sanitize::validate_description(&new.description)?;
        new.created_by = Some(from.to_string());

        let mut task = Task::new(new);
        task.specialist = Some(self.router.route(&task).to_string());
        Ok(task)
    }

    async fn route(&self, task: &Task) -> HiveResult<Option<String>> {
        let Some(label) = task.specialist.as_deref() else {
            return Ok(None);
        };
        let agents = self
            .agents
            .list(&AgentFilter::alive().with_capability(label))
            .await?;
        let picked = self
            .router
            .pick_agent(label, &agents)
            .map(|agent| agent.record.agent_id.clone());
        debug!(task_id = %task.id, specialist = label, assignee = ?picked, "Routed task");
        Ok(picked)
    }

    pub async fn task_status(&self, task_id: &str) -> HiveResult<Task> {
        self.tasks.get(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> HiveResult<Task> {
        sanitize::validate_task_id(task_id)?;
        let before = self.tasks.get(task_id).await?;
        let task = self.tasks.cancel(task_id).await?;
        self.emit(EventKind::TaskCancelled, task_payload(&task)).await;

        if let Some(holder) = before.claimed_by.filter(|_| before.status.is_held()) {
            let delivered = self
                .events
                .send_direct(
                    crate::events::SYSTEM_SENDER,
                    &holder,
                    EventKind::TaskCancelled.as_str(),
                    task_payload(&task),
                )
                .await;
            log_publish("cancel_task", delivered);
            self.mark_agent(&holder, AgentStatus::Idle).await;
        }
        Ok(task)
    }

    /// Attempt to claim `task_id`. Losing the race is a normal outcome.
    pub async fn claim_task(&self, task_id: &str, agent_id: &str) -> HiveResult<ClaimOutcome> {
        sanitize::validate_task_id(task_id)?;
        sanitize::validate_agent_id(agent_id)?;
        let span = create_coordination_span("claim_task", Some(agent_id), Some(task_id), None);
        let outcome = self.tasks.claim(task_id, agent_id).instrument(span).await?;

        if let ClaimOutcome::Claimed(task) = &outcome {
            self.emit(EventKind::TaskClaimed, task_payload(task)).await;
            self.mark_agent(agent_id, AgentStatus::Busy).await;
        }
        Ok(outcome)
    }

    /// Claim the highest-priority claimable task that is unassigned or assigned to
    /// `agent_id`.
    pub async fn claim_next(&self, agent_id: &str) -> HiveResult<Option<Task>> {
        sanitize::validate_agent_id(agent_id)?;
        let candidates = self.tasks.claimable().await?;

        for task in candidates
            .iter()
            .filter(|t| t.assigned_to.as_deref().map_or(true, |a| a == agent_id))
        {
            match self.claim_task(&task.id, agent_id).await? {
                ClaimOutcome::Claimed(task) => return Ok(Some(task)),
                ClaimOutcome::Rejected(reason) => {
                    debug!(task_id = %task.id, agent_id, %reason, "Candidate taken, trying next");
                }
            }
        }
        Ok(None)
    }

    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> HiveResult<Task> {
        sanitize::validate_task_id(task_id)?;
        let task = self.tasks.start(task_id, agent_id).await?;
        self.emit(EventKind::TaskStarted, task_payload(&task)).await;
        Ok(task)
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        result: Value,
    ) -> HiveResult<Task> {
        time_operation!("complete_task");
        sanitize::validate_task_id(task_id)?;
        let task = self.tasks.complete_as(task_id, agent_id, result).await?;
        self.emit(EventKind::TaskCompleted, task_payload(&task)).await;
        self.mark_agent(agent_id, AgentStatus::Idle).await;
        Ok(task)
    }

    pub async fn fail_task(&self, task_id: &str, agent_id: &str, error: Value) -> HiveResult<Task> {
        sanitize::validate_task_id(task_id)?;
        let task = self.tasks.fail_as(task_id, agent_id, error).await?;
        self.emit(EventKind::TaskFailed, task_payload(&task)).await;
        self.mark_agent(agent_id, AgentStatus::Idle).await;
        Ok(task)
    }

    /// Give a held task back to the queue.
    pub async fn release_task(&self, task_id: &str, agent_id: &str) -> HiveResult<Task> {
        sanitize::validate_task_id(task_id)?;
        let task = self.tasks.release_as(task_id, agent_id).await?;
        self.emit(EventKind::TaskReleased, task_payload(&task)).await;
        self.mark_agent(agent_id, AgentStatus::Idle).await;
        Ok(task)
    }

    pub async fn list_tasks(&self, limit: usize, status: Option<TaskStatus>) -> HiveResult<Vec<Task>> {
        self.tasks.peek(limit, status).await
    }

    /// Return tasks whose claimant's lease lapsed to the queue.
    pub async fn recover_orphans(&self) -> HiveResult<Vec<String>> {
        let recovered = self.tasks.recover_orphans().await?;
        for task_id in &recovered {
            self.emit(
                EventKind::TaskReleased,
                json!({ "taskId": task_id, "reason": "claim_expired" }),
            )
            .await;
        }
        Ok(recovered)
    }

    /// Check a proposed dependency set without writing anything. A `None` id stands
    /// for a task that does not exist yet.
    pub async fn validate_dependencies(
        &self,
        task_id: Option<&str>,
        dependencies: &[String],
    ) -> HiveResult<DependencyReport> {
        let graph = self.tasks.dependency_graph().await?;
        let task_id = task_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(self.validator.validate(&graph, &task_id, dependencies))
    }

    // ---- locks ----

    pub async fn lock(&self, path: &str, owner_id: &str, ttl: Option<Duration>) -> HiveResult<FileLock> {
        sanitize::validate_agent_id(owner_id)?;
        let span = create_coordination_span("lock", Some(owner_id), None, None);
        let lock = self.locks.acquire(path, owner_id, ttl).instrument(span).await?;
        self.emit(EventKind::LockAcquired, json!({ "path": lock.path, "ownerId": owner_id }))
            .await;
        Ok(lock)
    }

    pub async fn unlock(&self, path: &str, owner_id: &str) -> HiveResult<()> {
        sanitize::validate_agent_id(owner_id)?;
        self.locks.release(path, owner_id).await?;
        let path = self.locks.canonicalize(path)?;
        self.emit(EventKind::LockReleased, json!({ "path": path, "ownerId": owner_id }))
            .await;
        Ok(())
    }

    pub async fn renew_lock(&self, path: &str, owner_id: &str, ttl: Option<Duration>) -> HiveResult<Duration> {
        sanitize::validate_agent_id(owner_id)?;
        self.locks.renew(path, owner_id, ttl).await
    }

    pub async fn list_locks(&self) -> HiveResult<Vec<FileLock>> {
        self.locks.list().await
    }

    // ---- agents ----

    pub async fn register_agent(&self, record: AgentRecord) -> HiveResult<AgentRecord> {
        sanitize::validate_agent_id(&record.agent_id)?;
        let record = self.agents.register(record).await?;
        self.emit(
            EventKind::AgentRegistered,
            json!({
                "agentId": record.agent_id,
                "agentType": record.agent_type,
                "capabilities": record.capabilities,
            }),
        )
        .await;
        Ok(record)
    }

    pub async fn heartbeat(&self, agent_id: &str) -> HiveResult<()> {
        self.agents.heartbeat(agent_id).await
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> HiveResult<Vec<AgentInfo>> {
        self.agents.list(filter).await
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> HiveResult<bool> {
        let removed = self.agents.deregister(agent_id).await?;
        if removed {
            self.emit(EventKind::AgentDeregistered, json!({ "agentId": agent_id }))
                .await;
        }
        Ok(removed)
    }

    /// Best-effort status update. Agents that never registered are left alone.
    async fn mark_agent(&self, agent_id: &str, status: AgentStatus) {
        match self.agents.set_status(agent_id, status).await {
            Ok(_) | Err(CoordinationError::RecordNotFound { .. }) => {}
            Err(e) => warn!(agent_id, %status, error = %e, "Failed to update agent status"),
        }
    }

    // ---- messaging ----

    /// Direct message when `to` is set, broadcast otherwise. Returns receiver count.
    pub async fn send_message(
        &self,
        from: &str,
        to: Option<&str>,
        kind: &str,
        payload: Value,
    ) -> HiveResult<usize> {
        sanitize::validate_agent_id(from)?;
        match to {
            Some(to) => {
                sanitize::validate_agent_id(to)?;
                self.events.send_direct(from, to, kind, payload).await
            }
            None => self.events.broadcast(from, kind, payload).await,
        }
    }

    pub async fn subscribe(&self, channels: &[Channel]) -> HiveResult<EventStream> {
        self.events.subscribe(channels).await
    }

    pub async fn share_artifact(
        &self,
        from: &str,
        name: &str,
        content: Value,
        ttl: Option<Duration>,
    ) -> HiveResult<Artifact> {
        sanitize::validate_agent_id(from)?;
        let name = sanitize::validate_artifact_name(name)?;
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CoordinationError::invalid("ttl", "artifact TTL must be positive"));
        }

        let artifact = Artifact {
            name: name.to_string(),
            content,
            from: from.to_string(),
            created_at: Utc::now(),
        };
        self.store
            .set(&keys::artifact(name), &serde_json::to_string(&artifact)?, ttl)
            .await?;
        info!(artifact = name, from, "Artifact shared");

        self.emit(EventKind::ArtifactShared, json!({ "name": name, "from": from }))
            .await;
        Ok(artifact)
    }

    pub async fn get_artifact(&self, name: &str) -> HiveResult<Option<Artifact>> {
        let name = sanitize::validate_artifact_name(name)?;
        match self.store.get(&keys::artifact(name)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Clean a free-text query before a caller hands it to an external search process.
    pub fn sanitize_search_query(&self, query: &str) -> HiveResult<String> {
        sanitize::sanitize_search_query(query)
    }

    pub fn metrics(&self) -> StoreStats {
        store_metrics().get_stats()
    }

    async fn emit(&self, kind: EventKind, payload: Value) {
        log_publish(kind.as_str(), self.events.emit_system(kind, payload).await);
    }
}

fn task_payload(task: &Task) -> Value {
    json!({
        "taskId": task.id,
        "title": task.title,
        "status": task.status,
        "priority": task.priority,
        "specialist": task.specialist,
        "assignedTo": task.assigned_to,
        "claimedBy": task.claimed_by,
    })
}

fn log_publish(operation: &str, result: HiveResult<usize>) {
    match result {
        Ok(receivers) => debug!(operation, receivers, "Notification published"),
        Err(e) => warn!(operation, error = %e, "Notification publish failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{ClaimRejection, TaskKind};

    async fn registered(coordinator: &Coordinator, id: &str, capabilities: &[&str]) {
        coordinator
            .register_agent(AgentRecord::new(id, "worker", capabilities.iter().copied()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_task_routes_to_idle_specialist() {
        let coordinator = Coordinator::in_memory();
        registered(&coordinator, "sec-1", &["security-specialist"]).await;
        let mut inbox = coordinator
            .subscribe(&[Channel::Direct("sec-1".into())])
            .await
            .unwrap();

        let task = coordinator
            .send_task("lead", None, NewTask::new("Patch XSS in comments"))
            .await
            .unwrap();

        assert_eq!(task.specialist.as_deref(), Some("security-specialist"));
        assert_eq!(task.assigned_to.as_deref(), Some("sec-1"));
        assert_eq!(task.created_by.as_deref(), Some("lead"));

        let (_, envelope) = inbox.next().await.unwrap();
        assert_eq!(envelope.event_kind(), Some(EventKind::TaskAssigned));
        assert_eq!(envelope.payload["taskId"], task.id.as_str());
    }

    #[tokio::test]
    async fn test_send_task_without_matching_agent_stays_unassigned() {
        let coordinator = Coordinator::in_memory();
        let task = coordinator
            .send_task("lead", None, NewTask::new("Write the guide").with_kind(TaskKind::Docs))
            .await
            .unwrap();
        assert_eq!(task.specialist.as_deref(), Some("tech-writer"));
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_input_validation_precedes_writes() {
        let coordinator = Coordinator::in_memory();

        let err = coordinator
            .send_task("lead", None, NewTask::new("x".repeat(201)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidInput { field: "title", .. }));

        let err = coordinator
            .send_task("bad id!", None, NewTask::new("ok"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidInput { .. }));

        assert!(coordinator.list_tasks(10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_ids_are_bounded() {
        let coordinator = Coordinator::in_memory();

        let long = "x".repeat(100_000);
        for id in ["", long.as_str(), "a b;rm -rf /\n"] {
            let err = coordinator
                .broadcast_task("lead", NewTask::new("Bad id").with_id(id))
                .await
                .unwrap_err();
            assert!(matches!(err, CoordinationError::InvalidInput { field: "task_id", .. }));
        }

        let err = coordinator
            .broadcast_task("lead", NewTask::new("Bad dep").with_dependencies(["../x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidInput { field: "task_id", .. }));
        assert!(coordinator.list_tasks(10, None).await.unwrap().is_empty());

        for err in [
            coordinator.claim_task("a b", "a1").await.unwrap_err(),
            coordinator.cancel_task("").await.unwrap_err(),
            coordinator.release_task("x;y", "a1").await.unwrap_err(),
        ] {
            assert!(matches!(err, CoordinationError::InvalidInput { field: "task_id", .. }));
        }
    }

    #[tokio::test]
    async fn test_broadcast_task_announces_on_broadcast_channel() {
        let coordinator = Coordinator::in_memory();
        let mut listener = coordinator.subscribe(&[Channel::Broadcast]).await.unwrap();

        let task = coordinator
            .broadcast_task("lead", NewTask::new("Anyone can take this"))
            .await
            .unwrap();

        let (channel, envelope) = listener.next().await.unwrap();
        assert_eq!(channel, "broadcast");
        assert_eq!(envelope.kind, TASK_AVAILABLE);
        assert!(envelope.broadcast);
        assert_eq!(envelope.payload["taskId"], task.id.as_str());
    }

    #[tokio::test]
    async fn test_full_lifecycle_updates_agent_status() {
        let coordinator = Coordinator::in_memory();
        registered(&coordinator, "a1", &["generalist"]).await;
        let task = coordinator
            .broadcast_task("lead", NewTask::new("Add endpoint"))
            .await
            .unwrap();

        let claimed = coordinator.claim_next("a1").await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        let agent = coordinator.agents().get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);

        coordinator.start_task(&task.id, "a1").await.unwrap();
        let done = coordinator
            .complete_task(&task.id, "a1", json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.claimed_by.is_none());

        let agent = coordinator.agents().get("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_only_claimant_may_complete() {
        let coordinator = Coordinator::in_memory();
        let task = coordinator
            .broadcast_task("lead", NewTask::new("Contested"))
            .await
            .unwrap();
        assert!(coordinator.claim_task(&task.id, "a1").await.unwrap().is_claimed());

        let err = coordinator
            .complete_task(&task.id, "a2", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ClaimConflict { .. }));

        let outcome = coordinator.claim_task(&task.id, "a2").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Rejected(ClaimRejection::AlreadyClaimed {
                holder: Some("a1".into())
            })
        );
    }

    #[tokio::test]
    async fn test_claim_next_skips_tasks_assigned_elsewhere() {
        let coordinator = Coordinator::in_memory();
        coordinator
            .send_task("lead", Some("a2"), NewTask::new("For a2").with_priority(9))
            .await
            .unwrap();
        let open = coordinator
            .broadcast_task("lead", NewTask::new("Open").with_priority(1))
            .await
            .unwrap();

        let claimed = coordinator.claim_next("a1").await.unwrap().unwrap();
        assert_eq!(claimed.id, open.id);
        assert!(coordinator.claim_next("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_notifies_holder() {
        let coordinator = Coordinator::in_memory();
        let task = coordinator
            .broadcast_task("lead", NewTask::new("Soon cancelled"))
            .await
            .unwrap();
        coordinator.claim_task(&task.id, "a1").await.unwrap();
        let mut inbox = coordinator
            .subscribe(&[Channel::Direct("a1".into())])
            .await
            .unwrap();

        let cancelled = coordinator.cancel_task(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let (_, envelope) = inbox.next().await.unwrap();
        assert_eq!(envelope.event_kind(), Some(EventKind::TaskCancelled));
    }

    #[tokio::test]
    async fn test_lock_events_use_canonical_path() {
        let coordinator = Coordinator::in_memory();
        let mut events = coordinator.subscribe(&[Channel::System]).await.unwrap();

        coordinator.lock("./src//main.rs", "a1", None).await.unwrap();
        coordinator.unlock("src/main.rs", "a1").await.unwrap();

        let (_, acquired) = events.next().await.unwrap();
        assert_eq!(acquired.event_kind(), Some(EventKind::LockAcquired));
        assert_eq!(acquired.payload["path"], "src/main.rs");
        let (_, released) = events.next().await.unwrap();
        assert_eq!(released.event_kind(), Some(EventKind::LockReleased));
    }

    #[tokio::test]
    async fn test_validate_dependencies_is_a_dry_run() {
        let coordinator = Coordinator::in_memory();
        let a = coordinator
            .broadcast_task("lead", NewTask::new("A").with_id("A"))
            .await
            .unwrap();

        let report = coordinator
            .validate_dependencies(None, &[a.id.clone(), "ghost".into()])
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(report.missing, vec!["ghost".to_string()]);

        let report = coordinator
            .validate_dependencies(Some("A"), &["A".into()])
            .await
            .unwrap();
        assert!(report.self_dependency);
        assert_eq!(coordinator.list_tasks(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_artifacts_round_trip_and_reject_traversal() {
        let coordinator = Coordinator::in_memory();
        let shared = coordinator
            .share_artifact("a1", "plan.md", json!("# Plan"), None)
            .await
            .unwrap();
        let loaded = coordinator.get_artifact("plan.md").await.unwrap().unwrap();
        assert_eq!(loaded, shared);
        assert!(coordinator.get_artifact("other").await.unwrap().is_none());

        let err = coordinator
            .share_artifact("a1", "..", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::PathTraversalRejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_artifact_ttl_expires() {
        let coordinator = Coordinator::in_memory();
        coordinator
            .share_artifact("a1", "scratch", json!(1), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(coordinator.get_artifact("scratch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_message_direct_and_broadcast() {
        let coordinator = Coordinator::in_memory();
        let mut a2 = coordinator
            .subscribe(&[Channel::Direct("a2".into()), Channel::Broadcast])
            .await
            .unwrap();

        assert_eq!(
            coordinator
                .send_message("a1", Some("a2"), "question", json!({"q": "?"}))
                .await
                .unwrap(),
            1
        );
        coordinator
            .send_message("a1", None, "note", Value::Null)
            .await
            .unwrap();

        assert_eq!(a2.next().await.unwrap().1.kind, "question");
        assert!(a2.next().await.unwrap().1.broadcast);
    }

    #[test]
    fn test_sanitize_search_query_delegates() {
        let coordinator = Coordinator::in_memory();
        assert_eq!(
            coordinator.sanitize_search_query("  tokio select ").unwrap(),
            "tokio select"
        );
        assert!(coordinator.sanitize_search_query("a; rm -rf /").is_err());
    }
}
