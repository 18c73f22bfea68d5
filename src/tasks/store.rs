use super::lifecycle::{self, TaskEvent, Transition};
use super::types::{validate_priority, ClaimOutcome, ClaimRejection, Task, TaskStatus};
use crate::dependency::{DependencyGraph, DependencyValidator};
use crate::error::{CoordinationError, HiveResult};
use crate::observability::store_metrics;
use crate::store::{keys, ClaimScript, ClaimVerdict, IndexEntry, RecordSwap, SharedStore};
use chrono::Utc;
use futures::future::try_join_all;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(3600);

/// Bound on optimistic read-compute-swap rounds before giving up.
const MAX_CAS_ATTEMPTS: u32 = 5;

fn now_millis() -> f64 {
    Utc::now().timestamp_millis() as f64
}

fn status_entry(status: TaskStatus, task_id: &str, score: f64) -> IndexEntry {
    IndexEntry {
        key: keys::tasks_by_status(status.as_str()),
        member: task_id.to_string(),
        score,
    }
}

/// Rejects the transition when the task is held by anyone other than `agent_id`.
/// Unheld tasks pass so the state machine can report the real problem.
fn require_holder(agent_id: &str) -> impl Fn(&Task) -> HiveResult<()> + '_ {
    move |task| {
        if task.status.is_held() && task.claimed_by.as_deref() != Some(agent_id) {
            return Err(CoordinationError::ClaimConflict {
                task_id: task.id.clone(),
                holder: task.claimed_by.clone(),
            });
        }
        Ok(())
    }
}

/// Priority-ordered task backlog with dependency-gated, exclusive claims.
#[derive(Clone)]
pub struct TaskStore {
    store: SharedStore,
    claim_ttl: Duration,
    validator: DependencyValidator,
}

impl TaskStore {
    pub fn new(store: SharedStore) -> Self {
        Self::with_claim_ttl(store, DEFAULT_CLAIM_TTL)
    }

    pub fn with_claim_ttl(store: SharedStore, claim_ttl: Duration) -> Self {
        Self {
            store,
            claim_ttl,
            validator: DependencyValidator::new(),
        }
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_ttl
    }

    /// Admit a new task into the backlog.
    ///
    /// Priority bounds, self-dependency, dependency existence and cycles are all checked
    /// before anything is written. The record, its queue entry and its `pending` index
    /// entry are then created in one guarded swap.
    pub async fn enqueue(&self, task: Task) -> HiveResult<Task> {
        validate_priority(task.priority)?;
        if task.status != TaskStatus::Pending {
            return Err(CoordinationError::invalid(
                "status",
                format!("new tasks must be pending, got {}", task.status),
            ));
        }
        if task.dependencies.iter().any(|dep| dep == &task.id) {
            return Err(CoordinationError::SelfDependency(task.id.clone()));
        }
        for dep in &task.dependencies {
            if !self.store.exists(&keys::task_data(dep)).await? {
                return Err(CoordinationError::not_found("task", dep.clone()));
            }
        }

        let graph = self.dependency_graph().await?;
        self.validator
            .check_admission(&graph, &task.id, &task.dependencies)?;

        let swap = RecordSwap {
            key: keys::task_data(&task.id),
            expected: None,
            replacement: serde_json::to_string(&task)?,
            index_add: vec![
                IndexEntry {
                    key: keys::TASK_QUEUE.to_string(),
                    member: task.id.clone(),
                    score: task.queue_score(),
                },
                status_entry(
                    TaskStatus::Pending,
                    &task.id,
                    task.created_at.timestamp_millis() as f64,
                ),
            ],
            ..RecordSwap::default()
        };

        if !self.store.swap_record(&swap).await? {
            // A retried swap finds the record its own lost attempt already wrote.
            let stored = self.store.get(&swap.key).await?;
            if stored.as_deref() != Some(swap.replacement.as_str()) {
                return Err(CoordinationError::invalid(
                    "id",
                    format!("task {} already exists", task.id),
                ));
            }
            debug!(task_id = %task.id, "Enqueue already applied");
        }

        info!(
            task_id = %task.id,
            priority = task.priority,
            dependencies = task.dependencies.len(),
            "Task enqueued"
        );
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> HiveResult<Task> {
        self.load(task_id)
            .await?
            .map(|(_, task)| task)
            .ok_or_else(|| CoordinationError::not_found("task", task_id))
    }

    pub async fn find(&self, task_id: &str) -> HiveResult<Option<Task>> {
        Ok(self.load(task_id).await?.map(|(_, task)| task))
    }

    /// Raw record plus its parsed form. The raw string is the guard for swaps.
    async fn load(&self, task_id: &str) -> HiveResult<Option<(String, Task)>> {
        let key = keys::task_data(task_id);
        match self.store.get(&key).await? {
            Some(raw) => {
                let task: Task = serde_json::from_str(&raw)?;
                Ok(Some((raw, task)))
            }
            None => Ok(None),
        }
    }

    /// Claim a pending task for `agent_id`.
    ///
    /// Exclusivity and dependency satisfaction are decided by a single atomic store
    /// operation. Losing a race is reported as [`ClaimOutcome::Rejected`], not an error.
    pub async fn claim(&self, task_id: &str, agent_id: &str) -> HiveResult<ClaimOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (raw, task) = self
                .load(task_id)
                .await?
                .ok_or_else(|| CoordinationError::not_found("task", task_id))?;

            if task.status.is_held() {
                if self.held_by(&task, agent_id).await? {
                    return Ok(ClaimOutcome::Claimed(task));
                }
                return Ok(self.reject(
                    task_id,
                    agent_id,
                    ClaimRejection::AlreadyClaimed {
                        holder: task.claimed_by,
                    },
                ));
            }
            if task.status != TaskStatus::Pending {
                return Ok(self.reject(
                    task_id,
                    agent_id,
                    ClaimRejection::NotPending {
                        status: task.status,
                    },
                ));
            }

            let mut claimed = task.clone();
            claimed.status = TaskStatus::Claimed;
            claimed.claimed_by = Some(agent_id.to_string());

            let script = ClaimScript {
                task_key: keys::task_data(task_id),
                claim_key: keys::task_claim(task_id),
                expected: raw,
                replacement: serde_json::to_string(&claimed)?,
                agent_id: agent_id.to_string(),
                ttl: self.claim_ttl,
                dependencies: task
                    .dependencies
                    .iter()
                    .map(|dep| (dep.clone(), keys::task_data(dep)))
                    .collect(),
                index_remove: status_entry(TaskStatus::Pending, task_id, 0.0),
                index_add: status_entry(TaskStatus::Claimed, task_id, now_millis()),
            };

            match self.store.claim_task(&script).await? {
                ClaimVerdict::Claimed => {
                    info!(task_id, agent_id, "Task claimed");
                    return Ok(ClaimOutcome::Claimed(claimed));
                }
                ClaimVerdict::AlreadyClaimed { holder } => {
                    if holder.as_deref() == Some(agent_id) {
                        if let Some((_, task)) = self.load(task_id).await? {
                            if self.held_by(&task, agent_id).await? {
                                return Ok(ClaimOutcome::Claimed(task));
                            }
                        }
                    }
                    return Ok(self.reject(
                        task_id,
                        agent_id,
                        ClaimRejection::AlreadyClaimed { holder },
                    ));
                }
                ClaimVerdict::DependencyNotMet(dependency) => {
                    return Ok(self.reject(
                        task_id,
                        agent_id,
                        ClaimRejection::DependencyNotMet { dependency },
                    ));
                }
                ClaimVerdict::Stale => {
                    debug!(task_id, agent_id, attempt, "Task changed during claim, retrying");
                }
                ClaimVerdict::Missing => {
                    return Err(CoordinationError::not_found("task", task_id));
                }
            }
        }

        Ok(self.reject(task_id, agent_id, ClaimRejection::Contended))
    }

    /// True when `agent_id` holds both the record and a live lease on it.
    /// Claiming again, or a retry after a lost reply, is then a success.
    async fn held_by(&self, task: &Task, agent_id: &str) -> HiveResult<bool> {
        if !task.status.is_held() || task.claimed_by.as_deref() != Some(agent_id) {
            return Ok(false);
        }
        let held = self.claim_holder(&task.id).await?.as_deref() == Some(agent_id);
        if held {
            debug!(task_id = %task.id, agent_id, "Claim already held by caller");
        }
        Ok(held)
    }

    fn reject(&self, task_id: &str, agent_id: &str, rejection: ClaimRejection) -> ClaimOutcome {
        store_metrics().record_claim_conflict();
        debug!(task_id, agent_id, reason = %rejection, "Claim rejected");
        ClaimOutcome::Rejected(rejection)
    }

    /// `claimed` -> `in_progress`. Only the claimant may start the task.
    pub async fn start(&self, task_id: &str, agent_id: &str) -> HiveResult<Task> {
        self.transition(task_id, TaskEvent::Start, require_holder(agent_id), |task| {
            task.started_at = Some(Utc::now())
        })
        .await
    }

    /// Mark a task completed. Completing an already completed task is a no-op.
    pub async fn complete(&self, task_id: &str, result: Value) -> HiveResult<Task> {
        self.transition(
            task_id,
            TaskEvent::Complete,
            |_| Ok(()),
            |task| {
                task.completed_at = Some(Utc::now());
                task.result = Some(result.clone());
            },
        )
        .await
    }

    /// Mark a task failed. Failing an already failed task is a no-op.
    pub async fn fail(&self, task_id: &str, error: Value) -> HiveResult<Task> {
        self.transition(
            task_id,
            TaskEvent::Fail,
            |_| Ok(()),
            |task| {
                task.completed_at = Some(Utc::now());
                task.error = Some(error.clone());
            },
        )
        .await
    }

    pub async fn cancel(&self, task_id: &str) -> HiveResult<Task> {
        self.transition(
            task_id,
            TaskEvent::Cancel,
            |_| Ok(()),
            |task| task.completed_at = Some(Utc::now()),
        )
        .await
    }

    /// Return a claimed or in-progress task to `pending` and drop its lease.
    pub async fn release_claim(&self, task_id: &str) -> HiveResult<Task> {
        self.transition(task_id, TaskEvent::Release, |_| Ok(()), |task| {
            task.started_at = None
        })
        .await
    }

    /// [`TaskStore::complete`] that also requires `agent_id` to hold the claim.
    pub async fn complete_as(&self, task_id: &str, agent_id: &str, result: Value) -> HiveResult<Task> {
        self.transition(task_id, TaskEvent::Complete, require_holder(agent_id), |task| {
            task.completed_at = Some(Utc::now());
            task.result = Some(result.clone());
        })
        .await
    }

    /// [`TaskStore::fail`] that also requires `agent_id` to hold the claim.
    pub async fn fail_as(&self, task_id: &str, agent_id: &str, error: Value) -> HiveResult<Task> {
        self.transition(task_id, TaskEvent::Fail, require_holder(agent_id), |task| {
            task.completed_at = Some(Utc::now());
            task.error = Some(error.clone());
        })
        .await
    }

    /// [`TaskStore::release_claim`] restricted to the current claimant.
    pub async fn release_as(&self, task_id: &str, agent_id: &str) -> HiveResult<Task> {
        self.transition(task_id, TaskEvent::Release, require_holder(agent_id), |task| {
            task.started_at = None
        })
        .await
    }

    /// Read-compute-swap loop shared by every non-claim transition.
    ///
    /// `check` runs against the current record before the state machine is consulted;
    /// `apply` fills in the fields specific to the event.
    async fn transition<C, A>(
        &self,
        task_id: &str,
        event: TaskEvent,
        check: C,
        apply: A,
    ) -> HiveResult<Task>
    where
        C: Fn(&Task) -> HiveResult<()>,
        A: Fn(&mut Task),
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (raw, task) = self
                .load(task_id)
                .await?
                .ok_or_else(|| CoordinationError::not_found("task", task_id))?;
            check(&task)?;

            let from = task.status;
            let to = match lifecycle::apply(from, event) {
                Some(Transition::Move(to)) => to,
                Some(Transition::Unchanged) => {
                    debug!(task_id, status = %from, ?event, "Transition already applied");
                    return Ok(task);
                }
                None => {
                    return Err(CoordinationError::InvalidTransition {
                        task_id: task_id.to_string(),
                        from,
                        to: event.target(),
                    })
                }
            };

            let mut next = task.clone();
            next.status = to;
            apply(&mut next);

            let mut delete = Vec::new();
            if to.is_terminal() || to == TaskStatus::Pending {
                next.claimed_by = None;
                delete.push(keys::task_claim(task_id));
            }

            let swap = RecordSwap {
                key: keys::task_data(task_id),
                expected: Some(raw),
                replacement: serde_json::to_string(&next)?,
                index_remove: vec![status_entry(from, task_id, 0.0)],
                index_add: vec![status_entry(to, task_id, now_millis())],
                delete,
            };

            if self.store.swap_record(&swap).await? {
                info!(task_id, from = %from, to = %to, "Task transitioned");
                return Ok(next);
            }
            debug!(task_id, attempt, ?event, "Task changed during update, retrying");
        }

        warn!(task_id, ?event, "Gave up updating contended task");
        Err(CoordinationError::ClaimConflict {
            task_id: task_id.to_string(),
            holder: None,
        })
    }

    /// Tasks in queue order (priority, then age), optionally filtered by status.
    pub async fn peek(&self, limit: usize, status: Option<TaskStatus>) -> HiveResult<Vec<Task>> {
        let tasks = self.all_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|task| status.map_or(true, |s| task.status == s))
            .take(limit)
            .collect())
    }

    /// Pending tasks in queue order whose dependencies are all completed.
    pub async fn claimable(&self) -> HiveResult<Vec<Task>> {
        let tasks = self.all_tasks().await?;
        let completed: std::collections::HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
            .cloned()
            .collect())
    }

    /// Every task record reachable from the priority index, in queue order.
    async fn all_tasks(&self) -> HiveResult<Vec<Task>> {
        let ids = self.store.zrange(keys::TASK_QUEUE).await?;
        let loaded = try_join_all(ids.iter().map(|id| self.load(id))).await?;
        Ok(loaded.into_iter().flatten().map(|(_, task)| task).collect())
    }

    /// Dependency graph of every task currently in the backlog.
    pub async fn dependency_graph(&self) -> HiveResult<DependencyGraph> {
        Ok(self
            .all_tasks()
            .await?
            .into_iter()
            .map(|task| (task.id, task.dependencies))
            .collect())
    }

    /// Ids of claimed or in-progress tasks whose claim lease has lapsed.
    pub async fn orphaned_claims(&self) -> HiveResult<Vec<String>> {
        let mut orphans = Vec::new();
        for status in [TaskStatus::Claimed, TaskStatus::InProgress] {
            let ids = self
                .store
                .zrange(&keys::tasks_by_status(status.as_str()))
                .await?;
            for id in ids {
                if !self.store.exists(&keys::task_claim(&id)).await? {
                    orphans.push(id);
                }
            }
        }
        Ok(orphans)
    }

    /// Release every orphaned claim back to `pending`. Returns the recovered ids.
    pub async fn recover_orphans(&self) -> HiveResult<Vec<String>> {
        let mut recovered = Vec::new();
        for id in self.orphaned_claims().await? {
            match self.release_claim(&id).await {
                Ok(_) => {
                    warn!(task_id = %id, "Recovered orphaned claim");
                    recovered.push(id);
                }
                Err(CoordinationError::InvalidTransition { .. }) => {
                    // Finished between the scan and the release.
                    debug!(task_id = %id, "Orphan already left the claimed states");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(recovered)
    }

    /// Remaining claim lease, `None` if the task is not claimed.
    pub async fn claim_ttl(&self, task_id: &str) -> HiveResult<Option<Duration>> {
        Ok(self.store.ttl(&keys::task_claim(task_id)).await?)
    }

    /// Current holder of the claim lease.
    pub async fn claim_holder(&self, task_id: &str) -> HiveResult<Option<String>> {
        Ok(self.store.get(&keys::task_claim(task_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::{NewTask, TaskKind};
    use serde_json::json;
    use std::sync::Arc;

    fn task_store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryStore::new()))
    }

    async fn enqueue(store: &TaskStore, id: &str, priority: u8, deps: &[&str]) -> Task {
        store
            .enqueue(Task::new(
                NewTask::new(format!("task {id}"))
                    .with_id(id)
                    .with_priority(priority)
                    .with_dependencies(deps.iter().copied()),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_sets_holder_and_lease() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;

        let task = store.claim("t1", "agent-1").await.unwrap().into_task().unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by.as_deref(), Some("agent-1"));
        assert_eq!(store.claim_holder("t1").await.unwrap().as_deref(), Some("agent-1"));
        assert!(store.claim_ttl("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_claim_reports_holder() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;
        store.claim("t1", "agent-1").await.unwrap();

        let outcome = store.claim("t1", "agent-2").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Rejected(ClaimRejection::AlreadyClaimed {
                holder: Some("agent-1".into())
            })
        );
    }

    #[tokio::test]
    async fn test_holder_reclaim_is_success() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;
        store.claim("t1", "agent-1").await.unwrap();

        let task = store.claim("t1", "agent-1").await.unwrap().into_task().unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn test_claim_blocked_by_pending_dependency() {
        let store = task_store();
        enqueue(&store, "a", 5, &[]).await;
        enqueue(&store, "b", 5, &["a"]).await;

        let outcome = store.claim("b", "agent-1").await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Rejected(ClaimRejection::DependencyNotMet {
                dependency: "a".into()
            })
        );
        // Nothing changed.
        assert_eq!(store.get("b").await.unwrap().status, TaskStatus::Pending);
        assert!(store.claim_holder("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;
        store.claim("t1", "agent-1").await.unwrap();

        let first = store.complete("t1", json!({"ok": true})).await.unwrap();
        let second = store.complete("t1", json!({"ok": false})).await.unwrap();

        assert_eq!(first.completed_at, second.completed_at);
        assert_eq!(second.result, Some(json!({"ok": true})));
        assert!(second.claimed_by.is_none());
        assert!(store.claim_holder("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_claimant() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;
        store.claim("t1", "agent-1").await.unwrap();

        let err = store.start("t1", "agent-2").await.unwrap_err();
        assert!(matches!(err, CoordinationError::ClaimConflict { .. }));

        let task = store.start("t1", "agent-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;

        let err = store.complete("t1", json!(null)).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_release_returns_task_to_pending() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;
        store.claim("t1", "agent-1").await.unwrap();

        let task = store.release_claim("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.claimed_by.is_none());
        assert!(store.claim("t1", "agent-2").await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_peek_orders_by_priority() {
        let store = task_store();
        enqueue(&store, "low", 2, &[]).await;
        enqueue(&store, "high", 9, &[]).await;
        enqueue(&store, "mid", 5, &[]).await;

        let ids: Vec<String> = store
            .peek(10, None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);

        store.claim("high", "agent-1").await.unwrap();
        let pending = store.peek(1, Some(TaskStatus::Pending)).await.unwrap();
        assert_eq!(pending[0].id, "mid");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_priority_and_missing_dependency() {
        let store = task_store();
        let err = store
            .enqueue(Task::new(NewTask::new("x").with_priority(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidInput { field: "priority", .. }));

        let err = store
            .enqueue(Task::new(NewTask::new("x").with_dependencies(["ghost"])))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_id() {
        let store = task_store();
        enqueue(&store, "t1", 5, &[]).await;
        let err = store
            .enqueue(Task::new(
                NewTask::new("again").with_id("t1").with_kind(TaskKind::Docs),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidInput { field: "id", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_is_orphaned_and_recoverable() {
        let store = TaskStore::with_claim_ttl(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(10),
        );
        enqueue(&store, "t1", 5, &[]).await;
        store.claim("t1", "agent-1").await.unwrap();
        assert!(store.orphaned_claims().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.orphaned_claims().await.unwrap(), vec!["t1"]);
        assert_eq!(store.recover_orphans().await.unwrap(), vec!["t1"]);
        assert_eq!(store.get("t1").await.unwrap().status, TaskStatus::Pending);
        assert!(store.orphaned_claims().await.unwrap().is_empty());
    }
}
