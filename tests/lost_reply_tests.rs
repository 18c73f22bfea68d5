//! Writes whose reply is lost on the wire. The retrying store re-sends them and the
//! task store must recognise its own earlier write instead of reporting a conflict.

use agent_hive::store::{
    ClaimScript, ClaimVerdict, Conditional, CoordinationStore, Expect, MemoryStore,
    RecordSwap, RetryConfig, RetryingStore, SharedStore, StoreError, StoreResult,
    Subscription,
};
use agent_hive::tasks::{ClaimOutcome, NewTask, Task, TaskStatus, TaskStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store that applies the next claim or swap and then drops its reply.
#[derive(Default)]
struct DroppedReply {
    inner: MemoryStore,
    drop_claim: Arc<AtomicBool>,
    drop_swap: Arc<AtomicBool>,
}

fn dropped() -> StoreError {
    StoreError::Connection("connection reset by peer".into())
}

#[async_trait]
impl CoordinationStore for DroppedReply {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn compare_and_delete(&self, key: &str, expect: &Expect) -> StoreResult<Conditional> {
        self.inner.compare_and_delete(key, expect).await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expect: &Expect,
        ttl: Duration,
    ) -> StoreResult<Conditional> {
        self.inner.compare_and_expire(key, expect, ttl).await
    }

    async fn swap_record(&self, swap: &RecordSwap) -> StoreResult<bool> {
        let applied = self.inner.swap_record(swap).await?;
        if self.drop_swap.swap(false, Ordering::SeqCst) {
            return Err(dropped());
        }
        Ok(applied)
    }

    async fn claim_task(&self, claim: &ClaimScript) -> StoreResult<ClaimVerdict> {
        let verdict = self.inner.claim_task(claim).await?;
        if self.drop_claim.swap(false, Ordering::SeqCst) {
            return Err(dropped());
        }
        Ok(verdict)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.inner.hset(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.zrem(key, member).await
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.zrange(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        self.inner.subscribe(channels).await
    }
}

/// Switches that make the next claim or swap lose its reply.
struct Faults {
    drop_claim: Arc<AtomicBool>,
    drop_swap: Arc<AtomicBool>,
}

fn flaky_backlog() -> (Faults, TaskStore) {
    let backend = DroppedReply::default();
    let faults = Faults {
        drop_claim: backend.drop_claim.clone(),
        drop_swap: backend.drop_swap.clone(),
    };
    let config = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 100,
        jitter: false,
    };
    let store: SharedStore = Arc::new(RetryingStore::new(backend, config));
    (faults, TaskStore::new(store))
}

#[tokio::test(start_paused = true)]
async fn claim_whose_reply_was_lost_still_goes_to_the_claimant() {
    let (faults, tasks) = flaky_backlog();
    tasks
        .enqueue(Task::new(NewTask::new("Refactor parser").with_id("T")))
        .await
        .unwrap();

    faults.drop_claim.store(true, Ordering::SeqCst);
    let outcome = tasks.claim("T", "agent-1").await.unwrap();

    match outcome {
        ClaimOutcome::Claimed(task) => {
            assert_eq!(task.status, TaskStatus::Claimed);
            assert_eq!(task.claimed_by.as_deref(), Some("agent-1"));
        }
        other => panic!("claimant was told {other:?}"),
    }
    assert_eq!(tasks.claim_holder("T").await.unwrap().as_deref(), Some("agent-1"));

    // Another agent still loses.
    assert!(!tasks.claim("T", "agent-2").await.unwrap().is_claimed());
}

#[tokio::test(start_paused = true)]
async fn enqueue_whose_reply_was_lost_is_not_a_duplicate() {
    let (faults, tasks) = flaky_backlog();

    faults.drop_swap.store(true, Ordering::SeqCst);
    let task = tasks
        .enqueue(Task::new(NewTask::new("Write docs").with_id("D")))
        .await
        .unwrap();

    assert_eq!(task.id, "D");
    assert_eq!(tasks.get("D").await.unwrap().status, TaskStatus::Pending);
    assert_eq!(tasks.peek(10, None).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn enqueue_over_a_different_record_is_still_rejected() {
    let (_, tasks) = flaky_backlog();
    tasks
        .enqueue(Task::new(NewTask::new("First").with_id("D")))
        .await
        .unwrap();

    assert!(tasks
        .enqueue(Task::new(NewTask::new("Second").with_id("D")))
        .await
        .is_err());
    assert_eq!(tasks.get("D").await.unwrap().title, "First");
}
