// Bounded retry for transient store failures.

use super::{
    ClaimScript, ClaimVerdict, Conditional, CoordinationStore, Expect, RecordSwap, StoreError,
    StoreResult, Subscription,
};
use crate::observability::store_metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delays between attempts: base, 2*base, 4*base.. capped at `max_delay_ms`.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let use_jitter = self.jitter;
        // from_millis(2) doubles each step; the factor scales the first delay to base
        ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.max_attempts.saturating_sub(1) as usize)
            .map(move |d| if use_jitter { jitter(d) } else { d })
    }
}

/// Wraps a backend and retries connectivity failures with exponential backoff.
///
/// Non-retryable errors are returned immediately. Once retries are exhausted the last
/// error becomes [`StoreError::Unavailable`].
///
/// Conditional writes are retried too. A retried `set_nx` whose first reply was lost
/// reports the key as taken; the lease then lapses through its TTL.
#[derive(Debug, Clone)]
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: CoordinationStore> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, mut action: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let metrics = store_metrics();
        metrics.record_operation();

        let mut attempts: u32 = 0;
        let result = RetryIf::spawn(
            self.config.strategy(),
            || {
                attempts += 1;
                action()
            },
            |err: &StoreError| {
                let retry = err.is_retryable();
                if retry {
                    warn!(operation, error = %err, "Store operation failed (retryable)");
                }
                retry
            },
        )
        .await;
        metrics.record_retries(attempts.saturating_sub(1));

        match result {
            Ok(value) => Ok(value),
            Err(err) if err.is_retryable() => {
                metrics.record_failure();
                Err(StoreError::Unavailable {
                    operation: operation.to_string(),
                    attempts,
                    last_error: err.to_string(),
                })
            }
            Err(err) => {
                metrics.record_failure();
                debug!(operation, error = %err, "Store operation failed (non-retryable)");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for RetryingStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run("get", || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.run("set", || self.inner.set(key, value, ttl)).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.run("set_nx", || self.inner.set_nx(key, value, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.run("delete", || self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.run("exists", || self.inner.exists(key)).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.run("ttl", || self.inner.ttl(key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.run("scan_prefix", || self.inner.scan_prefix(prefix))
            .await
    }

    async fn compare_and_delete(&self, key: &str, expect: &Expect) -> StoreResult<Conditional> {
        self.run("compare_and_delete", || {
            self.inner.compare_and_delete(key, expect)
        })
        .await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expect: &Expect,
        ttl: Duration,
    ) -> StoreResult<Conditional> {
        self.run("compare_and_expire", || {
            self.inner.compare_and_expire(key, expect, ttl)
        })
        .await
    }

    async fn swap_record(&self, swap: &RecordSwap) -> StoreResult<bool> {
        self.run("swap_record", || self.inner.swap_record(swap))
            .await
    }

    async fn claim_task(&self, claim: &ClaimScript) -> StoreResult<ClaimVerdict> {
        self.run("claim_task", || self.inner.claim_task(claim))
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.run("hset", || self.inner.hset(key, field, value))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.run("hget", || self.inner.hget(key, field)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.run("hdel", || self.inner.hdel(key, field)).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.run("hgetall", || self.inner.hgetall(key)).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.run("zadd", || self.inner.zadd(key, member, score))
            .await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.run("zrem", || self.inner.zrem(key, member)).await
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run("zrange", || self.inner.zrange(key)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.run("publish", || self.inner.publish(channel, message))
            .await
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        self.run("subscribe", || self.inner.subscribe(channels))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockCoordinationStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: false,
        }
    }

    #[test]
    fn test_strategy_doubles_from_base() {
        let delays: Vec<Duration> = fast_config().strategy().collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn test_strategy_respects_max_delay() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter: false,
        };
        assert!(config
            .strategy()
            .all(|d| d <= Duration::from_millis(2_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failure() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = attempt_count.clone();

        let mut mock = MockCoordinationStore::new();
        mock.expect_get().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Connection("connection reset".into()))
            } else {
                Ok(Some("value".into()))
            }
        });

        let store = RetryingStore::new(mock, fast_config());
        let value = store.get("k").await.unwrap();

        assert_eq!(value.as_deref(), Some("value"));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_become_unavailable() {
        let mut mock = MockCoordinationStore::new();
        mock.expect_set_nx()
            .times(3)
            .returning(|_, _, _| Err(StoreError::Timeout("read timed out".into())));

        let store = RetryingStore::new(mock, fast_config());
        let err = store
            .set_nx("locks:file:a", "{}", Duration::from_secs(1))
            .await
            .unwrap_err();

        match err {
            StoreError::Unavailable {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "set_nx");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let mut mock = MockCoordinationStore::new();
        mock.expect_hgetall()
            .times(1)
            .returning(|_| Err(StoreError::Backend("WRONGTYPE".into())));

        let store = RetryingStore::new(mock, fast_config());
        let err = store.hgetall("agents").await.unwrap_err();

        // Should fail immediately without retries
        assert_eq!(err, StoreError::Backend("WRONGTYPE".into()));
    }
}
