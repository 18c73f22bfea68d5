//! Coordination store abstraction.
//!
//! Every component of the kernel talks to the shared store only through
//! [`CoordinationStore`]. The trait exposes plain reads and writes for non-critical
//! paths and a handful of conditional operations that a backend must execute as one
//! indivisible step: set-if-absent, compare-and-delete, compare-and-expire, guarded
//! record swaps and the task claim.
//!
//! Backends:
//! - [`RedisStore`] runs the conditional operations as server-side Lua scripts.
//! - [`MemoryStore`] runs them inside a single critical section (single process only).
//! - [`RetryingStore`] decorates either with bounded exponential backoff.

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod retry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use retry::{RetryConfig, RetryingStore};

pub type StoreResult<T> = Result<T, StoreError>;

/// Store handle shared by every kernel component.
pub type SharedStore = Arc<dyn CoordinationStore>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Unavailable {
        operation: String,
        attempts: u32,
        last_error: String,
    },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("malformed value at {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    /// Connectivity failures are worth retrying; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

/// Condition a conditional delete/expire checks against the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// The whole stored string equals this value.
    Value(String),
    /// The stored value is a JSON object whose string `field` equals `value`.
    JsonField { field: String, value: String },
}

impl Expect {
    pub fn json_field(field: impl Into<String>, value: impl Into<String>) -> Self {
        Expect::JsonField {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, stored: &str) -> bool {
        match self {
            Expect::Value(expected) => stored == expected,
            Expect::JsonField { field, value } => serde_json::from_str::<serde_json::Value>(stored)
                .ok()
                .and_then(|doc| doc.get(field).and_then(|v| v.as_str()).map(|s| s == value))
                .unwrap_or(false),
        }
    }
}

/// Result of a conditional operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional {
    Applied,
    /// The key exists but did not match; carries the current value.
    Mismatch(String),
    Missing,
}

/// Member to insert into or remove from a sorted-set index as part of a swap.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: String,
    pub member: String,
    pub score: f64,
}

/// Atomic replacement of a JSON record plus its secondary index bookkeeping.
///
/// Applied only if the record still equals `expected` (`None` = the key must be absent).
/// When applied, `index_remove` entries are removed, `index_add` entries are inserted and
/// `delete` keys are dropped, all in the same step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSwap {
    pub key: String,
    pub expected: Option<String>,
    pub replacement: String,
    pub index_add: Vec<IndexEntry>,
    pub index_remove: Vec<IndexEntry>,
    pub delete: Vec<String>,
}

/// Inputs for the atomic claim of a task.
///
/// A backend must evaluate, in order and without interleaving: the record exists, the
/// claim key is absent, every dependency record has `"status": "completed"`, and the
/// record still equals `expected`. Only then does it write the lease, swap the record and
/// move the status index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimScript {
    pub task_key: String,
    pub claim_key: String,
    pub expected: String,
    pub replacement: String,
    pub agent_id: String,
    pub ttl: Duration,
    /// `(dependency id, record key)` pairs.
    pub dependencies: Vec<(String, String)>,
    pub index_remove: IndexEntry,
    pub index_add: IndexEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimVerdict {
    Claimed,
    AlreadyClaimed { holder: Option<String> },
    DependencyNotMet(String),
    /// The record changed between the caller's read and the script; re-read and retry.
    Stale,
    Missing,
}

/// One message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Live pub/sub subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StoreMessage>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<StoreMessage>) -> Self {
        Self {
            rx,
            forwarder: None,
        }
    }

    pub fn with_forwarder(
        rx: mpsc::UnboundedReceiver<StoreMessage>,
        forwarder: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            forwarder: Some(forwarder),
        }
    }

    /// Wait for the next message; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<StoreMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StoreMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Primitive operations of the shared coordination store.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomic set-if-absent. Returns `false` when the key already exists.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remaining time to live; `None` if the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Keys starting with `prefix`. Read-only and not a snapshot.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Atomic delete-if-matches.
    async fn compare_and_delete(&self, key: &str, expect: &Expect) -> StoreResult<Conditional>;

    /// Atomic expire-if-matches.
    async fn compare_and_expire(
        &self,
        key: &str,
        expect: &Expect,
        ttl: Duration,
    ) -> StoreResult<Conditional>;

    /// Atomic guarded record replacement. Returns `false` if the guard did not hold.
    async fn swap_record(&self, swap: &RecordSwap) -> StoreResult<bool>;

    /// Atomic task claim.
    async fn claim_task(&self, claim: &ClaimScript) -> StoreResult<ClaimVerdict>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members ordered by ascending score (ties by member).
    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_value() {
        let expect = Expect::Value("agent-1".to_string());
        assert!(expect.matches("agent-1"));
        assert!(!expect.matches("agent-2"));
    }

    #[test]
    fn test_expect_json_field() {
        let expect = Expect::json_field("ownerId", "agent-1");
        assert!(expect.matches(r#"{"path":"src/lib.rs","ownerId":"agent-1"}"#));
        assert!(!expect.matches(r#"{"path":"src/lib.rs","ownerId":"agent-2"}"#));
        assert!(!expect.matches("not json"));
        assert!(!expect.matches(r#"{"ownerId":7}"#));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Connection("reset".into()).is_retryable());
        assert!(StoreError::Timeout("slow".into()).is_retryable());
        assert!(!StoreError::Backend("WRONGTYPE".into()).is_retryable());
        assert!(!StoreError::Unavailable {
            operation: "get".into(),
            attempts: 3,
            last_error: "reset".into()
        }
        .is_retryable());
    }
}
