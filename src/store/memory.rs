//! Single-process store backend.
//!
//! Conditional operations run under one mutex, which makes them indivisible for every
//! clone of the same `MemoryStore`. Expiry is lazy and measured with `tokio::time`, so
//! tests can pause and advance the clock.

use super::{
    ClaimScript, ClaimVerdict, Conditional, CoordinationStore, Expect, IndexEntry, RecordSwap,
    StoreError, StoreMessage, StoreResult, Subscription,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            trace!(key = %key, "expired");
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn live_value(&mut self, key: &str) -> Option<String> {
        self.live(key).map(|e| e.value.clone())
    }

    fn put(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn zadd(&mut self, entry: &IndexEntry) {
        self.zsets
            .entry(entry.key.clone())
            .or_default()
            .insert(entry.member.clone(), entry.score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, e| e.is_live(now));
    }
}

fn status_is_completed(record: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(record)
        .ok()
        .and_then(|doc| {
            doc.get("status")
                .and_then(|s| s.as_str())
                .map(|s| s == "completed")
        })
        .unwrap_or(false)
}

/// In-process implementation of [`CoordinationStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.lock()?.put(key, value, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.lock()?;
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.put(key, value, Some(ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let had_string = state.live(key).is_some();
        state.strings.remove(key);
        let had_hash = state.hashes.remove(key).is_some();
        let had_zset = state.zsets.remove(key).is_some();
        Ok(had_string || had_hash || had_zset)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        Ok(state.live(key).is_some()
            || state.hashes.contains_key(key)
            || state.zsets.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut state = self.lock()?;
        let now = Instant::now();
        Ok(state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut state = self.lock()?;
        state.purge_expired();
        let mut keys: Vec<String> = state
            .strings
            .keys()
            .chain(state.hashes.keys())
            .chain(state.zsets.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn compare_and_delete(&self, key: &str, expect: &Expect) -> StoreResult<Conditional> {
        let mut state = self.lock()?;
        let Some(current) = state.live_value(key) else {
            return Ok(Conditional::Missing);
        };
        if !expect.matches(&current) {
            return Ok(Conditional::Mismatch(current));
        }
        state.strings.remove(key);
        Ok(Conditional::Applied)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expect: &Expect,
        ttl: Duration,
    ) -> StoreResult<Conditional> {
        let mut state = self.lock()?;
        let Some(entry) = state.live(key) else {
            return Ok(Conditional::Missing);
        };
        if !expect.matches(&entry.value) {
            return Ok(Conditional::Mismatch(entry.value.clone()));
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(Conditional::Applied)
    }

    async fn swap_record(&self, swap: &RecordSwap) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let current = state.live_value(&swap.key);
        let guard_holds = match (&swap.expected, &current) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected == current,
            _ => false,
        };
        if !guard_holds {
            return Ok(false);
        }

        state.put(&swap.key, &swap.replacement, None);
        for entry in &swap.index_remove {
            state.zrem(&entry.key, &entry.member);
        }
        for entry in &swap.index_add {
            state.zadd(entry);
        }
        for key in &swap.delete {
            state.strings.remove(key);
        }
        Ok(true)
    }

    async fn claim_task(&self, claim: &ClaimScript) -> StoreResult<ClaimVerdict> {
        let mut state = self.lock()?;
        let Some(current) = state.live_value(&claim.task_key) else {
            return Ok(ClaimVerdict::Missing);
        };
        if let Some(holder) = state.live_value(&claim.claim_key) {
            return Ok(ClaimVerdict::AlreadyClaimed {
                holder: Some(holder),
            });
        }
        for (dependency_id, dependency_key) in &claim.dependencies {
            let completed = state
                .live_value(dependency_key)
                .map(|record| status_is_completed(&record))
                .unwrap_or(false);
            if !completed {
                return Ok(ClaimVerdict::DependencyNotMet(dependency_id.clone()));
            }
        }
        if current != claim.expected {
            return Ok(ClaimVerdict::Stale);
        }

        state.put(&claim.claim_key, &claim.agent_id, Some(claim.ttl));
        state.put(&claim.task_key, &claim.replacement, None);
        state.zrem(&claim.index_remove.key, &claim.index_remove.member);
        state.zadd(&claim.index_add);
        Ok(ClaimVerdict::Claimed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.lock()?
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .lock()?
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.lock()?.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.lock()?.zadd(&IndexEntry {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.lock()?.zrem(key, member))
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        let Some(set) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let mut state = self.lock()?;
        state.subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for subscriber in state.subscribers.iter().filter(|s| s.channels.contains(channel)) {
            let sent = subscriber.tx.send(StoreMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            });
            if sent.is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()?.subscribers.push(Subscriber {
            channels: channels.iter().cloned().collect(),
            tx,
        });
        Ok(Subscription::new(rx))
    }
}
