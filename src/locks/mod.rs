//! File lock manager.
//!
//! Per path the lock is either absent or held by exactly one owner. Every state change
//! is a single conditional store operation:
//!
//! | operation | store primitive |
//! |-----------|-----------------|
//! | acquire   | set-if-absent with TTL |
//! | release   | compare-and-delete on `ownerId` |
//! | renew     | compare-and-expire on `ownerId` |
//!
//! A crashed owner's lock disappears when its TTL lapses.

pub mod path;

pub use path::{PathCanonicalizer, DEFAULT_MAX_PATH_LEN};

use crate::error::{CoordinationError, HiveResult};
use crate::observability::store_metrics;
use crate::store::{keys, Conditional, Expect, SharedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// A live lock as stored under `locks:file:{path}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLock {
    pub path: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

fn parse_lock(key: &str, raw: &str) -> Option<FileLock> {
    match serde_json::from_str(raw) {
        Ok(lock) => Some(lock),
        Err(e) => {
            warn!(key, error = %e, "Ignoring malformed lock record");
            None
        }
    }
}

fn holder_of(raw: &str) -> String {
    serde_json::from_str::<FileLock>(raw)
        .map(|lock| lock.owner_id)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
    default_ttl: Duration,
    canonicalizer: PathCanonicalizer,
}

impl LockManager {
    pub fn new(store: SharedStore) -> Self {
        Self::with_settings(store, DEFAULT_LOCK_TTL, PathCanonicalizer::new())
    }

    pub fn with_settings(
        store: SharedStore,
        default_ttl: Duration,
        canonicalizer: PathCanonicalizer,
    ) -> Self {
        Self {
            store,
            default_ttl,
            canonicalizer,
        }
    }

    pub fn canonicalize(&self, path: &str) -> HiveResult<String> {
        self.canonicalizer.canonicalize(path)
    }

    fn lease(&self, ttl: Option<Duration>) -> HiveResult<Duration> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        // Leases are recorded in whole seconds.
        if ttl < Duration::from_secs(1) {
            return Err(CoordinationError::invalid("ttl", "lock TTL must be at least one second"));
        }
        Ok(ttl)
    }

    /// Take the lock on `path` for `owner_id`. Never waits: a held lock fails
    /// immediately with `LockHeldByOther`.
    pub async fn acquire(
        &self,
        path: &str,
        owner_id: &str,
        ttl: Option<Duration>,
    ) -> HiveResult<FileLock> {
        let path = self.canonicalize(path)?;
        let ttl = self.lease(ttl)?;
        let key = keys::file_lock(&path);

        let lock = FileLock {
            path: path.clone(),
            owner_id: owner_id.to_string(),
            acquired_at: Utc::now(),
            ttl_seconds: ttl.as_secs(),
        };
        let value = serde_json::to_string(&lock)?;

        if self.store.set_nx(&key, &value, ttl).await? {
            info!(path = %path, owner_id, ttl_secs = ttl.as_secs(), "Lock acquired");
            return Ok(lock);
        }

        let holder = self
            .store
            .get(&key)
            .await?
            .map(|raw| holder_of(&raw))
            .unwrap_or_else(|| "unknown".to_string());
        store_metrics().record_lock_conflict();
        debug!(path = %path, owner_id, holder = %holder, "Lock held by another owner");
        Err(CoordinationError::LockHeldByOther { path, holder })
    }

    /// Release a lock held by `owner_id`.
    pub async fn release(&self, path: &str, owner_id: &str) -> HiveResult<()> {
        let path = self.canonicalize(path)?;
        let key = keys::file_lock(&path);

        match self
            .store
            .compare_and_delete(&key, &Expect::json_field("ownerId", owner_id))
            .await?
        {
            Conditional::Applied => {
                info!(path = %path, owner_id, "Lock released");
                Ok(())
            }
            Conditional::Mismatch(current) => {
                let holder = holder_of(&current);
                warn!(path = %path, owner_id, holder = %holder, "Release by non-owner rejected");
                Err(CoordinationError::NotLockOwner {
                    path,
                    owner: owner_id.to_string(),
                    holder: Some(holder),
                })
            }
            Conditional::Missing => Err(CoordinationError::not_found("lock", path)),
        }
    }

    /// Extend a lock's TTL. Only the current holder may renew.
    pub async fn renew(
        &self,
        path: &str,
        owner_id: &str,
        ttl: Option<Duration>,
    ) -> HiveResult<Duration> {
        let path = self.canonicalize(path)?;
        let ttl = self.lease(ttl)?;
        let key = keys::file_lock(&path);

        match self
            .store
            .compare_and_expire(&key, &Expect::json_field("ownerId", owner_id), ttl)
            .await?
        {
            Conditional::Applied => {
                debug!(path = %path, owner_id, ttl_secs = ttl.as_secs(), "Lock renewed");
                Ok(ttl)
            }
            Conditional::Mismatch(current) => Err(CoordinationError::NotLockOwner {
                path,
                owner: owner_id.to_string(),
                holder: Some(holder_of(&current)),
            }),
            Conditional::Missing => Err(CoordinationError::not_found("lock", path)),
        }
    }

    /// Current lock on `path`, if any.
    pub async fn holder(&self, path: &str) -> HiveResult<Option<FileLock>> {
        let path = self.canonicalize(path)?;
        let key = keys::file_lock(&path);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|raw| parse_lock(&key, &raw)))
    }

    pub async fn remaining_ttl(&self, path: &str) -> HiveResult<Option<Duration>> {
        let path = self.canonicalize(path)?;
        Ok(self.store.ttl(&keys::file_lock(&path)).await?)
    }

    /// All live locks, sorted by path.
    pub async fn list(&self) -> HiveResult<Vec<FileLock>> {
        let mut locks = Vec::new();
        for key in self.store.scan_prefix(keys::FILE_LOCK_PREFIX).await? {
            // A lock may expire between the scan and the read.
            if let Some(raw) = self.store.get(&key).await? {
                locks.extend(parse_lock(&key, &raw));
            }
        }
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(locks)
    }
}
