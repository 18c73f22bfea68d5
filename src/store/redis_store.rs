//! Redis backend. Conditional operations are Lua scripts, so each one executes as a
//! single indivisible command on the server.

use super::{
    ClaimScript, ClaimVerdict, Conditional, CoordinationStore, Expect, RecordSwap, StoreError,
    StoreMessage, StoreResult, Subscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

// ARGV[1] = 'value' | 'json', ARGV[2] = json field, ARGV[3] = expected, ARGV[4] = ttl ms
const MATCHES_FN: &str = r#"
local function matches(current)
  if ARGV[1] == 'value' then
    return current == ARGV[3]
  end
  local ok, doc = pcall(cjson.decode, current)
  return ok and type(doc) == 'table' and doc[ARGV[2]] == ARGV[3]
end
"#;

static COMPARE_AND_DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        r#"{MATCHES_FN}
local current = redis.call('GET', KEYS[1])
if not current then return {{'missing'}} end
if not matches(current) then return {{'mismatch', current}} end
redis.call('DEL', KEYS[1])
return {{'applied'}}
"#
    ))
});

static COMPARE_AND_EXPIRE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(&format!(
        r#"{MATCHES_FN}
local current = redis.call('GET', KEYS[1])
if not current then return {{'missing'}} end
if not matches(current) then return {{'mismatch', current}} end
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return {{'applied'}}
"#
    ))
});

// KEYS: record, index-remove keys.., index-add keys.., delete keys..
// ARGV: has_expected, expected, replacement, n_remove, n_add, n_delete,
//       remove members.., (score, member) pairs..
static SWAP_RECORD: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
local n_remove = tonumber(ARGV[4])
local n_add = tonumber(ARGV[5])
local n_delete = tonumber(ARGV[6])
local k = 2
local a = 7
for i = 1, n_remove do
  redis.call('ZREM', KEYS[k], ARGV[a])
  k = k + 1
  a = a + 1
end
for i = 1, n_add do
  redis.call('ZADD', KEYS[k], ARGV[a], ARGV[a + 1])
  k = k + 1
  a = a + 2
end
for i = 1, n_delete do
  redis.call('DEL', KEYS[k])
  k = k + 1
end
return 1
"#,
    )
});

// KEYS: task, claim, index-remove, index-add, dependency records..
// ARGV: expected, replacement, agent id, ttl ms, remove member, add score, add member,
//       dependency ids.. (aligned with KEYS[5..])
static CLAIM_TASK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if not current then return {'missing'} end
local holder = redis.call('GET', KEYS[2])
if holder then return {'already_claimed', holder} end
for i = 5, #KEYS do
  local dep = redis.call('GET', KEYS[i])
  local done = false
  if dep then
    local ok, doc = pcall(cjson.decode, dep)
    done = ok and type(doc) == 'table' and doc['status'] == 'completed'
  end
  if not done then return {'dependency', ARGV[i + 3]} end
end
if current ~= ARGV[1] then return {'stale'} end
redis.call('SET', KEYS[2], ARGV[3], 'PX', ARGV[4])
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZREM', KEYS[3], ARGV[5])
redis.call('ZADD', KEYS[4], ARGV[6], ARGV[7])
return {'claimed'}
"#,
    )
});

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

fn conditional_from_reply(key: &str, reply: Vec<String>) -> StoreResult<Conditional> {
    match reply.first().map(String::as_str) {
        Some("applied") => Ok(Conditional::Applied),
        Some("missing") => Ok(Conditional::Missing),
        Some("mismatch") => Ok(Conditional::Mismatch(
            reply.get(1).cloned().unwrap_or_default(),
        )),
        other => Err(StoreError::Corrupt {
            key: key.to_string(),
            message: format!("unexpected script reply {other:?}"),
        }),
    }
}

/// Redis-backed coordination store.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        info!(url = %url, "Connecting to Redis");

        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!("Connected to Redis");
        Ok(Self { client, conn })
    }

    async fn run_conditional(
        &self,
        script: &Script,
        key: &str,
        expect: &Expect,
        ttl: Option<Duration>,
    ) -> StoreResult<Conditional> {
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(key);
        match expect {
            Expect::Value(value) => {
                invocation.arg("value").arg("").arg(value);
            }
            Expect::JsonField { field, value } => {
                invocation.arg("json").arg(field).arg(value);
            }
        }
        invocation.arg(ttl.map(millis).unwrap_or(0));
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        conditional_from_reply(key, reply)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let remaining: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2 = missing, -1 = no expiry
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn compare_and_delete(&self, key: &str, expect: &Expect) -> StoreResult<Conditional> {
        self.run_conditional(&COMPARE_AND_DELETE, key, expect, None)
            .await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expect: &Expect,
        ttl: Duration,
    ) -> StoreResult<Conditional> {
        self.run_conditional(&COMPARE_AND_EXPIRE, key, expect, Some(ttl))
            .await
    }

    async fn swap_record(&self, swap: &RecordSwap) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = SWAP_RECORD.prepare_invoke();
        invocation.key(&swap.key);
        for entry in &swap.index_remove {
            invocation.key(&entry.key);
        }
        for entry in &swap.index_add {
            invocation.key(&entry.key);
        }
        for key in &swap.delete {
            invocation.key(key);
        }

        invocation
            .arg(if swap.expected.is_some() { "1" } else { "0" })
            .arg(swap.expected.as_deref().unwrap_or(""))
            .arg(&swap.replacement)
            .arg(swap.index_remove.len())
            .arg(swap.index_add.len())
            .arg(swap.delete.len());
        for entry in &swap.index_remove {
            invocation.arg(&entry.member);
        }
        for entry in &swap.index_add {
            invocation.arg(entry.score).arg(&entry.member);
        }

        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(key = %swap.key, applied = applied == 1, "swap_record");
        Ok(applied == 1)
    }

    async fn claim_task(&self, claim: &ClaimScript) -> StoreResult<ClaimVerdict> {
        let mut conn = self.conn.clone();
        let mut invocation = CLAIM_TASK.prepare_invoke();
        invocation
            .key(&claim.task_key)
            .key(&claim.claim_key)
            .key(&claim.index_remove.key)
            .key(&claim.index_add.key);
        for (_, dependency_key) in &claim.dependencies {
            invocation.key(dependency_key);
        }
        invocation
            .arg(&claim.expected)
            .arg(&claim.replacement)
            .arg(&claim.agent_id)
            .arg(millis(claim.ttl))
            .arg(&claim.index_remove.member)
            .arg(claim.index_add.score)
            .arg(&claim.index_add.member);
        for (dependency_id, _) in &claim.dependencies {
            invocation.arg(dependency_id);
        }

        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.first().map(String::as_str) {
            Some("claimed") => Ok(ClaimVerdict::Claimed),
            Some("already_claimed") => Ok(ClaimVerdict::AlreadyClaimed {
                holder: reply.get(1).cloned(),
            }),
            Some("dependency") => Ok(ClaimVerdict::DependencyNotMet(
                reply.get(1).cloned().unwrap_or_default(),
            )),
            Some("stale") => Ok(ClaimVerdict::Stale),
            Some("missing") => Ok(ClaimVerdict::Missing),
            other => Err(StoreError::Corrupt {
                key: claim.task_key.clone(),
                message: format!("unexpected claim reply {other:?}"),
            }),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, 0, -1).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.publish(channel, message).await?)
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping non-UTF-8 pub/sub payload");
                        continue;
                    }
                };
                let message = StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::with_forwarder(rx, forwarder))
    }
}
