//! Redis-backed [`BrokerOps`] (C2), matching the keyspace from §6:
//! `task:ready` (LIST), `task:delayed`/`task:dead` (ZSET), `task:index`
//! (HASH), `task:concurrency_lock` (INT counter), `restart_service_tokens`
//! (SET, TTL 10 min), `ns:{name}` (HASH) + `namespaces` (SET),
//! `stream:log:{trace_id}` (STREAM). Multi-step operations that must be
//! atomic run as Lua scripts, the Redis analogue of the in-memory
//! implementation holding its mutex for the operation's duration.

use std::time::Duration;

use async_trait::async_trait;
use rca_common::errors::BrokerError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use rca_core::broker::{BrokerOps, NsLockOutcome, QueueName, StreamEntry};

const KEY_READY: &str = "task:ready";
const KEY_DELAYED: &str = "task:delayed";
const KEY_DEAD: &str = "task:dead";
const KEY_INDEX: &str = "task:index";
const KEY_CONCURRENCY: &str = "task:concurrency_lock";
const KEY_TOKENS: &str = "restart_service_tokens";
const KEY_NAMESPACES: &str = "namespaces";

fn ns_key(namespace: &str) -> String {
    format!("ns:{namespace}")
}

fn status_key(task_id: Uuid) -> String {
    format!("task:{task_id}:status")
}

fn stream_key(trace_id: Uuid) -> String {
    format!("stream:log:{trace_id}")
}

fn to_err(err: redis::RedisError) -> BrokerError {
    BrokerError::Backend(err.to_string())
}

pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(to_err)?;
        let conn = client.get_connection_manager().await.map_err(to_err)?;
        Ok(Self { conn })
    }
}

// Atomically bumps `task:concurrency_lock` iff it is below `max`.
const CONCURRENCY_ACQUIRE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local max = tonumber(ARGV[1])
if current >= max then
  return 0
end
redis.call('INCR', KEYS[1])
return 1
"#;

// Moves every zset member with score <= `now` from `src` to the ready
// list, returning the flattened (member, bytes) pairs as an array.
const DELAYED_MOVE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = {}
for i, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('LPUSH', KEYS[2], member)
  redis.call('HSET', KEYS[3], cjson.decode(member).task_id, 'ready')
  table.insert(moved, member)
end
return moved
"#;

// Namespace CheckAndLock (§4.3): atomic read-modify-write over the `ns:{name}` hash.
const NS_CHECK_AND_LOCK_SCRIPT: &str = r#"
redis.call('SADD', KEYS[2], ARGV[4])
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'Disabled' then
  return 'disabled'
end
local existing_trace = redis.call('HGET', KEYS[1], 'trace_id')
local existing_end = tonumber(redis.call('HGET', KEYS[1], 'end_time') or '0')
local now = tonumber(ARGV[3])
if existing_trace == ARGV[1] and existing_trace ~= false then
  redis.call('HSET', KEYS[1], 'trace_id', ARGV[1], 'end_time', ARGV[2], 'status', 'Enabled')
  return 'extended'
end
if existing_trace and existing_trace ~= false and existing_end > now then
  return 'busy'
end
redis.call('HSET', KEYS[1], 'trace_id', ARGV[1], 'end_time', ARGV[2], 'status', 'Enabled')
return 'locked'
"#;

// Token-set acquire with TTL eviction, enforced inside the script so the
// count check and insert happen atomically (§4.4).
const TOKEN_ACQUIRE_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
for _, member in ipairs(members) do
  local expiry = redis.call('GET', 'restart_service_tokens:' .. member)
  if not expiry then
    redis.call('SREM', KEYS[1], member)
  end
end
local count = redis.call('SCARD', KEYS[1])
local max = tonumber(ARGV[2])
if count >= max then
  return 0
end
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SETEX', 'restart_service_tokens:' .. ARGV[1], ARGV[3], '1')
return 1
"#;

#[async_trait]
impl BrokerOps for RedisBroker {
    async fn concurrency_try_acquire(&self, max: u32) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let granted: i32 = Script::new(CONCURRENCY_ACQUIRE_SCRIPT)
            .key(KEY_CONCURRENCY)
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(to_err)?;
        Ok(granted == 1)
    }

    async fn concurrency_release(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.decr(KEY_CONCURRENCY, 1).await.map_err(to_err)?;
        Ok(())
    }

    async fn ready_push(&self, task_id: Uuid, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let member = envelope(task_id, &bytes);
        let _: () = conn.lpush(KEY_READY, &member).await.map_err(to_err)?;
        let _: () = conn
            .hset(KEY_INDEX, task_id.to_string(), QueueName::Ready.as_str())
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn ready_pop_blocking(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Uuid, Vec<u8>)>, BrokerError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(KEY_READY, timeout.as_secs_f64().max(0.001))
            .await
            .map_err(to_err)?;
        let Some((_, member)) = popped else {
            return Ok(None);
        };
        let (task_id, bytes) = decode_envelope(&member)?;
        let _: () = conn.hdel(KEY_INDEX, task_id.to_string()).await.map_err(to_err)?;
        Ok(Some((task_id, bytes)))
    }

    async fn ready_remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        remove_by_task_id_list(&self.conn, KEY_READY, task_id).await
    }

    async fn delayed_add(
        &self,
        task_id: Uuid,
        score: i64,
        bytes: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let member = envelope(task_id, &bytes);
        let _: () = conn.zadd(KEY_DELAYED, &member, score).await.map_err(to_err)?;
        let _: () = conn
            .hset(KEY_INDEX, task_id.to_string(), QueueName::Delayed.as_str())
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn delayed_remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        remove_by_task_id_zset(&self.conn, KEY_DELAYED, task_id).await
    }

    async fn delayed_move_due(&self, now: i64) -> Result<Vec<(Uuid, Vec<u8>)>, BrokerError> {
        let mut conn = self.conn.clone();
        let moved: Vec<String> = Script::new(DELAYED_MOVE_DUE_SCRIPT)
            .key(KEY_DELAYED)
            .key(KEY_READY)
            .key(KEY_INDEX)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(to_err)?;
        moved.iter().map(|member| decode_envelope(member)).collect()
    }

    async fn dead_add(&self, task_id: Uuid, score: i64, bytes: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let member = envelope(task_id, &bytes);
        let _: () = conn.zadd(KEY_DEAD, &member, score).await.map_err(to_err)?;
        let _: () = conn
            .hset(KEY_INDEX, task_id.to_string(), QueueName::Dead.as_str())
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn dead_remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        remove_by_task_id_zset(&self.conn, KEY_DEAD, task_id).await
    }

    async fn index_set(&self, task_id: Uuid, queue: QueueName) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(KEY_INDEX, task_id.to_string(), queue.as_str())
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn index_get(&self, task_id: Uuid) -> Result<Option<QueueName>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(KEY_INDEX, task_id.to_string()).await.map_err(to_err)?;
        Ok(value.and_then(|v| match v.as_str() {
            "ready" => Some(QueueName::Ready),
            "delayed" => Some(QueueName::Delayed),
            "dead" => Some(QueueName::Dead),
            _ => None,
        }))
    }

    async fn index_remove(&self, task_id: Uuid) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(KEY_INDEX, task_id.to_string()).await.map_err(to_err)?;
        Ok(())
    }

    async fn status_set(
        &self,
        task_id: Uuid,
        state: &str,
        message: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(status_key(task_id), &[("state", state), ("message", message)])
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn status_get(&self, task_id: Uuid) -> Result<Option<(String, String)>, BrokerError> {
        let mut conn = self.conn.clone();
        let state: Option<String> = conn.hget(status_key(task_id), "state").await.map_err(to_err)?;
        let message: Option<String> = conn.hget(status_key(task_id), "message").await.map_err(to_err)?;
        Ok(state.zip(message))
    }

    async fn ns_check_and_lock(
        &self,
        namespace: &str,
        wanted_end_time: i64,
        trace_id: Uuid,
        now: i64,
    ) -> Result<NsLockOutcome, BrokerError> {
        let mut conn = self.conn.clone();
        let outcome: String = Script::new(NS_CHECK_AND_LOCK_SCRIPT)
            .key(ns_key(namespace))
            .key(KEY_NAMESPACES)
            .arg(trace_id.to_string())
            .arg(wanted_end_time)
            .arg(now)
            .arg(namespace)
            .invoke_async(&mut conn)
            .await
            .map_err(to_err)?;
        Ok(match outcome.as_str() {
            "locked" => NsLockOutcome::Locked,
            "extended" => NsLockOutcome::Extended,
            "busy" => NsLockOutcome::Busy,
            _ => NsLockOutcome::Disabled,
        })
    }

    async fn ns_release(&self, namespace: &str, trace_id: Uuid) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.hget(ns_key(namespace), "trace_id").await.map_err(to_err)?;
        if existing.as_deref() == Some(trace_id.to_string().as_str()) {
            let _: () = conn.del(ns_key(namespace)).await.map_err(to_err)?;
        }
        Ok(())
    }

    async fn ns_set_status(&self, namespace: &str, enabled: bool) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(KEY_NAMESPACES, namespace).await.map_err(to_err)?;
        let status = if enabled { "Enabled" } else { "Disabled" };
        let _: () = conn.hset(ns_key(namespace), "status", status).await.map_err(to_err)?;
        Ok(())
    }

    async fn ns_register(&self, namespace: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(KEY_NAMESPACES, namespace).await.map_err(to_err)?;
        Ok(())
    }

    async fn ns_known_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(KEY_NAMESPACES).await.map_err(to_err)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    async fn token_acquire(
        &self,
        holder: &str,
        max: u32,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let granted: i32 = Script::new(TOKEN_ACQUIRE_SCRIPT)
            .key(KEY_TOKENS)
            .arg(holder)
            .arg(max)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(to_err)?;
        Ok(granted == 1)
    }

    async fn token_release(&self, holder: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(KEY_TOKENS, holder).await.map_err(to_err)?;
        let _: () = conn
            .del(format!("restart_service_tokens:{holder}"))
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn token_count(&self) -> Result<u32, BrokerError> {
        let mut conn = self.conn.clone();
        let count: u32 = conn.scard(KEY_TOKENS).await.map_err(to_err)?;
        Ok(count)
    }

    async fn stream_append(&self, trace_id: Uuid, bytes: Vec<u8>) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(stream_key(trace_id))
            .arg("*")
            .arg("payload")
            .arg(bytes)
            .query_async(&mut conn)
            .await
            .map_err(to_err)?;
        Ok(id)
    }

    async fn stream_range(
        &self,
        trace_id: Uuid,
        after_id: Option<&str>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn.clone();
        let start = match after_id {
            Some(id) => format!("({id}"),
            None => "-".to_string(),
        };
        let raw: Vec<(String, Vec<(String, Vec<u8>)>)> = redis::cmd("XRANGE")
            .arg(stream_key(trace_id))
            .arg(start)
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(to_err)?;
        Ok(raw
            .into_iter()
            .map(|(id, fields)| {
                let bytes = fields
                    .into_iter()
                    .find(|(field, _)| field == "payload")
                    .map(|(_, value)| value)
                    .unwrap_or_default();
                StreamEntry { id, bytes }
            })
            .collect())
    }

    async fn stream_trim_before(&self, trace_id: Uuid, min_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("XTRIM")
            .arg(stream_key(trace_id))
            .arg("MINID")
            .arg(min_id)
            .query_async(&mut conn)
            .await
            .map_err(to_err)?;
        Ok(())
    }
}

fn envelope(task_id: Uuid, bytes: &[u8]) -> String {
    serde_json::json!({ "task_id": task_id, "bytes": hex::encode(bytes) }).to_string()
}

fn decode_envelope(member: &str) -> Result<(Uuid, Vec<u8>), BrokerError> {
    let parsed: serde_json::Value =
        serde_json::from_str(member).map_err(|e| BrokerError::Backend(e.to_string()))?;
    let task_id: Uuid = parsed["task_id"]
        .as_str()
        .ok_or_else(|| BrokerError::Backend("envelope missing task_id".into()))?
        .parse()
        .map_err(|e: uuid::Error| BrokerError::Backend(e.to_string()))?;
    let bytes = hex::decode(
        parsed["bytes"]
            .as_str()
            .ok_or_else(|| BrokerError::Backend("envelope missing bytes".into()))?,
    )
    .map_err(|e| BrokerError::Backend(e.to_string()))?;
    Ok((task_id, bytes))
}

async fn remove_by_task_id_list(
    conn: &ConnectionManager,
    key: &str,
    task_id: Uuid,
) -> Result<bool, BrokerError> {
    let mut conn = conn.clone();
    let members: Vec<String> = conn.lrange(key, 0, -1).await.map_err(to_err)?;
    let Some(member) = members
        .iter()
        .find(|m| decode_envelope(m).map(|(id, _)| id) == Ok(task_id))
    else {
        return Ok(false);
    };
    let removed: i32 = conn.lrem(key, 0, member).await.map_err(to_err)?;
    if removed > 0 {
        let _: () = conn.hdel(KEY_INDEX, task_id.to_string()).await.map_err(to_err)?;
    }
    Ok(removed > 0)
}

async fn remove_by_task_id_zset(
    conn: &ConnectionManager,
    key: &str,
    task_id: Uuid,
) -> Result<bool, BrokerError> {
    let mut conn = conn.clone();
    let members: Vec<String> = conn.zrange(key, 0, -1).await.map_err(to_err)?;
    let Some(member) = members
        .iter()
        .find(|m| decode_envelope(m).map(|(id, _)| id) == Ok(task_id))
    else {
        return Ok(false);
    };
    let removed: i32 = conn.zrem(key, member).await.map_err(to_err)?;
    if removed > 0 {
        let _: () = conn.hdel(KEY_INDEX, task_id.to_string()).await.map_err(to_err)?;
    }
    Ok(removed > 0)
}
