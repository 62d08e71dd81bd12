use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::Deserialize;

use crate::model::{
    EventKind, EventRecord, Hold, Ms, ReleaseReason, Snapshot, hold_member, parse_member,
};

use super::{
    CommitLocalReply, CounterError, CounterStore, ExtendReply, ReleaseReply, ReserveReply,
};

/// Sorted set indexing hold members by `expires_at`.
const EXPIRY_KEY: &str = "holds:exp";

// Scripts run to completion with nothing interleaved, which is what makes
// the counters, the hold key space, and the expiry index move in lockstep.
// Each replies with a cjson-encoded table decoded by `ScriptReply` below.
// Expiries are capped at 2^53 ms, cjson's integer ceiling.

const RESERVE_LUA: &str = r#"
-- KEYS[1] = inv:{sku}
-- KEYS[2] = hold:{cart_id}:{sku}
-- KEYS[3] = expiry index zset
-- KEYS[4] = events stream ('' disables)
-- ARGV = member, sku, cart_id, qty, ttl_ms, now_ms
local invKey  = KEYS[1]
local holdKey = KEYS[2]
local expKey  = KEYS[3]
local stream  = KEYS[4]
local member  = ARGV[1]
local sku     = ARGV[2]
local cart    = ARGV[3]
local qty     = tonumber(ARGV[4])
local ttl     = tonumber(ARGV[5])
local now     = tonumber(ARGV[6])

local expires = now + ttl
if expires > 9007199254740992 then
  return cjson.encode({ok=false, reason='overflow'})
end

if redis.call('EXISTS', holdKey) == 1 then
  local existing = tonumber(redis.call('HGET', holdKey, 'qty'))
  if existing ~= qty then
    return cjson.encode({ok=false, reason='conflict', existing_qty=existing})
  end
  -- Identical replay: refresh the lease, counters untouched.
  redis.call('HSET', holdKey, 'expires_at', expires)
  redis.call('ZADD', expKey, expires, member)
  local vals = redis.call('HMGET', invKey, 'total', 'reserved')
  local total = tonumber(vals[1]) or 0
  local reserved = tonumber(vals[2]) or 0
  return cjson.encode({ok=true, idempotent=true, expires_at=expires,
                       available=total - reserved})
end

local vals = redis.call('HMGET', invKey, 'total', 'reserved')
local total = tonumber(vals[1]) or 0
local reserved = tonumber(vals[2]) or 0
if total - reserved < qty then
  return cjson.encode({ok=false, reason='insufficient', available=total - reserved})
end

local after = redis.call('HINCRBY', invKey, 'reserved', qty)
redis.call('HSET', holdKey, 'qty', qty, 'expires_at', expires, 'created_at', now)
redis.call('ZADD', expKey, expires, member)
if #stream > 0 then
  redis.call('XADD', stream, 'MAXLEN', '~', 10000, '*',
    'kind', 'hold_created', 'sku', sku, 'cart', cart,
    'qty', tostring(qty), 'at', tostring(now))
end
return cjson.encode({ok=true, idempotent=false, expires_at=expires,
                     available=total - after})
"#;

const EXTEND_LUA: &str = r#"
-- KEYS[1] = hold:{cart_id}:{sku}
-- KEYS[2] = expiry index zset
-- KEYS[3] = events stream ('' disables)
-- ARGV = member, sku, cart_id, add_ms, now_ms
local holdKey = KEYS[1]
local expKey  = KEYS[2]
local stream  = KEYS[3]
local member  = ARGV[1]
local sku     = ARGV[2]
local cart    = ARGV[3]
local add     = tonumber(ARGV[4])
local now     = tonumber(ARGV[5])

if redis.call('EXISTS', holdKey) == 0 then
  return cjson.encode({ok=false, reason='not_found'})
end

-- Base at max(current, now): an expired hold never resurrects its old lease.
local current = tonumber(redis.call('HGET', holdKey, 'expires_at')) or 0
local base = current
if now > base then base = now end
local expires = base + add
if expires > 9007199254740992 then
  return cjson.encode({ok=false, reason='overflow'})
end

redis.call('HSET', holdKey, 'expires_at', expires)
redis.call('ZADD', expKey, expires, member)
if #stream > 0 then
  local qty = redis.call('HGET', holdKey, 'qty')
  redis.call('XADD', stream, 'MAXLEN', '~', 10000, '*',
    'kind', 'hold_extended', 'sku', sku, 'cart', cart,
    'qty', tostring(qty), 'at', tostring(now))
end
return cjson.encode({ok=true, expires_at=expires})
"#;

const COMMIT_LOCAL_LUA: &str = r#"
-- KEYS[1] = inv:{sku}
-- KEYS[2] = hold:{cart_id}:{sku}
-- KEYS[3] = expiry index zset
-- KEYS[4] = events stream ('' disables)
-- ARGV = member, sku, cart_id, now_ms
local invKey  = KEYS[1]
local holdKey = KEYS[2]
local expKey  = KEYS[3]
local stream  = KEYS[4]
local member  = ARGV[1]
local sku     = ARGV[2]
local cart    = ARGV[3]
local now     = tonumber(ARGV[4])

if redis.call('EXISTS', holdKey) == 0 then
  return cjson.encode({ok=false, reason='not_found'})
end

local qty = tonumber(redis.call('HGET', holdKey, 'qty')) or 0
local after = redis.call('HINCRBY', invKey, 'reserved', -qty)
if after < 0 then
  redis.call('HSET', invKey, 'reserved', 0)
end
redis.call('DEL', holdKey)
redis.call('ZREM', expKey, member)
if #stream > 0 then
  redis.call('XADD', stream, 'MAXLEN', '~', 10000, '*',
    'kind', 'hold_committed', 'sku', sku, 'cart', cart,
    'qty', tostring(qty), 'at', tostring(now))
end
return cjson.encode({ok=true, qty=qty})
"#;

const RELEASE_LUA: &str = r#"
-- KEYS[1] = inv:{sku}
-- KEYS[2] = hold:{cart_id}:{sku}
-- KEYS[3] = expiry index zset
-- KEYS[4] = events stream ('' disables)
-- ARGV = member, sku, cart_id, reason, now_ms
local invKey  = KEYS[1]
local holdKey = KEYS[2]
local expKey  = KEYS[3]
local stream  = KEYS[4]
local member  = ARGV[1]
local sku     = ARGV[2]
local cart    = ARGV[3]
local reason  = ARGV[4]
local now     = tonumber(ARGV[5])

if redis.call('EXISTS', holdKey) == 0 then
  -- An absent hold must leave no index entry behind.
  redis.call('ZREM', expKey, member)
  return cjson.encode({ok=true, absent=true})
end

local qty = tonumber(redis.call('HGET', holdKey, 'qty')) or 0
local after = redis.call('HINCRBY', invKey, 'reserved', -qty)
if after < 0 then
  redis.call('HSET', invKey, 'reserved', 0)
end
redis.call('DEL', holdKey)
redis.call('ZREM', expKey, member)
if #stream > 0 then
  redis.call('XADD', stream, 'MAXLEN', '~', 10000, '*',
    'kind', 'hold_released', 'sku', sku, 'cart', cart,
    'qty', tostring(qty), 'reason', reason, 'at', tostring(now))
end
return cjson.encode({ok=true, qty=qty})
"#;

/// Decoded script reply. Scripts only populate the fields their branch
/// needs, so everything except `ok` is optional.
#[derive(Debug, Deserialize)]
struct ScriptReply {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    idempotent: Option<bool>,
    #[serde(default)]
    expires_at: Option<Ms>,
    #[serde(default)]
    available: Option<i64>,
    #[serde(default)]
    existing_qty: Option<i64>,
    #[serde(default)]
    qty: Option<i64>,
    #[serde(default)]
    absent: Option<bool>,
}

/// Counter store backed by Redis.
///
/// Connection pooling via `ConnectionManager`; all mutations go through
/// the scripts above so Redis's single-threaded script execution provides
/// the serialization the engine relies on.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    /// Empty when event logging is disabled.
    stream_key: String,
    reserve: Script,
    extend: Script,
    commit_local: Script,
    release: Script,
}

impl RedisCounterStore {
    /// Connect and register the script set.
    pub async fn connect(
        url: &str,
        events_enabled: bool,
        stream_name: &str,
    ) -> Result<Self, CounterError> {
        let client = Client::open(url)
            .map_err(|e| CounterError::Unavailable(format!("failed to create client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CounterError::Unavailable(format!("failed to connect: {e}")))?;
        Ok(Self {
            conn,
            stream_key: if events_enabled { stream_name.to_string() } else { String::new() },
            reserve: Script::new(RESERVE_LUA),
            extend: Script::new(EXTEND_LUA),
            commit_local: Script::new(COMMIT_LOCAL_LUA),
            release: Script::new(RELEASE_LUA),
        })
    }

    fn inv_key(sku: &str) -> String {
        format!("inv:{sku}")
    }

    fn hold_key(cart_id: &str, sku: &str) -> String {
        format!("hold:{cart_id}:{sku}")
    }
}

fn unavailable(e: redis::RedisError) -> CounterError {
    CounterError::Unavailable(e.to_string())
}

fn decode_reply(raw: &str) -> Result<ScriptReply, CounterError> {
    serde_json::from_str(raw)
        .map_err(|e| CounterError::Internal(format!("malformed script reply: {e}")))
}

/// Map a script's error branch to the taxonomy shared with callers.
fn script_failure(reply: &ScriptReply, script: &'static str) -> CounterError {
    match reply.reason.as_deref() {
        Some("overflow") => CounterError::Internal(format!("{script}: expiry overflow")),
        other => CounterError::Internal(format!(
            "{script}: unexpected reply reason {other:?}"
        )),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn reserve(
        &self,
        sku: &str,
        cart_id: &str,
        qty: i64,
        ttl_ms: Ms,
        now: Ms,
    ) -> Result<ReserveReply, CounterError> {
        let mut conn = self.conn.clone();
        let member = hold_member(cart_id, sku);
        let raw: String = self
            .reserve
            .key(Self::inv_key(sku))
            .key(Self::hold_key(cart_id, sku))
            .key(EXPIRY_KEY)
            .key(&self.stream_key)
            .arg(&member)
            .arg(sku)
            .arg(cart_id)
            .arg(qty)
            .arg(ttl_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let reply = decode_reply(&raw)?;

        if reply.ok {
            return Ok(ReserveReply::Ok {
                expires_at: reply
                    .expires_at
                    .ok_or_else(|| CounterError::Internal("reserve reply missing expires_at".into()))?,
                available_after: reply
                    .available
                    .ok_or_else(|| CounterError::Internal("reserve reply missing available".into()))?,
                idempotent: reply.idempotent.unwrap_or(false),
            });
        }
        match reply.reason.as_deref() {
            Some("insufficient") => Ok(ReserveReply::Insufficient {
                available: reply.available.unwrap_or(0),
            }),
            Some("conflict") => Ok(ReserveReply::Conflict {
                existing_qty: reply.existing_qty.unwrap_or(0),
            }),
            _ => Err(script_failure(&reply, "reserve")),
        }
    }

    async fn extend(
        &self,
        sku: &str,
        cart_id: &str,
        add_ms: Ms,
        now: Ms,
    ) -> Result<ExtendReply, CounterError> {
        let mut conn = self.conn.clone();
        let member = hold_member(cart_id, sku);
        let raw: String = self
            .extend
            .key(Self::hold_key(cart_id, sku))
            .key(EXPIRY_KEY)
            .key(&self.stream_key)
            .arg(&member)
            .arg(sku)
            .arg(cart_id)
            .arg(add_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let reply = decode_reply(&raw)?;

        if reply.ok {
            return Ok(ExtendReply::Ok {
                new_expires_at: reply
                    .expires_at
                    .ok_or_else(|| CounterError::Internal("extend reply missing expires_at".into()))?,
            });
        }
        match reply.reason.as_deref() {
            Some("not_found") => Ok(ExtendReply::NotFound),
            _ => Err(script_failure(&reply, "extend")),
        }
    }

    async fn commit_local(
        &self,
        sku: &str,
        cart_id: &str,
        now: Ms,
    ) -> Result<CommitLocalReply, CounterError> {
        let mut conn = self.conn.clone();
        let member = hold_member(cart_id, sku);
        let raw: String = self
            .commit_local
            .key(Self::inv_key(sku))
            .key(Self::hold_key(cart_id, sku))
            .key(EXPIRY_KEY)
            .key(&self.stream_key)
            .arg(&member)
            .arg(sku)
            .arg(cart_id)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let reply = decode_reply(&raw)?;

        if reply.ok {
            return Ok(CommitLocalReply::Ok {
                consumed_qty: reply
                    .qty
                    .ok_or_else(|| CounterError::Internal("commit reply missing qty".into()))?,
            });
        }
        match reply.reason.as_deref() {
            Some("not_found") => Ok(CommitLocalReply::NotFound),
            _ => Err(script_failure(&reply, "commit_local")),
        }
    }

    async fn release(
        &self,
        sku: &str,
        cart_id: &str,
        reason: ReleaseReason,
        now: Ms,
    ) -> Result<ReleaseReply, CounterError> {
        let mut conn = self.conn.clone();
        let member = hold_member(cart_id, sku);
        let raw: String = self
            .release
            .key(Self::inv_key(sku))
            .key(Self::hold_key(cart_id, sku))
            .key(EXPIRY_KEY)
            .key(&self.stream_key)
            .arg(&member)
            .arg(sku)
            .arg(cart_id)
            .arg(reason.as_str())
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let reply = decode_reply(&raw)?;

        if !reply.ok {
            return Err(script_failure(&reply, "release"));
        }
        if reply.absent.unwrap_or(false) {
            return Ok(ReleaseReply::Absent);
        }
        Ok(ReleaseReply::Released {
            qty: reply
                .qty
                .ok_or_else(|| CounterError::Internal("release reply missing qty".into()))?,
        })
    }

    async fn peek_hold(&self, sku: &str, cart_id: &str) -> Result<Option<Hold>, CounterError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(Self::hold_key(cart_id, sku))
            .await
            .map_err(unavailable)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |name: &str| -> Result<i64, CounterError> {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| CounterError::Internal(format!("hold missing field {name}")))
        };
        Ok(Some(Hold {
            qty: get("qty")?,
            expires_at: get("expires_at")?,
            created_at: get("created_at")?,
        }))
    }

    async fn snapshot(&self, sku: &str) -> Result<Option<Snapshot>, CounterError> {
        let mut conn = self.conn.clone();
        let (total, reserved): (Option<i64>, Option<i64>) = conn
            .hget(Self::inv_key(sku), &["total", "reserved"])
            .await
            .map_err(unavailable)?;
        let Some(total) = total else {
            return Ok(None);
        };
        let reserved = reserved.unwrap_or(0);
        Ok(Some(Snapshot { total, reserved, available: total - reserved }))
    }

    async fn expired_holds(
        &self,
        now: Ms,
        limit: usize,
    ) -> Result<Vec<(String, String)>, CounterError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(EXPIRY_KEY, "-inf", now, 0, limit as isize)
            .await
            .map_err(unavailable)?;
        Ok(members.iter().filter_map(|m| parse_member(m)).collect())
    }

    async fn events(&self, limit: usize) -> Result<Vec<EventRecord>, CounterError> {
        if self.stream_key.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<(String, HashMap<String, String>)> = redis::cmd("XREVRANGE")
            .arg(&self.stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut out = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            let Some(kind) = fields.get("kind").and_then(|k| EventKind::parse(k)) else {
                tracing::debug!(entry = %id, "skipping event with unknown kind");
                continue;
            };
            out.push(EventRecord {
                ts: fields.get("at").and_then(|v| v.parse().ok()).unwrap_or(0),
                kind,
                sku: fields.get("sku").cloned().unwrap_or_default(),
                cart_id: fields.get("cart").cloned().unwrap_or_default(),
                qty: fields.get("qty").and_then(|v| v.parse().ok()).unwrap_or(0),
                reason: fields.get("reason").and_then(|r| ReleaseReason::parse(r)),
                id,
            });
        }
        Ok(out)
    }

    async fn mirror_total(&self, sku: &str, total: i64) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let inv = Self::inv_key(sku);
        // total is overwritten; reserved is only created if missing so a
        // mirror refresh cannot wipe live reservations.
        let _: () = redis::pipe()
            .atomic()
            .hset(&inv, "total", total)
            .ignore()
            .hset_nx(&inv, "reserved", 0)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance:
    //   docker run -d -p 6379:6379 redis:7-alpine
    // Run with: cargo test -- --ignored

    const NOW: Ms = 1_700_000_000_000;

    async fn connect() -> RedisCounterStore {
        RedisCounterStore::connect("redis://127.0.0.1:6379/0", true, "inv:events:test")
            .await
            .unwrap()
    }

    fn unique_sku(tag: &str) -> String {
        format!("sku-{tag}-{}", ulid::Ulid::new())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn reserve_commit_lifecycle() {
        let store = connect().await;
        let sku = unique_sku("lifecycle");
        store.mirror_total(&sku, 10).await.unwrap();

        let reply = store.reserve(&sku, "cart-a", 3, 120_000, NOW).await.unwrap();
        assert_eq!(
            reply,
            ReserveReply::Ok { expires_at: NOW + 120_000, available_after: 7, idempotent: false }
        );

        let hold = store.peek_hold(&sku, "cart-a").await.unwrap().unwrap();
        assert_eq!(hold.qty, 3);

        let reply = store.commit_local(&sku, "cart-a", NOW).await.unwrap();
        assert_eq!(reply, CommitLocalReply::Ok { consumed_qty: 3 });

        let snap = store.snapshot(&sku).await.unwrap().unwrap();
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.total, 10);
        assert!(store.peek_hold(&sku, "cart-a").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn idempotent_replay_and_conflict() {
        let store = connect().await;
        let sku = unique_sku("replay");
        store.mirror_total(&sku, 5).await.unwrap();

        store.reserve(&sku, "cart-r", 2, 60_000, NOW).await.unwrap();
        let replay = store.reserve(&sku, "cart-r", 2, 60_000, NOW + 1_000).await.unwrap();
        assert_eq!(
            replay,
            ReserveReply::Ok { expires_at: NOW + 61_000, available_after: 3, idempotent: true }
        );

        let conflict = store.reserve(&sku, "cart-r", 4, 60_000, NOW).await.unwrap();
        assert_eq!(conflict, ReserveReply::Conflict { existing_qty: 2 });

        store.release(&sku, "cart-r", ReleaseReason::Manual, NOW).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn insufficient_and_release_idempotency() {
        let store = connect().await;
        let sku = unique_sku("insufficient");
        store.mirror_total(&sku, 2).await.unwrap();

        store.reserve(&sku, "cart-a", 2, 60_000, NOW).await.unwrap();
        let reply = store.reserve(&sku, "cart-b", 1, 60_000, NOW).await.unwrap();
        assert_eq!(reply, ReserveReply::Insufficient { available: 0 });

        let first = store.release(&sku, "cart-a", ReleaseReason::Manual, NOW).await.unwrap();
        assert_eq!(first, ReleaseReply::Released { qty: 2 });
        let second = store.release(&sku, "cart-a", ReleaseReason::Manual, NOW).await.unwrap();
        assert_eq!(second, ReleaseReply::Absent);
    }
}
