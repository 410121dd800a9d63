//! Redis-backed [`Broker`].
//!
//! Uses `redis::aio::ConnectionManager` for a cheaply-cloneable, auto-
//! reconnecting multiplexed connection (one per process, shared by every
//! worker), `redis::pipe()` for the pipelined cycle refresh, and
//! `redis::Script` for the atomic token-bucket evaluation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Script};
use tracing::instrument;
use weather_core::error::InfraError;

use crate::port::{Broker, EnqueuedCycle, ReadCursor, StreamEntry, TokenBucketOutcome};

/// Atomic read-modify-write for the token bucket: load, refill, spend if
/// possible, persist, re-arm the TTL. Single round-trip, so concurrent
/// workers can never double-spend the same token.
const TOKEN_BUCKET_SCRIPT: &str = r"
local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local tokens = tonumber(bucket[1])
local last_refill = tonumber(bucket[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = now - last_refill
if elapsed < 0 then elapsed = 0 end
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local granted = 0
if tokens >= 1 then
  tokens = tokens - 1
  granted = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(now))
redis.call('EXPIRE', KEYS[1], ttl)

return {granted, tostring(tokens)}
";

fn infra(err: RedisError) -> InfraError {
    InfraError::Broker(err.to_string())
}

#[derive(Debug, Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    token_bucket_script: Script,
}

impl RedisBroker {
    /// Connects to `url` and loads the token-bucket script once. Connection
    /// failure at this point is a startup failure — fatal per the error
    /// policy table, not a retryable data-plane error.
    pub async fn connect(url: &str) -> Result<Self, InfraError> {
        let client = redis::Client::open(url).map_err(infra)?;
        let conn = ConnectionManager::new(client).await.map_err(infra)?;
        Ok(Self {
            conn,
            token_bucket_script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, locations))]
    async fn enqueue_cycle(
        &self,
        queue_key: &str,
        cycle_id_key: &str,
        cycle_start_key: &str,
        locations: &[String],
        now_ms: i64,
    ) -> Result<EnqueuedCycle, InfraError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(cycle_id_key, 1_u64)
            .ignore()
            .set(cycle_start_key, now_ms)
            .ignore()
            .del(queue_key)
            .ignore();
        if !locations.is_empty() {
            pipe.lpush(queue_key, locations).ignore();
        }
        pipe.get(cycle_id_key);

        let (cycle_id,): (u64,) = pipe.query_async(&mut conn).await.map_err(infra)?;
        Ok(EnqueuedCycle {
            cycle_id,
            start_ms: now_ms,
        })
    }

    async fn read_cycle(
        &self,
        cycle_id_key: &str,
        cycle_start_key: &str,
    ) -> Result<Option<EnqueuedCycle>, InfraError> {
        let mut conn = self.conn.clone();
        let (cycle_id, start_ms): (Option<u64>, Option<i64>) = conn
            .mget(&[cycle_id_key, cycle_start_key])
            .await
            .map_err(infra)?;
        Ok(match (cycle_id, start_ms) {
            (Some(cycle_id), Some(start_ms)) => Some(EnqueuedCycle { cycle_id, start_ms }),
            _ => None,
        })
    }

    #[instrument(skip(self))]
    async fn brpop(&self, queue_key: &str, timeout: Duration) -> Result<Option<String>, InfraError> {
        let mut conn = self.conn.clone();
        let reply: Option<(String, String)> = conn
            .brpop(queue_key, timeout.as_secs_f64())
            .await
            .map_err(infra)?;
        Ok(reply.map(|(_, value)| value))
    }

    #[instrument(skip(self))]
    async fn acquire_token(
        &self,
        bucket_key: &str,
        capacity: f64,
        refill_rate: f64,
        now_secs: f64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, InfraError> {
        let mut conn = self.conn.clone();
        let (granted, tokens_remaining): (i64, String) = self
            .token_bucket_script
            .key(bucket_key)
            .arg(capacity)
            .arg(refill_rate)
            .arg(now_secs)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(infra)?;

        Ok(TokenBucketOutcome {
            granted: granted == 1,
            tokens_remaining: tokens_remaining.parse().unwrap_or(0.0),
        })
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, InfraError> {
        let mut conn = self.conn.clone();
        let millis: i64 = conn.pttl(key).await.map_err(infra)?;
        // redis reports -2 (no key) and -1 (no TTL) as negative sentinels.
        Ok(if millis < 0 {
            None
        } else {
            Some(Duration::from_millis(millis as u64))
        })
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, InfraError> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs()));
        let result: Option<String> = conn.set_options(key, value, opts).await.map_err(infra)?;
        Ok(result.is_some())
    }

    #[instrument(skip(self, fields))]
    async fn xadd(&self, stream_key: &str, fields: &[(&str, String)]) -> Result<String, InfraError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream_key, "*", fields).await.map_err(infra)?;
        Ok(id)
    }

    async fn xgroup_create(&self, stream_key: &str, group: &str) -> Result<(), InfraError> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = conn.xgroup_create_mkstream(stream_key, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(infra(err)),
        }
    }

    #[instrument(skip(self))]
    async fn xreadgroup(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, InfraError> {
        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        if let (ReadCursor::New, Some(block)) = (cursor, block) {
            opts = opts.block(block.as_millis() as usize);
        }
        let start_id = match cursor {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        };

        let reply: StreamReadReply = conn
            .xread_options(&[stream_key], &[start_id], &opts)
            .await
            .map_err(infra)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for stream_id in key.ids {
                let mut fields = HashMap::new();
                for (field, value) in stream_id.map {
                    if let redis::Value::BulkString(bytes) = value {
                        fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                entries.push(StreamEntry {
                    id: stream_id.id,
                    fields,
                });
            }
        }
        Ok(entries)
    }

    async fn xack(&self, stream_key: &str, group: &str, entry_id: &str) -> Result<(), InfraError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream_key, group, &[entry_id]).await.map_err(infra)?;
        Ok(())
    }
}
