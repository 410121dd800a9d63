//! The `Broker` port: the shared primitives the fetcher and processor need
//! from the work queue / rate-limiter / stream backend, named after the
//! exact command surface the contract requires (list ops, atomic KV with
//! TTL, pipelined transactions, scripted evaluation, streams with consumer
//! groups) rather than after any single backend's API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use weather_core::error::InfraError;

/// Which half of a consumer group's read cursor to use: `>` for messages
/// never delivered to any consumer, `0` for this consumer's own pending
/// (delivered, unacknowledged) entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    New,
    Pending,
}

/// One entry read back from a stream, with its field map already collected
/// into a lookup table (values are always strings on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Outcome of the atomic token-bucket script: whether a token was granted,
/// and the resulting token count for observability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    pub granted: bool,
    pub tokens_remaining: f64,
}

/// Result of one cycle enqueue: the new cycle id and its start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueuedCycle {
    pub cycle_id: u64,
    pub start_ms: i64,
}

/// Broker port. One implementation (`crate::redis_broker::RedisBroker`)
/// talks to Redis; `crate::mock::MockBroker` backs unit and integration
/// tests without a running server.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Atomically increments the cycle counter, records `now_ms` as its
    /// start, drops the existing queue, and pushes `locations` in one
    /// pipelined round-trip — so no worker ever observes a partially
    /// refreshed queue.
    async fn enqueue_cycle(
        &self,
        queue_key: &str,
        cycle_id_key: &str,
        cycle_start_key: &str,
        locations: &[String],
        now_ms: i64,
    ) -> Result<EnqueuedCycle, InfraError>;

    /// Reads the current cycle id and start timestamp without mutating
    /// anything, via a pipelined `MGET`-equivalent.
    async fn read_cycle(
        &self,
        cycle_id_key: &str,
        cycle_start_key: &str,
    ) -> Result<Option<EnqueuedCycle>, InfraError>;

    /// Blocking right-pop with `timeout`; `Ok(None)` on timeout, never an
    /// error.
    async fn brpop(&self, queue_key: &str, timeout: Duration) -> Result<Option<String>, InfraError>;

    /// Evaluates the token-bucket refill-and-acquire script atomically
    /// against `bucket_key`. `now_secs` is the caller's wall clock.
    async fn acquire_token(
        &self,
        bucket_key: &str,
        capacity: f64,
        refill_rate: f64,
        now_secs: f64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, InfraError>;

    /// Remaining TTL on `key`, or `None` if the key is absent.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, InfraError>;

    /// Sets `key` to `value` with `ttl`, only if it does not already exist.
    /// Returns `true` if this call created it (first throttle wins).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, InfraError>;

    /// Appends `fields` as one new entry on `stream_key`, returning the
    /// assigned entry id.
    async fn xadd(&self, stream_key: &str, fields: &[(&str, String)]) -> Result<String, InfraError>;

    /// Creates `group` on `stream_key` if it does not already exist;
    /// tolerates `BUSYGROUP`, propagates anything else.
    async fn xgroup_create(&self, stream_key: &str, group: &str) -> Result<(), InfraError>;

    /// Reads up to `count` entries from `stream_key` for `group` /
    /// `consumer`, blocking up to `block` when `cursor` is
    /// [`ReadCursor::New`] and nothing is immediately available. Pending
    /// reads (`cursor = Pending`) never block.
    async fn xreadgroup(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, InfraError>;

    /// Acknowledges `entry_id` on `group`, removing it from the consumer's
    /// pending list.
    async fn xack(&self, stream_key: &str, group: &str, entry_id: &str) -> Result<(), InfraError>;
}
