//! Broker port and backends.
//!
//! `port` defines the [`port::Broker`] trait: the queue, rate-limiter-state,
//! and stream primitives the fetcher and processor need. `redis_broker`
//! implements it against Redis; `mock` backs tests.

pub mod mock;
pub mod port;
pub mod redis_broker;

pub use mock::MockBroker;
pub use port::{Broker, EnqueuedCycle, ReadCursor, StreamEntry, TokenBucketOutcome};
pub use redis_broker::RedisBroker;

/// Canonical broker key names shared by both services.
pub mod keys {
    pub const LOCATIONS_QUEUE: &str = "weather:locations:queue";
    pub const RAW_STREAM: &str = "weather:raw";
    pub const CYCLE_ID: &str = "weather:cycle:id";
    pub const CYCLE_START_MS: &str = "weather:cycle:start_ms";
    pub const RATE_LIMITER_BUCKET: &str = "rate_limiter:weather_api:bucket";
    pub const RATE_LIMITER_COOLDOWN: &str = "rate_limiter:weather_api:cooldown";
    pub const RAW_STREAM_GROUP: &str = "weather-processor";
}
