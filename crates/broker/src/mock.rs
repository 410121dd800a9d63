//! In-memory [`Broker`] for tests: a small `Arc<Mutex<..>>`-guarded state
//! machine that satisfies the port's contract closely enough to drive
//! worker-pool and consumer tests without a running Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use weather_core::error::InfraError;

use crate::port::{Broker, EnqueuedCycle, ReadCursor, StreamEntry, TokenBucketOutcome};

#[derive(Debug, Default)]
struct BucketState {
    tokens: f64,
    last_refill: f64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream's entry vec of the next undelivered entry.
    next_new: usize,
    /// consumer name -> entry ids currently pending for it.
    pending: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(String, HashMap<String, String>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
    buckets: HashMap<String, BucketState>,
    streams: HashMap<String, StreamState>,
}

/// In-memory stand-in for [`crate::redis_broker::RedisBroker`].
#[derive(Debug, Default, Clone)]
pub struct MockBroker {
    inner: std::sync::Arc<Mutex<Inner>>,
    entry_seq: std::sync::Arc<AtomicU64>,
}

impl MockBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap()
    }

    fn not_expired(&self, inner: &Inner, key: &str) -> bool {
        match inner.expiries.get(key) {
            Some(expiry) => Instant::now() < *expiry,
            None => true,
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn enqueue_cycle(
        &self,
        queue_key: &str,
        cycle_id_key: &str,
        cycle_start_key: &str,
        locations: &[String],
        now_ms: i64,
    ) -> Result<EnqueuedCycle, InfraError> {
        let mut inner = self.lock();
        let next_id: u64 = inner
            .strings
            .get(cycle_id_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        inner.strings.insert(cycle_id_key.to_string(), next_id.to_string());
        inner
            .strings
            .insert(cycle_start_key.to_string(), now_ms.to_string());
        let queue = inner.queues.entry(queue_key.to_string()).or_default();
        queue.clear();
        for location in locations {
            queue.push_front(location.clone());
        }
        Ok(EnqueuedCycle {
            cycle_id: next_id,
            start_ms: now_ms,
        })
    }

    async fn read_cycle(
        &self,
        cycle_id_key: &str,
        cycle_start_key: &str,
    ) -> Result<Option<EnqueuedCycle>, InfraError> {
        let inner = self.lock();
        let cycle_id = inner.strings.get(cycle_id_key).and_then(|v| v.parse().ok());
        let start_ms = inner.strings.get(cycle_start_key).and_then(|v| v.parse().ok());
        Ok(match (cycle_id, start_ms) {
            (Some(cycle_id), Some(start_ms)) => Some(EnqueuedCycle { cycle_id, start_ms }),
            _ => None,
        })
    }

    async fn brpop(&self, queue_key: &str, _timeout: Duration) -> Result<Option<String>, InfraError> {
        let mut inner = self.lock();
        Ok(inner.queues.get_mut(queue_key).and_then(VecDeque::pop_back))
    }

    async fn acquire_token(
        &self,
        bucket_key: &str,
        capacity: f64,
        refill_rate: f64,
        now_secs: f64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, InfraError> {
        let mut inner = self.lock();
        let expired = !self.not_expired(&inner, bucket_key);
        if expired {
            inner.buckets.remove(bucket_key);
        }
        let bucket = inner.buckets.entry(bucket_key.to_string()).or_insert(BucketState {
            tokens: capacity,
            last_refill: now_secs,
        });

        let elapsed = (now_secs - bucket.last_refill).max(0.0);
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity);

        let granted = bucket.tokens >= 1.0;
        if granted {
            bucket.tokens -= 1.0;
        }
        bucket.last_refill = now_secs;
        let tokens_remaining = bucket.tokens;

        inner
            .expiries
            .insert(bucket_key.to_string(), Instant::now() + ttl);

        Ok(TokenBucketOutcome {
            granted,
            tokens_remaining,
        })
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, InfraError> {
        let inner = self.lock();
        Ok(inner.expiries.get(key).and_then(|expiry| {
            let now = Instant::now();
            (now < *expiry).then(|| *expiry - now)
        }))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, InfraError> {
        let mut inner = self.lock();
        if self.not_expired(&inner, key) && inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_string());
        inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn xadd(&self, stream_key: &str, fields: &[(&str, String)]) -> Result<String, InfraError> {
        let mut inner = self.lock();
        let id = self.entry_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("{id}-0");
        let map: HashMap<String, String> = fields.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        inner
            .streams
            .entry(stream_key.to_string())
            .or_default()
            .entries
            .push((id.clone(), map));
        Ok(id)
    }

    async fn xgroup_create(&self, stream_key: &str, group: &str) -> Result<(), InfraError> {
        let mut inner = self.lock();
        inner
            .streams
            .entry(stream_key.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn xreadgroup(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        _block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, InfraError> {
        let mut inner = self.lock();
        let Some(stream) = inner.streams.get_mut(stream_key) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        match cursor {
            ReadCursor::New => {
                let start = group_state.next_new;
                let end = (start + count).min(stream.entries.len());
                let slice = &stream.entries[start..end];
                group_state.next_new = end;
                let pending = group_state.pending.entry(consumer.to_string()).or_default();
                let mut out = Vec::with_capacity(slice.len());
                for (id, fields) in slice {
                    pending.push(id.clone());
                    out.push(StreamEntry {
                        id: id.clone(),
                        fields: fields.clone(),
                    });
                }
                Ok(out)
            }
            ReadCursor::Pending => {
                let Some(ids) = group_state.pending.get(consumer) else {
                    return Ok(Vec::new());
                };
                let ids: Vec<String> = ids.iter().take(count).cloned().collect();
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some((_, fields)) = stream.entries.iter().find(|(eid, _)| *eid == id) {
                        out.push(StreamEntry {
                            id,
                            fields: fields.clone(),
                        });
                    }
                }
                Ok(out)
            }
        }
    }

    async fn xack(&self, stream_key: &str, group: &str, entry_id: &str) -> Result<(), InfraError> {
        let mut inner = self.lock();
        if let Some(stream) = inner.streams.get_mut(stream_key) {
            if let Some(group_state) = stream.groups.get_mut(group) {
                for pending in group_state.pending.values_mut() {
                    pending.retain(|id| id != entry_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_cycle_delete_then_push_replaces_residual_work() {
        let broker = MockBroker::new();
        broker
            .enqueue_cycle("q", "cid", "cstart", &["a".into(), "b".into()], 1_000)
            .await
            .unwrap();
        let popped = broker.brpop("q", Duration::from_millis(1)).await.unwrap();
        assert_eq!(popped, Some("a".to_string()));

        // Second cycle: queue is cleared, not appended to.
        let cycle = broker
            .enqueue_cycle("q", "cid", "cstart", &["c".into()], 61_000)
            .await
            .unwrap();
        assert_eq!(cycle.cycle_id, 2);
        let popped = broker.brpop("q", Duration::from_millis(1)).await.unwrap();
        assert_eq!(popped, Some("c".to_string()));
        let empty = broker.brpop("q", Duration::from_millis(1)).await.unwrap();
        assert_eq!(empty, None);
    }

    #[tokio::test]
    async fn token_bucket_grants_up_to_capacity_then_denies() {
        let broker = MockBroker::new();
        for _ in 0..8 {
            let outcome = broker
                .acquire_token("bucket", 8.0, 8.0, 0.0, Duration::from_secs(60))
                .await
                .unwrap();
            assert!(outcome.granted);
        }
        let outcome = broker
            .acquire_token("bucket", 8.0, 8.0, 0.0, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!outcome.granted);
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let broker = MockBroker::new();
        for _ in 0..8 {
            broker
                .acquire_token("bucket", 8.0, 8.0, 0.0, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let outcome = broker
            .acquire_token("bucket", 8.0, 8.0, 1.0, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.granted);
    }

    #[tokio::test]
    async fn cooldown_first_set_wins() {
        let broker = MockBroker::new();
        assert!(broker
            .set_if_absent("cooldown", "1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!broker
            .set_if_absent("cooldown", "1", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pending_entries_survive_until_acked() {
        let broker = MockBroker::new();
        broker.xgroup_create("stream", "group").await.unwrap();
        broker
            .xadd("stream", &[("city_name", "Oslo".to_string())])
            .await
            .unwrap();

        let delivered = broker
            .xreadgroup("stream", "group", "consumer-1", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);

        // Simulate a crash: a fresh read of "new" entries returns nothing,
        // but the pending list still holds the undelivered-ack entry.
        let pending = broker
            .xreadgroup("stream", "group", "consumer-1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, delivered[0].id);

        broker.xack("stream", "group", &delivered[0].id).await.unwrap();
        let pending_after_ack = broker
            .xreadgroup("stream", "group", "consumer-1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert!(pending_after_ack.is_empty());
    }
}
