//! The fetch worker pool: N identical tokio tasks popping jobs, acquiring a
//! token, fetching, and appending to the stream.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{keys, Broker};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use weather_core::types::Location;

use crate::analytics::Analytics;
use crate::client::WeatherClient;
use crate::error::FetchError;
use crate::metrics_server::Health;
use crate::ratelimit::RateLimiter;

/// Per-worker cached view of the current cycle, refreshed whenever a read
/// observes a different id than the cached one: a cycle-ID mismatch is
/// always treated as a cycle boundary.
struct CachedCycle {
    id: AtomicU64,
    start_ms: AtomicI64,
}

impl CachedCycle {
    fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            start_ms: AtomicI64::new(0),
        }
    }

    fn refresh_if_changed(&self, id: u64, start_ms: i64) {
        if self.id.load(Ordering::Relaxed) != id {
            self.id.store(id, Ordering::Relaxed);
            self.start_ms.store(start_ms, Ordering::Relaxed);
        }
    }

    fn get(&self) -> (u64, i64) {
        (self.id.load(Ordering::Relaxed), self.start_ms.load(Ordering::Relaxed))
    }
}

pub struct WorkerPool {
    count: usize,
    queue_pop_timeout: Duration,
    broker: Arc<dyn Broker>,
    rate_limiter: Arc<RateLimiter>,
    client: Arc<dyn WeatherClient>,
    analytics: Analytics,
    health: Health,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        count: usize,
        queue_pop_timeout: Duration,
        broker: Arc<dyn Broker>,
        rate_limiter: Arc<RateLimiter>,
        client: Arc<dyn WeatherClient>,
        analytics: Analytics,
        health: Health,
    ) -> Self {
        Self {
            count,
            queue_pop_timeout,
            broker,
            rate_limiter,
            client,
            analytics,
            health,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.count {
            let broker = self.broker.clone();
            let rate_limiter = self.rate_limiter.clone();
            let client = self.client.clone();
            let analytics = self.analytics.clone();
            let health = self.health.clone();
            let queue_pop_timeout = self.queue_pop_timeout;
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                worker_loop(
                    worker_id,
                    broker,
                    rate_limiter,
                    client,
                    analytics,
                    health,
                    queue_pop_timeout,
                    shutdown,
                )
                .await;
            });
        }
        while workers.join_next().await.is_some() {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    broker: Arc<dyn Broker>,
    rate_limiter: Arc<RateLimiter>,
    client: Arc<dyn WeatherClient>,
    analytics: Analytics,
    health: Health,
    queue_pop_timeout: Duration,
    shutdown: CancellationToken,
) {
    let cycle = CachedCycle::new();

    loop {
        let popped = tokio::select! {
            () = shutdown.cancelled() => return,
            result = broker.brpop(keys::LOCATIONS_QUEUE, queue_pop_timeout) => result,
        };

        let raw = match popped {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker_id, error = %err, "broker error popping job, continuing");
                continue;
            }
        };

        let Ok(location) = serde_json::from_str::<Location>(&raw) else {
            warn!(worker_id, "dropped malformed job payload");
            continue;
        };

        if let Err(err) = process_job(
            worker_id,
            &location,
            &broker,
            &rate_limiter,
            &client,
            &analytics,
            &health,
            &cycle,
        )
        .await
        {
            warn!(worker_id, city = %location.city_name, error = %err, "job failed");
        }
    }
}

#[instrument(skip(broker, rate_limiter, client, analytics, health, cycle))]
#[allow(clippy::too_many_arguments)]
async fn process_job(
    worker_id: usize,
    location: &Location,
    broker: &Arc<dyn Broker>,
    rate_limiter: &Arc<RateLimiter>,
    client: &Arc<dyn WeatherClient>,
    analytics: &Analytics,
    health: &Health,
    cycle: &CachedCycle,
) -> Result<(), FetchError> {
    if let Some(observed) = broker.read_cycle(keys::CYCLE_ID, keys::CYCLE_START_MS).await? {
        cycle.refresh_if_changed(observed.cycle_id, observed.start_ms);
    }
    let (cycle_id, cycle_start_ms) = cycle.get();

    rate_limiter.acquire().await?;

    let fetch_start = Instant::now();
    let fetch_started_at_ms = now_millis();
    let second_offset = ((fetch_started_at_ms - cycle_start_ms).max(0)) / 1000;

    match client.fetch(location).await {
        Ok(observation) => {
            let fields = observation.to_stream_fields();
            broker.xadd(keys::RAW_STREAM, &fields).await?;
            let latency_ms = fetch_start.elapsed().as_millis() as u64;
            analytics.record_ok(cycle_id, second_offset, latency_ms);
            health.set_reachable(true);
            metrics::counter!("weather_fetch_total", "outcome" => "ok").increment(1);
            metrics::histogram!("weather_fetch_latency_ms").record(latency_ms as f64);
            Ok(())
        }
        Err(FetchError::Throttled) => {
            analytics.record_fail(cycle_id, second_offset);
            rate_limiter.notify_throttled().await?;
            health.set_reachable(true);
            metrics::counter!("weather_fetch_total", "outcome" => "throttled").increment(1);
            warn!(worker_id, city = %location.city_name, "upstream throttled, cooldown engaged");
            Ok(())
        }
        Err(FetchError::Timeout) => {
            analytics.record_timeout(cycle_id, second_offset);
            health.set_reachable(false);
            metrics::counter!("weather_fetch_total", "outcome" => "timeout").increment(1);
            Ok(())
        }
        Err(FetchError::Upstream(msg)) => {
            analytics.record_fail(cycle_id, second_offset);
            health.set_reachable(false);
            metrics::counter!("weather_fetch_total", "outcome" => "error").increment(1);
            Err(FetchError::Upstream(msg))
        }
        Err(other) => {
            analytics.record_fail(cycle_id, second_offset);
            metrics::counter!("weather_fetch_total", "outcome" => "error").increment(1);
            Err(other)
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
