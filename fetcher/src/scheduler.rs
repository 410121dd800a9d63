//! Enqueues the full location catalog every 60 seconds under a fresh,
//! monotonically increasing cycle ID.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use broker::keys;
use broker::Broker;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use weather_core::types::Location;

const CYCLE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    broker: Arc<dyn Broker>,
    catalog: Vec<Location>,
}

impl Scheduler {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, catalog: Vec<Location>) -> Self {
        Self { broker, catalog }
    }

    /// Runs one enqueue immediately, then every 60s on wall-clock minute
    /// boundaries until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), weather_core::error::InfraError> {
        self.enqueue_cycle().await?;

        let start = tokio::time::Instant::now() + delay_to_next_minute_boundary(now_millis());
        let mut ticker = tokio::time::interval_at(start, CYCLE_INTERVAL);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.enqueue_cycle().await?;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn enqueue_cycle(&self) -> Result<(), weather_core::error::InfraError> {
        let payloads: Vec<String> = self
            .catalog
            .iter()
            .filter_map(|location| serde_json::to_string(location).ok())
            .collect();

        let now_ms = now_millis();
        let cycle = self
            .broker
            .enqueue_cycle(
                keys::LOCATIONS_QUEUE,
                keys::CYCLE_ID,
                keys::CYCLE_START_MS,
                &payloads,
                now_ms,
            )
            .await?;

        info!(cycle_id = cycle.cycle_id, locations = payloads.len(), "enqueued cycle");
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Milliseconds from `now_ms` to the next wall-clock `:00` second.
fn delay_to_next_minute_boundary(now_ms: i64) -> Duration {
    let into_minute = now_ms.rem_euclid(60_000);
    let remaining = 60_000 - into_minute;
    Duration::from_millis(remaining as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use broker::MockBroker;

    #[tokio::test]
    async fn enqueue_cycle_pushes_every_location_exactly_once() {
        let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());
        let catalog = vec![
            Location::new("A", 0.0, 0.0),
            Location::new("B", 1.0, 1.0),
            Location::new("C", 2.0, 2.0),
        ];
        let scheduler = Scheduler::new(broker.clone(), catalog.clone());
        scheduler.enqueue_cycle().await.unwrap();

        let mut popped = Vec::new();
        while let Some(raw) = broker
            .brpop(keys::LOCATIONS_QUEUE, std::time::Duration::from_millis(1))
            .await
            .unwrap()
        {
            popped.push(raw);
        }
        assert_eq!(popped.len(), catalog.len());
    }

    #[test]
    fn delay_to_boundary_lands_exactly_on_the_minute() {
        let fifteen_seconds_into_the_minute = 15_000_i64;
        assert_eq!(
            delay_to_next_minute_boundary(fifteen_seconds_into_the_minute),
            Duration::from_secs(45)
        );

        let exactly_on_a_boundary = 60_000_i64;
        assert_eq!(delay_to_next_minute_boundary(exactly_on_a_boundary), Duration::from_secs(60));
    }
}
