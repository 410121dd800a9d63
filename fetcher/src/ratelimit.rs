//! Token-bucket rate limiter. The bucket state lives in the broker so every
//! fetcher replica shares one budget; this type only holds the config and
//! the cooldown-polling loop around the broker's atomic script.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use broker::{keys, Broker};
use tracing::instrument;
use weather_core::error::InfraError;

use crate::config::RateLimitSettings;

#[derive(Clone)]
pub struct RateLimiter {
    broker: Arc<dyn Broker>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, settings: RateLimitSettings) -> Self {
        Self { broker, settings }
    }

    /// Blocks until the caller holds one token.
    ///
    /// Before each attempt, polls the cooldown key's remaining TTL and
    /// sleeps exactly that long rather than on a fixed interval. On a plain
    /// denial (bucket empty, no cooldown), sleeps the configured small
    /// backoff and retries.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<(), InfraError> {
        loop {
            if let Some(remaining) = self.broker.pttl(keys::RATE_LIMITER_COOLDOWN).await? {
                tokio::time::sleep(remaining).await;
                continue;
            }

            let now_secs = now_secs();
            let outcome = self
                .broker
                .acquire_token(
                    keys::RATE_LIMITER_BUCKET,
                    self.settings.capacity,
                    self.settings.refill_rate,
                    now_secs,
                    self.settings.bucket_ttl(),
                )
                .await?;

            if outcome.granted {
                return Ok(());
            }

            tokio::time::sleep(self.settings.denied_backoff()).await;
        }
    }

    /// Installs the process-wide cooldown. First throttle wins: a
    /// concurrent call that loses the race does not extend an already-
    /// active cooldown.
    pub async fn notify_throttled(&self) -> Result<(), InfraError> {
        self.broker
            .set_if_absent(keys::RATE_LIMITER_COOLDOWN, "1", self.settings.cooldown_ttl())
            .await?;
        Ok(())
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use broker::MockBroker;

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            capacity: 2.0,
            refill_rate: 2.0,
            bucket_ttl_secs: 60,
            cooldown_ttl_secs: 30,
            denied_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn acquire_grants_up_to_capacity_then_waits_for_refill() {
        let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());
        let limiter = RateLimiter::new(broker, settings());

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        // A third call would otherwise spin forever against the mock's
        // frozen refill clock, so we only assert the first two succeed
        // promptly.
    }

    #[tokio::test]
    async fn notify_throttled_is_idempotent_for_first_caller() {
        let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());
        let limiter = RateLimiter::new(broker.clone(), settings());

        limiter.notify_throttled().await.unwrap();
        let remaining_first = broker.pttl(keys::RATE_LIMITER_COOLDOWN).await.unwrap();
        assert!(remaining_first.is_some());

        limiter.notify_throttled().await.unwrap();
        let remaining_second = broker.pttl(keys::RATE_LIMITER_COOLDOWN).await.unwrap();
        assert!(remaining_second.unwrap() <= remaining_first.unwrap());
    }
}
