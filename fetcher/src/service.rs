//! Wires the scheduler, worker pool, analytics reporter, and metrics server
//! together and runs them concurrently until shutdown.

use std::sync::Arc;

use broker::{Broker, RedisBroker};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use weather_core::locations;

use crate::analytics::{Analytics, AnalyticsReporter};
use crate::client::http::OpenMeteoClient;
use crate::client::mock::MockWeatherClient;
use crate::client::WeatherClient;
use crate::config::Settings;
use crate::error::FetchError;
use crate::metrics_server::{self, Health};
use crate::ratelimit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::worker::WorkerPool;

pub struct FetcherService {
    settings: Settings,
    broker: Arc<dyn Broker>,
    client: Arc<dyn WeatherClient>,
    prometheus: PrometheusHandle,
}

impl FetcherService {
    /// Connects to the broker (fatal on failure, per the startup-failure
    /// policy) and builds the real or mock upstream client.
    pub async fn new(settings: Settings, prometheus: PrometheusHandle) -> Result<Self, FetchError> {
        let broker: Arc<dyn Broker> = Arc::new(
            RedisBroker::connect(&settings.redis.url)
                .await
                .map_err(|err| FetchError::Startup(err.to_string()))?,
        );

        let client: Arc<dyn WeatherClient> = if settings.use_mock {
            Arc::new(MockWeatherClient::new())
        } else {
            Arc::new(OpenMeteoClient::new(
                settings.http.base_url.clone(),
                settings.http.timeout(),
                settings.worker.count,
                settings.http.max_attempts,
                settings.http.max_backoff(),
            )?)
        };

        Ok(Self {
            settings,
            broker,
            client,
            prometheus,
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), FetchError> {
        let catalog = locations::catalog();
        info!(locations = catalog.len(), mock = self.settings.use_mock, "starting fetcher");

        let rate_limiter = Arc::new(RateLimiter::new(self.broker.clone(), self.settings.rate_limit.clone()));
        let analytics = Analytics::new();
        let health = Health::new(self.settings.use_mock);

        let scheduler = Scheduler::new(self.broker.clone(), catalog);
        let worker_pool = WorkerPool::new(
            self.settings.worker.count,
            self.settings.worker.queue_pop_timeout(),
            self.broker.clone(),
            rate_limiter,
            self.client.clone(),
            analytics.clone(),
            health.clone(),
        );
        let reporter = AnalyticsReporter::new(analytics, self.broker.clone());

        tokio::try_join!(
            async {
                scheduler
                    .run(shutdown.clone())
                    .await
                    .map_err(FetchError::from)
            },
            async {
                worker_pool.run(shutdown.clone()).await;
                Ok(())
            },
            async {
                reporter.run(shutdown.clone()).await;
                Ok(())
            },
            async {
                metrics_server::serve(self.settings.metrics.port, health, self.prometheus.clone(), shutdown.clone())
                    .await
                    .map_err(|err| FetchError::Startup(err.to_string()))
            },
        )?;

        Ok(())
    }
}
