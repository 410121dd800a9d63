//! Wires the consumer and time-series writer together with the metrics
//! server and runs them concurrently until shutdown.

use std::sync::Arc;

use broker::{Broker, RedisBroker};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::consumer::Consumer;
use crate::error::ProcessError;
use crate::metrics_server;
use crate::writer::{InfluxWriter, TimeSeriesStore, TimeSeriesWriter};

pub struct ProcessorService {
    settings: Settings,
    broker: Arc<dyn Broker>,
    writer: Arc<TimeSeriesWriter>,
    prometheus: PrometheusHandle,
}

impl ProcessorService {
    pub async fn new(settings: Settings, prometheus: PrometheusHandle) -> Result<Self, ProcessError> {
        let broker: Arc<dyn Broker> = Arc::new(
            RedisBroker::connect(&settings.redis.url)
                .await
                .map_err(|err| ProcessError::Startup(err.to_string()))?,
        );
        let store: Arc<dyn TimeSeriesStore> = Arc::new(InfluxWriter::new(&settings.influx)?);
        let writer = Arc::new(TimeSeriesWriter::new(store, &settings.writer));

        Ok(Self {
            settings,
            broker,
            writer,
            prometheus,
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ProcessError> {
        info!(group = %self.settings.consumer.group, consumer = %self.settings.consumer.consumer_name, "starting processor");

        let consumer = Consumer::new(
            self.broker.clone(),
            self.writer.clone(),
            self.settings.consumer.group.clone(),
            self.settings.consumer.consumer_name.clone(),
            self.settings.consumer.batch_size,
            self.settings.consumer.pending_batch_size,
            self.settings.consumer.block(),
        );

        let writer = self.writer.clone();
        let flush_interval = self.settings.writer.flush_interval();

        tokio::try_join!(
            async { consumer.run(shutdown.clone()).await },
            async {
                writer.run_flush_timer(flush_interval, shutdown.clone()).await;
                Ok(())
            },
            async {
                metrics_server::serve(self.settings.metrics.port, self.prometheus.clone(), shutdown.clone())
                    .await
                    .map_err(|err| ProcessError::Startup(err.to_string()))
            },
        )?;

        self.writer.close().await?;
        Ok(())
    }
}
