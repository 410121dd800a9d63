//! Stream consumer: ensures the consumer group exists, drains this
//! consumer's own pending entries (crash recovery), then reads new entries
//! forever, acknowledging only after a successful downstream write.

use std::sync::Arc;
use std::time::Duration;

use broker::{keys, Broker, ReadCursor, StreamEntry};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use weather_core::types::Observation;

use crate::error::ProcessError;
use crate::writer::TimeSeriesWriter;

pub struct Consumer {
    broker: Arc<dyn Broker>,
    writer: Arc<TimeSeriesWriter>,
    group: String,
    consumer_name: String,
    batch_size: usize,
    pending_batch_size: usize,
    block: Duration,
}

impl Consumer {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        writer: Arc<TimeSeriesWriter>,
        group: String,
        consumer_name: String,
        batch_size: usize,
        pending_batch_size: usize,
        block: Duration,
    ) -> Self {
        Self {
            broker,
            writer,
            group,
            consumer_name,
            batch_size,
            pending_batch_size,
            block,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ProcessError> {
        self.broker.xgroup_create(keys::RAW_STREAM, &self.group).await?;
        info!(group = %self.group, consumer = %self.consumer_name, "consumer group ready");

        self.drain_pending(&shutdown).await?;
        self.read_new_loop(&shutdown).await
    }

    /// Phase 1: replays this consumer's own unacknowledged entries left
    /// over from a crash between downstream write and acknowledgement.
    #[instrument(skip(self, shutdown))]
    async fn drain_pending(&self, shutdown: &CancellationToken) -> Result<(), ProcessError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let entries = self
                .broker
                .xreadgroup(
                    keys::RAW_STREAM,
                    &self.group,
                    &self.consumer_name,
                    ReadCursor::Pending,
                    self.pending_batch_size,
                    None,
                )
                .await?;
            if entries.is_empty() {
                return Ok(());
            }
            for entry in entries {
                self.handle_entry(entry).await;
            }
        }
    }

    /// Phase 2: blocking reads of entries never delivered to any consumer.
    async fn read_new_loop(&self, shutdown: &CancellationToken) -> Result<(), ProcessError> {
        loop {
            let entries = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                result = self.broker.xreadgroup(
                    keys::RAW_STREAM,
                    &self.group,
                    &self.consumer_name,
                    ReadCursor::New,
                    self.batch_size,
                    Some(self.block),
                ) => result?,
            };
            for entry in entries {
                self.handle_entry(entry).await;
            }
        }
    }

    /// Parses one entry with the contract's per-field defaults, writes it,
    /// and acknowledges only on success. A present-but-unparsable
    /// `recorded_at` is rejected outright: the entry is logged and left
    /// pending so a later code fix and restart can reprocess it, rather
    /// than silently stamping it with the current time.
    async fn handle_entry(&self, entry: StreamEntry) {
        if Observation::has_unparsable_timestamp(&entry.fields) {
            warn!(entry_id = %entry.id, "rejecting entry with unparsable recorded_at, leaving pending");
            return;
        }

        let observation = Observation::from_stream_fields(&entry.fields);
        match self.writer.write(&observation).await {
            Ok(()) => {
                if let Err(err) = self.broker.xack(keys::RAW_STREAM, &self.group, &entry.id).await {
                    warn!(entry_id = %entry.id, error = %err, "failed to acknowledge entry after successful write");
                }
            }
            Err(err) => {
                warn!(entry_id = %entry.id, error = %err, "downstream write failed, leaving entry pending");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::WriterSettings;
    use crate::writer::MockStore;
    use broker::MockBroker;

    fn writer_settings() -> WriterSettings {
        WriterSettings {
            flush_size: 100,
            flush_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn new_entry_is_written_and_acknowledged() {
        let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());
        let store = MockStore::new();
        let writer = Arc::new(TimeSeriesWriter::new(Arc::new(store.clone()), &writer_settings()));
        let consumer = Consumer::new(
            broker.clone(),
            writer,
            "group".to_string(),
            "consumer-1".to_string(),
            50,
            50,
            Duration::from_millis(1),
        );

        broker.xgroup_create(keys::RAW_STREAM, "group").await.unwrap();
        broker
            .xadd(
                keys::RAW_STREAM,
                &[
                    ("city_name", "Oslo".to_string()),
                    ("latitude", "59.9".to_string()),
                    ("longitude", "10.7".to_string()),
                    ("temperature", "3.5".to_string()),
                    ("weather_condition", "Clear sky".to_string()),
                    ("recorded_at", "2024-01-01T00:00:00Z".to_string()),
                ],
            )
            .await
            .unwrap();

        consumer.drain_pending(&CancellationToken::new()).await.unwrap();
        let entries = broker
            .xreadgroup(keys::RAW_STREAM, "group", "consumer-1", ReadCursor::New, 10, None)
            .await
            .unwrap();
        for entry in entries {
            consumer.handle_entry(entry).await;
        }

        assert_eq!(store.len(), 1);
        let pending = broker
            .xreadgroup(keys::RAW_STREAM, "group", "consumer-1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert!(pending.is_empty(), "entry should be acknowledged after a successful write");
    }

    #[tokio::test]
    async fn unparsable_timestamp_is_rejected_and_left_pending() {
        let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());
        let store = MockStore::new();
        let writer = Arc::new(TimeSeriesWriter::new(Arc::new(store.clone()), &writer_settings()));
        let consumer = Consumer::new(
            broker.clone(),
            writer,
            "group".to_string(),
            "consumer-1".to_string(),
            50,
            50,
            Duration::from_millis(1),
        );

        broker.xgroup_create(keys::RAW_STREAM, "group").await.unwrap();
        broker
            .xadd(
                keys::RAW_STREAM,
                &[("city_name", "Oslo".to_string()), ("recorded_at", "garbage".to_string())],
            )
            .await
            .unwrap();

        let entries = broker
            .xreadgroup(keys::RAW_STREAM, "group", "consumer-1", ReadCursor::New, 10, None)
            .await
            .unwrap();
        for entry in entries {
            consumer.handle_entry(entry).await;
        }

        assert!(store.is_empty());
        let pending = broker
            .xreadgroup(keys::RAW_STREAM, "group", "consumer-1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn missing_fields_default_per_contract_and_still_get_written() {
        let broker: Arc<dyn Broker> = Arc::new(MockBroker::new());
        let store = MockStore::new();
        let writer = Arc::new(TimeSeriesWriter::new(Arc::new(store.clone()), &writer_settings()));
        let consumer = Consumer::new(
            broker.clone(),
            writer,
            "group".to_string(),
            "consumer-1".to_string(),
            50,
            50,
            Duration::from_millis(1),
        );

        broker.xgroup_create(keys::RAW_STREAM, "group").await.unwrap();
        broker.xadd(keys::RAW_STREAM, &[]).await.unwrap();

        let entries = broker
            .xreadgroup(keys::RAW_STREAM, "group", "consumer-1", ReadCursor::New, 10, None)
            .await
            .unwrap();
        for entry in entries {
            consumer.handle_entry(entry).await;
        }

        assert_eq!(store.len(), 1);
    }
}
