//! Time-series writer: buffers points, flushes on a size or time threshold,
//! and talks to InfluxDB's v2 line-protocol write endpoint directly over
//! `reqwest` (the store's internal encoding is out of scope beyond this
//! contract).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use weather_core::error::InfraError;
use weather_core::types::Observation;

use crate::config::{InfluxSettings, WriterSettings};
use crate::error::ProcessError;

/// One time-series point. Schema is fixed: measurement `weather`, tags
/// `{city_name, weather_condition}`, fields `{temperature, latitude,
/// longitude}`, millisecond-precision timestamp from `recorded_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub city_name: String,
    pub weather_condition: String,
    pub temperature: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

impl Point {
    #[must_use]
    pub fn from_observation(observation: &Observation) -> Self {
        Self {
            city_name: observation.city_name.clone(),
            weather_condition: observation.condition.clone(),
            temperature: observation.temperature,
            latitude: observation.latitude,
            longitude: observation.longitude,
            timestamp_ms: observation.recorded_at.timestamp_millis(),
        }
    }

    /// Line-protocol encoding, at millisecond precision.
    #[must_use]
    pub fn to_line_protocol(&self) -> String {
        format!(
            "weather,city_name={},weather_condition={} temperature={},latitude={},longitude={} {}",
            escape_tag(&self.city_name),
            escape_tag(&self.weather_condition),
            self.temperature,
            self.latitude,
            self.longitude,
            self.timestamp_ms,
        )
    }

    /// Dedup key the store is required to key on: `(measurement, full tag
    /// set, timestamp)`. Re-writing the same key must overwrite, not
    /// append.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String, i64) {
        (self.city_name.clone(), self.weather_condition.clone(), self.timestamp_ms)
    }
}

fn escape_tag(value: &str) -> String {
    value.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_batch(&self, points: &[Point]) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct InfluxWriter {
    http: Client,
    write_url: String,
    token: String,
}

impl InfluxWriter {
    pub fn new(settings: &InfluxSettings) -> Result<Self, ProcessError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ProcessError::Startup(format!("failed to build http client: {err}")))?;
        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            settings.url.trim_end_matches('/'),
            settings.org,
            settings.bucket,
        );
        Ok(Self {
            http,
            write_url,
            token: settings.token.clone(),
        })
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxWriter {
    #[instrument(skip(self, points))]
    async fn write_batch(&self, points: &[Point]) -> Result<(), InfraError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points.iter().map(Point::to_line_protocol).collect::<Vec<_>>().join("\n");

        let response = self
            .http
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|err| InfraError::Store(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(InfraError::Store(format!("influx write failed: {status} {text}")));
        }
        Ok(())
    }
}

/// Non-blocking buffered writer. `write` only ever touches an in-memory
/// buffer; a background task owns the size/time flush policy.
#[derive(Clone)]
pub struct TimeSeriesWriter {
    store: Arc<dyn TimeSeriesStore>,
    buffer: Arc<Mutex<Vec<Point>>>,
    flush_size: usize,
}

impl TimeSeriesWriter {
    #[must_use]
    pub fn new(store: Arc<dyn TimeSeriesStore>, settings: &WriterSettings) -> Self {
        Self {
            store,
            buffer: Arc::new(Mutex::new(Vec::new())),
            flush_size: settings.flush_size,
        }
    }

    /// Buffers `observation`; flushes immediately if this push crossed the
    /// size threshold.
    pub async fn write(&self, observation: &Observation) -> Result<(), ProcessError> {
        let should_flush = {
            #[allow(clippy::unwrap_used)]
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push(Point::from_observation(observation));
            buffer.len() >= self.flush_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), ProcessError> {
        let batch = {
            #[allow(clippy::unwrap_used)]
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        self.store.write_batch(&batch).await.map_err(|err| {
            metrics::counter!("weather_points_written_total", "outcome" => "error").increment(count as u64);
            ProcessError::WriteFailed(err.to_string())
        })?;
        metrics::counter!("weather_points_written_total", "outcome" => "ok").increment(count as u64);
        Ok(())
    }

    /// Flushes all buffered points and releases the transport.
    pub async fn close(&self) -> Result<(), ProcessError> {
        self.flush().await
    }

    /// Background flush-interval loop; runs until `shutdown` fires, then
    /// performs one last flush.
    pub async fn run_flush_timer(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "final flush on shutdown failed");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.flush().await {
                        warn!(error = %err, "periodic flush failed");
                    }
                }
            }
        }
    }
}

/// In-memory store backing round-trip tests, deduplicating by the same
/// `(measurement, tags, timestamp)` key the real store is required to.
#[derive(Debug, Default, Clone)]
pub struct MockStore {
    points: Arc<Mutex<std::collections::HashMap<(String, String, i64), Point>>>,
}

impl MockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.points.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, key: &(String, String, i64)) -> Option<Point> {
        #[allow(clippy::unwrap_used)]
        self.points.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl TimeSeriesStore for MockStore {
    async fn write_batch(&self, points: &[Point]) -> Result<(), InfraError> {
        #[allow(clippy::unwrap_used)]
        let mut stored = self.points.lock().unwrap();
        for point in points {
            stored.insert(point.dedup_key(), point.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn observation() -> Observation {
        Observation {
            city_name: "New York".to_string(),
            latitude: 40.7128,
            longitude: -74.0060,
            temperature: 21.5,
            condition: "Clear sky".to_string(),
            recorded_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
        }
    }

    #[test]
    fn line_protocol_escapes_spaces_in_tag_values() {
        let point = Point::from_observation(&observation());
        let line = point.to_line_protocol();
        assert!(line.starts_with("weather,city_name=New\\ York,weather_condition=Clear\\ sky"));
        assert!(line.ends_with("1700000000000"));
    }

    #[tokio::test]
    async fn writing_the_same_observation_twice_yields_one_point() {
        let store = MockStore::new();
        let writer = TimeSeriesWriter::new(
            Arc::new(store.clone()),
            &WriterSettings {
                flush_size: 100,
                flush_interval_ms: 1000,
            },
        );
        writer.write(&observation()).await.unwrap();
        writer.write(&observation()).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn flushes_automatically_at_the_size_threshold() {
        let store = MockStore::new();
        let writer = TimeSeriesWriter::new(
            Arc::new(store.clone()),
            &WriterSettings {
                flush_size: 2,
                flush_interval_ms: 60_000,
            },
        );
        let mut obs = observation();
        writer.write(&obs).await.unwrap();
        assert!(store.is_empty());
        obs.city_name = "Boston".to_string();
        writer.write(&obs).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn dedup_key_matches_measurement_tags_and_timestamp() {
        let point = Point::from_observation(&observation());
        let key = point.dedup_key();
        assert_eq!(key, ("New York".to_string(), "Clear sky".to_string(), 1_700_000_000_000));
    }
}
