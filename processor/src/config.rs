//! Layered configuration, mirroring `fetcher::config`'s precedence: built-in
//! defaults, an optional config file, `WEATHER__`-prefixed overrides, then
//! the exact environment variables the external interface names.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ProcessError;

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    pub group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub pending_batch_size: usize,
    pub block_secs: u64,
}

impl ConsumerSettings {
    #[must_use]
    pub fn block(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterSettings {
    pub flush_size: usize,
    pub flush_interval_ms: u64,
}

impl WriterSettings {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub redis: RedisSettings,
    pub influx: InfluxSettings,
    pub consumer: ConsumerSettings,
    pub writer: WriterSettings,
    pub metrics: MetricsSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn load(environment: &str) -> Result<Self, ProcessError> {
        let builder = Config::builder()
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("influx.url", "http://127.0.0.1:8086")?
            .set_default("influx.token", "")?
            .set_default("influx.org", "weather")?
            .set_default("influx.bucket", "weather")?
            .set_default("consumer.group", "weather-processor")?
            .set_default("consumer.consumer_name", "processor-1")?
            .set_default("consumer.batch_size", 50)?
            .set_default("consumer.pending_batch_size", 50)?
            .set_default("consumer.block_secs", 5)?
            .set_default("writer.flush_size", 100)?
            .set_default("writer.flush_interval_ms", 1000)?
            .set_default("metrics.port", 3001)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(Environment::with_prefix("WEATHER").separator("__").try_parsing(true));

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            settings.redis.url = url;
        }
        if let Ok(url) = std::env::var("INFLUX_URL") {
            settings.influx.url = url;
        }
        if let Ok(token) = std::env::var("INFLUX_TOKEN") {
            settings.influx.token = token;
        }
        if let Ok(org) = std::env::var("INFLUX_ORG") {
            settings.influx.org = org;
        }
        if let Ok(bucket) = std::env::var("INFLUX_BUCKET") {
            settings.influx.bucket = bucket;
        }
        if let Ok(raw) = std::env::var("METRICS_PORT") {
            if let Ok(port) = raw.parse() {
                settings.metrics.port = port;
            }
        }

        Ok(settings)
    }

    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.redis.url.is_empty() {
            errors.push("redis.url must not be empty".to_string());
        }
        if self.influx.url.is_empty() {
            errors.push("influx.url must not be empty".to_string());
        }
        if self.influx.bucket.is_empty() {
            errors.push("influx.bucket must not be empty".to_string());
        }
        if self.consumer.batch_size == 0 {
            errors.push("consumer.batch_size must be at least 1".to_string());
        }
        if self.writer.flush_size == 0 {
            errors.push("writer.flush_size must be at least 1".to_string());
        }
        errors
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_and_validate_clean() {
        for var in ["REDIS_URL", "INFLUX_URL", "INFLUX_TOKEN", "INFLUX_ORG", "INFLUX_BUCKET", "METRICS_PORT"] {
            std::env::remove_var(var);
        }
        let settings = Settings::load("test").unwrap();
        assert!(settings.validate().is_empty());
        assert_eq!(settings.consumer.consumer_name, "processor-1");
        assert_eq!(settings.writer.flush_size, 100);
    }

    #[test]
    fn influx_env_vars_override_defaults() {
        std::env::set_var("INFLUX_URL", "http://influx.internal:8086");
        std::env::set_var("INFLUX_BUCKET", "custom-bucket");
        let settings = Settings::load("test").unwrap();
        assert_eq!(settings.influx.url, "http://influx.internal:8086");
        assert_eq!(settings.influx.bucket, "custom-bucket");
        std::env::remove_var("INFLUX_URL");
        std::env::remove_var("INFLUX_BUCKET");
    }
}
