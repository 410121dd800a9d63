//! Layered configuration: built-in defaults, an optional config file, then
//! environment overrides — the exact variables named in the external
//! interface take priority over everything else.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::FetchError;

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: f64,
    pub refill_rate: f64,
    pub bucket_ttl_secs: u64,
    pub cooldown_ttl_secs: u64,
    pub denied_backoff_ms: u64,
}

impl RateLimitSettings {
    #[must_use]
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_secs)
    }

    #[must_use]
    pub fn cooldown_ttl(&self) -> Duration {
        Duration::from_secs(self.cooldown_ttl_secs)
    }

    #[must_use]
    pub fn denied_backoff(&self) -> Duration {
        Duration::from_millis(self.denied_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub count: usize,
    pub queue_pop_timeout_secs: u64,
}

impl WorkerSettings {
    #[must_use]
    pub fn queue_pop_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_pop_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub max_backoff_secs: u64,
}

impl HttpSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
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
    pub rate_limit: RateLimitSettings,
    pub worker: WorkerSettings,
    pub http: HttpSettings,
    pub metrics: MetricsSettings,
    pub logging: LoggingSettings,
    pub use_mock: bool,
}

impl Settings {
    /// Loads defaults, then an optional `config/{environment}.toml`, then
    /// `WEATHER__`-prefixed environment overrides, then finally the exact
    /// environment variables the external interface names directly
    /// (`REDIS_URL`, `USE_MOCK`, `METRICS_PORT`), which win over all of the
    /// above.
    pub fn load(environment: &str) -> Result<Self, FetchError> {
        let builder = Config::builder()
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("rate_limit.capacity", 8.0)?
            .set_default("rate_limit.refill_rate", 8.0)?
            .set_default("rate_limit.bucket_ttl_secs", 60)?
            .set_default("rate_limit.cooldown_ttl_secs", 30)?
            .set_default("rate_limit.denied_backoff_ms", 40)?
            .set_default("worker.count", 50)?
            .set_default("worker.queue_pop_timeout_secs", 5)?
            .set_default(
                "http.base_url",
                "https://api.open-meteo.com/v1/forecast",
            )?
            .set_default("http.timeout_secs", 10)?
            .set_default("http.max_attempts", 5)?
            .set_default("http.max_backoff_secs", 32)?
            .set_default("metrics.port", 3000)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("use_mock", false)?
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(Environment::with_prefix("WEATHER").separator("__").try_parsing(true));

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            settings.redis.url = url;
        }
        if let Ok(raw) = std::env::var("USE_MOCK") {
            settings.use_mock = parse_bool(&raw);
        }
        if let Ok(raw) = std::env::var("METRICS_PORT") {
            if let Ok(port) = raw.parse() {
                settings.metrics.port = port;
            }
        }

        Ok(settings)
    }

    /// Non-empty-ness checks that can't be expressed as `config` defaults.
    /// Returns all problems at once rather than failing on the first.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.redis.url.is_empty() {
            errors.push("redis.url must not be empty".to_string());
        }
        if self.worker.count == 0 {
            errors.push("worker.count must be at least 1".to_string());
        }
        if self.rate_limit.capacity <= 0.0 {
            errors.push("rate_limit.capacity must be positive".to_string());
        }
        if self.rate_limit.refill_rate <= 0.0 {
            errors.push("rate_limit.refill_rate must be positive".to_string());
        }
        if self.http.max_attempts == 0 {
            errors.push("http.max_attempts must be at least 1".to_string());
        }
        errors
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_and_validate_clean() {
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("USE_MOCK");
        std::env::remove_var("METRICS_PORT");
        let settings = Settings::load("test").unwrap();
        assert!(settings.validate().is_empty());
        assert_eq!(settings.rate_limit.capacity, 8.0);
        assert_eq!(settings.worker.count, 50);
        assert!(!settings.use_mock);
    }

    #[test]
    fn exact_env_vars_override_everything() {
        std::env::set_var("REDIS_URL", "redis://override:6379");
        std::env::set_var("USE_MOCK", "true");
        std::env::set_var("METRICS_PORT", "9100");
        let settings = Settings::load("test").unwrap();
        assert_eq!(settings.redis.url, "redis://override:6379");
        assert!(settings.use_mock);
        assert_eq!(settings.metrics.port, 9100);
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("USE_MOCK");
        std::env::remove_var("METRICS_PORT");
    }

    #[test]
    fn invalid_worker_count_is_reported() {
        let mut settings = Settings::load("test").unwrap();
        settings.worker.count = 0;
        let errors = settings.validate();
        assert!(errors.iter().any(|e| e.contains("worker.count")));
    }
}
