//! Real upstream client: GETs Open-Meteo's current-weather endpoint with
//! full-jitter exponential backoff, honoring `Retry-After` on 429.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{instrument, warn};
use weather_core::types::{Location, Observation};
use weather_core::wmo::condition_for_code;

use crate::error::FetchError;

use super::WeatherClient;

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current_weather: Option<CurrentWeather>,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature: f64,
    weathercode: i64,
    time: i64,
}

#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    http: Client,
    base_url: String,
    max_attempts: u32,
    max_backoff: Duration,
}

impl OpenMeteoClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        pool_max_idle_per_host: usize,
        max_attempts: u32,
        max_backoff: Duration,
    ) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(60))
            // Forces the OS to route over IPv4, sidestepping the IPv6 DNS
            // stalls seen against this upstream from some deployments.
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .build()
            .map_err(|err| FetchError::Startup(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            max_attempts,
            max_backoff,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_once(&self, location: &Location) -> Result<Observation, AttemptError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                ("current_weather", "true".to_string()),
                ("timeformat", "unixtime".to_string()),
            ])
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AttemptError::Timeout
                } else {
                    AttemptError::Retryable(err.to_string(), None)
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_seconds(response.headers());
            return Err(AttemptError::Throttled(retry_after));
        }
        if status.is_server_error() {
            let retry_after = retry_after_seconds(response.headers());
            return Err(AttemptError::Retryable(format!("http {status}"), retry_after));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(format!("http {status}")));
        }

        let body: ForecastResponse = response
            .json()
            .await
            .map_err(|err| AttemptError::Fatal(format!("invalid json body: {err}")))?;

        let Some(current) = body.current_weather else {
            return Err(AttemptError::Fatal("missing current_weather".to_string()));
        };

        let recorded_at = Utc
            .timestamp_opt(current.time, 0)
            .single()
            .ok_or_else(|| AttemptError::Fatal(format!("invalid observation time {}", current.time)))?;

        Ok(Observation {
            city_name: location.city_name.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            temperature: current.temperature,
            condition: condition_for_code(current.weathercode),
            recorded_at,
        })
    }
}

#[async_trait::async_trait]
impl WeatherClient for OpenMeteoClient {
    async fn fetch(&self, location: &Location) -> Result<Observation, FetchError> {
        let mut last_err: Option<AttemptError> = None;

        for attempt in 0..self.max_attempts {
            match self.fetch_once(location).await {
                Ok(observation) => return Ok(observation),
                Err(AttemptError::Fatal(msg)) => return Err(FetchError::Malformed(msg)),
                Err(err @ (AttemptError::Throttled(_) | AttemptError::Retryable(..) | AttemptError::Timeout)) => {
                    let retry_after = err.retry_after();
                    warn!(attempt, city = %location.city_name, error = %err, "fetch attempt failed, retrying");
                    last_err = Some(err);
                    if attempt + 1 < self.max_attempts {
                        let delay = retry_after.unwrap_or_else(|| full_jitter_backoff(attempt, self.max_backoff));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        match last_err {
            Some(AttemptError::Throttled(_)) => Err(FetchError::Throttled),
            Some(AttemptError::Timeout) => Err(FetchError::Timeout),
            Some(AttemptError::Retryable(msg, _)) => Err(FetchError::Upstream(msg)),
            _ => Err(FetchError::Upstream("exhausted retries".to_string())),
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    Throttled(Option<Duration>),
    Retryable(String, Option<Duration>),
    Timeout,
    Fatal(String),
}

impl AttemptError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled(d) | Self::Retryable(_, d) => *d,
            Self::Timeout | Self::Fatal(_) => None,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Throttled(_) => write!(f, "throttled (429)"),
            Self::Retryable(msg, _) => write!(f, "{msg}"),
            Self::Timeout => write!(f, "timeout"),
            Self::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Full-jitter exponential backoff: `random(0, min(cap, base * 2^attempt))`.
fn full_jitter_backoff(attempt: u32, cap: Duration) -> Duration {
    let exp = 2_u64.saturating_pow(attempt).saturating_mul(1);
    let bounded = Duration::from_secs(exp).min(cap);
    let mut rng = rand::rng();
    let jittered_ms = rng.random_range(0..=bounded.as_millis().max(1) as u64);
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn location() -> Location {
        Location::new("Oslo", 59.9139, 10.7522)
    }

    #[test]
    fn full_jitter_backoff_never_exceeds_cap() {
        let cap = Duration::from_secs(32);
        for attempt in 0..10 {
            let delay = full_jitter_backoff(attempt, cap);
            assert!(delay <= cap, "attempt {attempt} produced {delay:?} > cap {cap:?}");
        }
    }

    #[tokio::test]
    async fn successful_response_maps_to_observation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("current_weather", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "current_weather": { "temperature": 3.5, "weathercode": 0, "time": 1_700_000_000 }
            })))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(
            format!("{}/", server.uri()),
            Duration::from_secs(5),
            10,
            5,
            Duration::from_secs(32),
        )
        .unwrap();

        let observation = client.fetch(&location()).await.unwrap();
        assert_eq!(observation.temperature, 3.5);
        assert_eq!(observation.condition, "Clear sky");
        assert_eq!(observation.recorded_at.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn missing_current_weather_is_malformed_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(
            format!("{}/", server.uri()),
            Duration::from_secs(5),
            10,
            5,
            Duration::from_secs(32),
        )
        .unwrap();

        let result = client.fetch(&location()).await;
        assert!(matches!(result, Err(FetchError::Malformed(_))));
    }

    #[tokio::test]
    async fn throttle_after_exhausting_retries_yields_throttled_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(
            format!("{}/", server.uri()),
            Duration::from_secs(5),
            10,
            2,
            Duration::from_secs(32),
        )
        .unwrap();

        let result = client.fetch(&location()).await;
        assert!(matches!(result, Err(FetchError::Throttled)));
    }

    #[tokio::test]
    async fn server_error_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "current_weather": { "temperature": -4.0, "weathercode": 71, "time": 1_700_000_100 }
            })))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(
            format!("{}/", server.uri()),
            Duration::from_secs(5),
            10,
            5,
            Duration::from_secs(1),
        )
        .unwrap();

        let observation = client.fetch(&location()).await.unwrap();
        assert_eq!(observation.condition, "Slight snow fall");
    }
}
