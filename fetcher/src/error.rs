//! Fetcher error hierarchy: domain errors specific to this binary layered
//! over the shared [`InfraError`], following a `DomainError` / `InfraError`
//! / `AppError` split.

use thiserror::Error;
use weather_core::error::InfraError;

#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP 429 from the upstream API, after the retry budget is exhausted.
    #[error("throttled by upstream after exhausting retries")]
    Throttled,

    /// Network error or 5xx, after the retry budget is exhausted.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The request timed out, after the retry budget is exhausted. Kept
    /// distinct from [`FetchError::Upstream`] so the worker pool and
    /// analytics reporter can count it separately, per the second-bucket
    /// schema's `{ok, fail, timeout, latency}` fields.
    #[error("upstream request timed out")]
    Timeout,

    /// 2xx response that does not carry the fields the contract requires.
    /// Never retried.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Broker unreachable on first connect, or other non-recoverable
    /// startup condition. The only case that should ever exit the process
    /// with a non-zero code.
    #[error("startup failure: {0}")]
    Startup(String),
}

/// Alias used throughout the binary for the local `Result<T>`.
pub type Result<T> = std::result::Result<T, FetchError>;
