//! Shared infrastructure error type.
//!
//! Both binaries layer their own domain errors (`fetcher::error::FetchError`,
//! `processor::error::ProcessError`) on top of this one, mirroring the
//! `DomainError` / `InfraError` / `AppError` split: domain errors describe
//! what went wrong in pipeline terms, `InfraError` describes what went
//! wrong talking to the broker, the upstream API, or the store.

use thiserror::Error;

/// Errors crossing a transport or storage boundary. Deliberately
/// backend-agnostic — neither `redis` nor `reqwest` types appear here, since
/// this crate stays a thin shared-types layer; the broker and each binary
/// convert their concrete errors into this shape at the port boundary.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("upstream http error: {0}")]
    Http(String),

    #[error("time-series store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
