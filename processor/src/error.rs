//! Processor error hierarchy, mirroring `fetcher::error::FetchError`'s split
//! over the shared [`InfraError`].

use thiserror::Error;
use weather_core::error::InfraError;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// A stream entry's `recorded_at` was present but failed to parse.
    /// Per the design notes, such entries are rejected rather than
    /// defaulted to now, to avoid corrupting the store's time axis.
    #[error("unparsable recorded_at timestamp on entry {0}")]
    UnparsableTimestamp(String),

    #[error("time-series write failed: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("startup failure: {0}")]
    Startup(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
