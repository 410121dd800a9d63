//! Shared domain types for the weather telemetry pipeline.
//!
//! ```text
//!                 ┌─────────────┐        ┌──────────────┐
//!   catalog() ───▶│   fetcher   │──XADD─▶│  broker       │
//!                 │ (scheduler, │        │  (Redis       │
//!                 │  workers)   │        │   streams)    │
//!                 └─────────────┘        └───────┬───────┘
//!                                                 │ XREADGROUP
//!                                                 ▼
//!                                         ┌──────────────┐
//!                                         │  processor   │
//!                                         │ (consumer +  │
//!                                         │  writer)     │
//!                                         └──────────────┘
//! ```
//!
//! Both binaries depend on this crate for the [`Location`] catalog, the wire
//! types that cross the broker boundary ([`Observation`], [`Cycle`]), the WMO
//! weather-code table, and the shared [`error`] hierarchy.

pub mod error;
pub mod locations;
pub mod types;
pub mod wmo;

/// Crate version, exposed for `--version` output and log lines.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
