//! The upstream fetch contract and its two implementations: the real
//! Open-Meteo client and a synthetic mock producer used when `USE_MOCK` is
//! set. Everything downstream of [`WeatherClient::fetch`] observes
//! identical semantics either way.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use weather_core::types::{Location, Observation};

use crate::error::FetchError;

#[async_trait]
pub trait WeatherClient: Send + Sync {
    async fn fetch(&self, location: &Location) -> Result<Observation, FetchError>;
}
