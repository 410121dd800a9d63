//! Synthetic producer used in place of the real upstream call when
//! `USE_MOCK` is set. Downstream code cannot tell the difference: same
//! [`WeatherClient`] contract, same [`Observation`] shape.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use rand::Rng;
use weather_core::types::{Location, Observation};

use crate::error::FetchError;

use super::WeatherClient;

const CONDITIONS: &[(&str, u32)] = &[
    ("Clear sky", 35),
    ("Mainly clear", 15),
    ("Partly cloudy", 20),
    ("Overcast", 10),
    ("Slight rain", 10),
    ("Moderate rain", 5),
    ("Fog", 3),
    ("Slight snow fall", 2),
];

#[derive(Debug, Clone, Default)]
pub struct MockWeatherClient;

impl MockWeatherClient {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn base_temperature(latitude: f64) -> f64 {
        // Roughly tropical-to-polar gradient: ~28C at the equator down to
        // ~-25C at the poles.
        28.0 - (latitude.abs() / 90.0) * 53.0
    }

    fn seasonal_adjustment(latitude: f64) -> f64 {
        let month = i32::from(Utc::now().month());
        // Northern summer peaks in July (month 7); southern hemisphere is
        // six months out of phase.
        let phase = if latitude >= 0.0 { month } else { (month + 5) % 12 + 1 };
        let raw_distance = (phase - 7).abs();
        let circular_distance = raw_distance.min(12 - raw_distance);
        let seasonal_swing = 10.0;
        seasonal_swing * (1.0 - f64::from(circular_distance) / 6.0)
    }

    fn weighted_condition(latitude: f64, rng: &mut impl Rng) -> &'static str {
        let suppress_snow = latitude.abs() <= 45.0;
        let pool: Vec<(&'static str, u32)> = CONDITIONS
            .iter()
            .copied()
            .filter(|(name, _)| !(suppress_snow && *name == "Slight snow fall"))
            .collect();
        let total: u32 = pool.iter().map(|(_, w)| w).sum();
        let mut pick = rng.random_range(0..total);
        for (name, weight) in &pool {
            if pick < *weight {
                return name;
            }
            pick -= weight;
        }
        pool.last().map_or("Clear sky", |(name, _)| name)
    }
}

#[async_trait]
impl WeatherClient for MockWeatherClient {
    async fn fetch(&self, location: &Location) -> Result<Observation, FetchError> {
        let mut rng = rand::rng();
        let latency = Duration::from_millis(rng.random_range(80..=350));
        tokio::time::sleep(latency).await;

        let temperature =
            Self::base_temperature(location.latitude) + Self::seasonal_adjustment(location.latitude);
        let condition = Self::weighted_condition(location.latitude, &mut rng);

        Ok(Observation {
            city_name: location.city_name.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            temperature,
            condition: condition.to_string(),
            recorded_at: Utc::now(),
        })
    }
}
