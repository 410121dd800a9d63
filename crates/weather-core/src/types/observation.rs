use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A single weather reading for one [`crate::types::Location`].
///
/// Produced by a fetch worker, appended to the broker stream as a flat field
/// map (see [`Observation::to_stream_fields`]), parsed back by the processor's
/// consumer (see [`Observation::from_stream_fields`]), and written to the
/// time-series store keyed by `(measurement, tags, recorded_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub city_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    /// Human-readable condition label, e.g. `"Clear sky"` or `"WMO-42"` for
    /// an unrecognized code.
    pub condition: String,
    /// Upstream-reported observation time. Never the ingestion time.
    pub recorded_at: DateTime<Utc>,
}

impl Observation {
    /// Field map written to the broker stream. Every value is a string, per
    /// the stream entry contract.
    #[must_use]
    pub fn to_stream_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("city_name", self.city_name.clone()),
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("temperature", self.temperature.to_string()),
            ("weather_condition", self.condition.clone()),
            ("recorded_at", self.recorded_at.to_rfc3339()),
        ]
    }

    /// Reconstructs an observation from a raw stream field map, applying the
    /// same per-field defaults the consumer's phase-2 loop uses for missing
    /// or unparsable keys: city `"unknown"`, numerics `0`, condition
    /// `"unknown"`, timestamp `now` on absence.
    ///
    /// A `recorded_at` value that is *present* but fails to parse is not
    /// defaulted to now; the caller should reject the entry instead (see
    /// `processor::consumer`), since coercing a malformed timestamp to the
    /// current time would corrupt the store's time axis.
    #[must_use]
    pub fn from_stream_fields(fields: &HashMap<String, String>) -> Self {
        let city_name = fields
            .get("city_name")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let latitude = fields
            .get("latitude")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let longitude = fields
            .get("longitude")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let temperature = fields
            .get("temperature")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let condition = fields
            .get("weather_condition")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        let recorded_at = fields
            .get("recorded_at")
            .and_then(|v| parse_timestamp(v))
            .unwrap_or_else(Utc::now);

        Self {
            city_name,
            latitude,
            longitude,
            temperature,
            condition,
            recorded_at,
        }
    }

    /// Whether `recorded_at` was present in `fields` but could not be
    /// parsed. The consumer uses this to reject the entry rather than
    /// silently stamping it with the current time.
    #[must_use]
    pub fn has_unparsable_timestamp(fields: &HashMap<String, String>) -> bool {
        matches!(fields.get("recorded_at"), Some(raw) if parse_timestamp(raw).is_none())
    }
}

/// Accepts RFC 3339 (what the fetcher writes) and bare epoch-millisecond
/// integers (what the upstream API's own `time` field would look like if
/// forwarded unconverted).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Observation {
        Observation {
            city_name: "Oslo".to_string(),
            latitude: 59.9139,
            longitude: 10.7522,
            temperature: 3.5,
            condition: "Clear sky".to_string(),
            recorded_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
        }
    }

    #[test]
    fn stream_round_trip_preserves_fields() {
        let obs = sample();
        let fields: HashMap<String, String> = obs
            .to_stream_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = Observation::from_stream_fields(&fields);
        assert_eq!(obs, back);
    }

    #[test]
    fn missing_fields_default_per_contract() {
        let fields = HashMap::new();
        let obs = Observation::from_stream_fields(&fields);
        assert_eq!(obs.city_name, "unknown");
        assert_eq!(obs.latitude, 0.0);
        assert_eq!(obs.longitude, 0.0);
        assert_eq!(obs.temperature, 0.0);
        assert_eq!(obs.condition, "unknown");
    }

    #[test]
    fn unparsable_timestamp_is_flagged_not_silently_defaulted() {
        let mut fields = HashMap::new();
        fields.insert("recorded_at".to_string(), "not-a-time".to_string());
        assert!(Observation::has_unparsable_timestamp(&fields));
    }

    #[test]
    fn absent_timestamp_is_not_flagged_as_unparsable() {
        let fields = HashMap::new();
        assert!(!Observation::has_unparsable_timestamp(&fields));
    }

    #[test]
    fn accepts_epoch_millis() {
        let mut fields = HashMap::new();
        fields.insert("recorded_at".to_string(), "1700000000000".to_string());
        let obs = Observation::from_stream_fields(&fields);
        assert_eq!(obs.recorded_at.timestamp(), 1_700_000_000);
    }
}
