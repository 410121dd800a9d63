use serde::{Deserialize, Serialize};

/// A monitored geographic point.
///
/// Static and loaded once at process start from [`crate::locations::catalog`];
/// the scheduler pushes one [`Location`] per job every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Stable city name, used as the tag value on the time-series point.
    pub city_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    #[must_use]
    pub fn new(city_name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            city_name: city_name.into(),
            latitude,
            longitude,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_nothing_but_stores_fields_verbatim() {
        let loc = Location::new("Reykjavik", 64.1466, -21.9426);
        assert_eq!(loc.city_name, "Reykjavik");
        assert!((loc.latitude - 64.1466).abs() < f64::EPSILON);
        assert!((loc.longitude - (-21.9426)).abs() < f64::EPSILON);
    }

    #[test]
    fn round_trips_through_json() {
        let loc = Location::new("Oslo", 59.9139, 10.7522);
        let json = serde_json::to_string(&loc).unwrap();
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(loc, back);
    }
}
