//! WMO weather-code → human-readable condition table.
//!
//! Codes follow the WMO 4677 present-weather table used by Open-Meteo's
//! `current_weather.weathercode` field. An unrecognized code is not an
//! error: it is stamped as the literal `WMO-<n>` so the pipeline never
//! drops an observation over a table gap.

/// Maps a WMO weather code to its condition label, falling back to
/// `WMO-<n>` for codes outside the fixed table.
#[must_use]
pub fn condition_for_code(code: i64) -> String {
    lookup(code)
        .map(str::to_string)
        .unwrap_or_else(|| format!("WMO-{code}"))
}

fn lookup(code: i64) -> Option<&'static str> {
    Some(match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        56 => "Light freezing drizzle",
        57 => "Dense freezing drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        66 => "Light freezing rain",
        67 => "Heavy freezing rain",
        71 => "Slight snow fall",
        73 => "Moderate snow fall",
        75 => "Heavy snow fall",
        77 => "Snow grains",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        85 => "Slight snow showers",
        86 => "Heavy snow showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_resolves_to_label() {
        assert_eq!(condition_for_code(0), "Clear sky");
        assert_eq!(condition_for_code(95), "Thunderstorm");
    }

    #[test]
    fn unknown_code_falls_back_to_wmo_literal() {
        assert_eq!(condition_for_code(42), "WMO-42");
        assert_eq!(condition_for_code(-1), "WMO--1");
    }
}
