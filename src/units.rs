//! Unit conversions and timestamp parsing shared across parsers and the query engine.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const ABSOLUTE_ZERO_IN_CELSIUS: f64 = 273.15;

pub fn celsius_to_kelvin(celsius: f64) -> f64 {
    celsius + ABSOLUTE_ZERO_IN_CELSIUS
}

pub fn hpa_to_pa(hpa: f64) -> f64 {
    hpa * 100.0
}

pub fn kmh_to_ms(kmh: f64) -> f64 {
    kmh / 3.6
}

pub fn minutes_to_seconds(minutes: f64) -> f64 {
    minutes * 60.0
}

/// Folds a wind direction into `[0, 360)`, nulling values that cannot be a
/// sane compass bearing after folding once.
pub fn normalize_wind_direction(degrees: f64) -> Option<f64> {
    if (0.0..360.0).contains(&degrees) {
        Some(degrees)
    } else if (360.0..720.0).contains(&degrees) {
        Some(degrees - 360.0)
    } else {
        None
    }
}

pub fn normalize_precipitation(mm: f64) -> Option<f64> {
    if mm < 0.0 {
        None
    } else {
        Some(mm)
    }
}

/// Parses the MOSMIX/DWD station-list timestamp form `DD.MM.YY HH:MM` as UTC.
pub fn parse_current_observations_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), "%d.%m.%y %H:%M")?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Parses the historical/recent CSV `MESS_DATUM` column, `YYYYMMDDHH`, as UTC.
pub fn parse_mess_datum(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), "%Y%m%d%H")?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Parses a MOSMIX `IssueTime`/`TimeStep`, `YYYY-MM-DDTHH:MM:SS.sssZ`, as UTC.
pub fn parse_mosmix_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value.trim())?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn converts_celsius_to_kelvin() {
        assert_eq!(celsius_to_kelvin(23.5), 296.65);
    }

    #[test]
    fn folds_wind_direction_above_360() {
        assert_eq!(normalize_wind_direction(370.0), Some(10.0));
    }

    #[test]
    fn nulls_wind_direction_far_out_of_range() {
        assert_eq!(normalize_wind_direction(1000.0), None);
    }

    #[test]
    fn nulls_negative_precipitation() {
        assert_eq!(normalize_precipitation(-0.1), None);
    }

    #[test]
    fn parses_current_observations_timestamp() {
        let parsed = parse_current_observations_timestamp("27.07.26 14:00").unwrap();
        assert_eq!(parsed.to_string(), "2026-07-27 14:00:00 UTC");
    }

    #[test]
    fn parses_mess_datum() {
        let parsed = parse_mess_datum("2026072714").unwrap();
        assert_eq!(parsed.to_string(), "2026-07-27 14:00:00 UTC");
    }
}
