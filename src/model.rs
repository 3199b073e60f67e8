//! Persisted record shapes: sources, weather rows and the parsed-file ledger.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ObservationType {
    Forecast,
    Current,
    Recent,
    Historical,
    Synop,
}

impl ObservationType {
    /// Preference rank used when composing `weather()` results across sources:
    /// lower is preferred.
    #[must_use]
    pub const fn preference_rank(self) -> u8 {
        match self {
            Self::Current => 0,
            Self::Recent => 1,
            Self::Historical => 2,
            Self::Forecast => 3,
            Self::Synop => 4,
        }
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Forecast => "forecast",
            Self::Current => "current",
            Self::Recent => "recent",
            Self::Historical => "historical",
            Self::Synop => "synop",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub observation_type: ObservationType,
    pub station_code: String,
    pub wmo_station_id: Option<String>,
    pub station_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
    #[sqlx(default)]
    pub distance: Option<f64>,
    #[sqlx(default)]
    pub first_record: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub last_record: Option<DateTime<Utc>>,
}

/// A source's location as known at parse time. Current-observations rows
/// don't carry their own coordinates; their station is identified by code
/// only, and must be resolved against an already-known forecast source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Location {
    Known {
        latitude: f64,
        longitude: f64,
        height: f64,
    },
    LookupByForecastStation,
}

/// A source as parsed from a raw file, not yet assigned a surrogate id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceIdentity {
    pub observation_type: ObservationType,
    pub station_code: String,
    pub wmo_station_id: Option<String>,
    pub station_name: Option<String>,
    pub location: Location,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherFields {
    pub temperature: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub precipitation: Option<f64>,
    pub sunshine: Option<f64>,
    pub pressure_msl: Option<f64>,
}

impl WeatherFields {
    /// Applies invariants I2/I3, nulling out-of-range values and logging a
    /// warning for each one (sanitization problems are never fatal).
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if let Some(degrees) = self.wind_direction {
            self.wind_direction = crate::units::normalize_wind_direction(degrees);
            if self.wind_direction.is_none() {
                warn!("wind_direction {degrees} is out of range, nulling");
            }
        }
        if let Some(mm) = self.precipitation {
            self.precipitation = crate::units::normalize_precipitation(mm);
            if self.precipitation.is_none() {
                warn!("precipitation {mm} is negative, nulling");
            }
        }
        self
    }

    /// Coalesces `self`'s non-null fields over `other`'s, as the upsert does
    /// in the database: non-null incoming values win, nulls preserve.
    #[must_use]
    pub fn coalesce(self, other: &Self) -> Self {
        Self {
            temperature: self.temperature.or(other.temperature),
            wind_direction: self.wind_direction.or(other.wind_direction),
            wind_speed: self.wind_speed.or(other.wind_speed),
            precipitation: self.precipitation.or(other.precipitation),
            sunshine: self.sunshine.or(other.sunshine),
            pressure_msl: self.pressure_msl.or(other.pressure_msl),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRecord {
    pub source: SourceIdentity,
    pub timestamp: DateTime<Utc>,
    pub fields: WeatherFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WeatherRow {
    pub source_id: i64,
    pub timestamp: DateTime<Utc>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub fields: WeatherFields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFileLedgerEntry {
    pub url: String,
    pub last_modified: DateTime<Utc>,
    pub file_size: i64,
}
