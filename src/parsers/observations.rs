//! Historical/recent observation parser: a ZIP of a geography-history file
//! plus one `produkt_*.txt` hourly CSV, in five field variants.
//!
//! Grounded on the teacher's ZIP handling in
//! `providers::deutscher_wetterdienst` (`zip::ZipArchive`,
//! `is_measurement_file`), extended with the station-geography-history join
//! the historical/recent format requires.

use super::{ParseContext, Parser};
use crate::error::PipelineError;
use crate::model::{Location, ObservationType, ParsedRecord, SourceIdentity, WeatherFields};
use crate::units::{celsius_to_kelvin, hpa_to_pa, minutes_to_seconds, parse_mess_datum};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObservationVariant {
    Temperature,
    Precipitation,
    Wind,
    Sunshine,
    Pressure,
}

impl ObservationVariant {
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
            Regex::new(r"(?i)^stundenwerte_(TU|RR|FF|SD|P0)_\d+_(?:\d{8}_\d{8}_hist|akt)\.zip$").unwrap()
        });
        let caps = PATTERN.captures(filename)?;
        match caps.get(1)?.as_str().to_uppercase().as_str() {
            "TU" => Some(Self::Temperature),
            "RR" => Some(Self::Precipitation),
            "FF" => Some(Self::Wind),
            "SD" => Some(Self::Sunshine),
            "P0" => Some(Self::Pressure),
            _ => None,
        }
    }
}

fn observation_type_for(filename: &str) -> ObservationType {
    if filename.ends_with("_akt.zip") {
        ObservationType::Recent
    } else {
        ObservationType::Historical
    }
}

pub struct ObservationsParser {
    variant: ObservationVariant,
}

impl ObservationsParser {
    #[must_use]
    pub const fn new(variant: ObservationVariant) -> Self {
        Self { variant }
    }
}

#[derive(Debug, Clone)]
struct GeographyEntry {
    valid_from: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    height: f64,
    station_name: String,
}

impl Parser for ObservationsParser {
    fn should_skip(&self, ctx: &ParseContext) -> bool {
        let Some((_, start, end)) = extract_date_range(&ctx.url) else {
            return false;
        };
        if let Some(max_date) = ctx.max_date {
            if start > max_date {
                return true;
            }
        }
        if let Some(min_date) = ctx.min_date {
            if end < min_date {
                return true;
            }
        }
        false
    }

    fn parse(&self, path: &Path, ctx: &ParseContext) -> Result<Vec<ParsedRecord>, PipelineError> {
        self.parse_inner(path, ctx).map_err(|source| PipelineError::Parse {
            url: ctx.url.clone(),
            source,
        })
    }
}

fn extract_date_range(filename: &str) -> Option<(String, DateTime<Utc>, DateTime<Utc>)> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"_(\d{8})_(\d{8})_hist\.zip$").unwrap());
    let caps = PATTERN.captures(filename)?;
    let start = parse_mess_datum(&format!("{}00", &caps[1])).ok()?;
    let end = parse_mess_datum(&format!("{}00", &caps[2])).ok()?;
    Some((filename.to_owned(), start, end))
}

impl ObservationsParser {
    fn parse_inner(&self, path: &Path, ctx: &ParseContext) -> anyhow::Result<Vec<ParsedRecord>> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let geography = read_geography_history(&mut archive)?;
        let product_entry_index = find_product_entry(&mut archive)?;
        let mut produkt_entry = archive.by_index(product_entry_index)?;
        let mut content = String::new();
        produkt_entry.read_to_string(&mut content)?;
        drop(produkt_entry);

        let mut reader = ReaderBuilder::new()
            .delimiter(b';')
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers = reader.headers()?.clone();
        let column_index = |name: &str| headers.iter().position(|h| h.trim() == name);

        let station_index = column_index("STATIONS_ID");
        let date_index = column_index("MESS_DATUM");
        let (value_column, field_setter): (&str, fn(&mut WeatherFields, Option<f64>)) = match self.variant {
            ObservationVariant::Temperature => ("TT_TU", |f, v| f.temperature = v.map(celsius_to_kelvin)),
            ObservationVariant::Precipitation => ("R1", |f, v| f.precipitation = v),
            ObservationVariant::Wind => ("F", |f, v| f.wind_speed = v),
            ObservationVariant::Sunshine => ("SD_SO", |f, v| f.sunshine = v.map(minutes_to_seconds)),
            ObservationVariant::Pressure => ("P0", |f, v| f.pressure_msl = v.map(hpa_to_pa)),
        };
        let value_index = column_index(value_column);
        let wind_direction_index = if self.variant == ObservationVariant::Wind {
            column_index("D")
        } else {
            None
        };

        let mut records = Vec::new();
        let observation_type = observation_type_for(&ctx.url);
        let mut station_code = String::new();

        for row in reader.records() {
            let row = row?;

            if station_code.is_empty() {
                if let Some(idx) = station_index {
                    if let Some(value) = row.get(idx) {
                        station_code = value.trim().to_owned();
                    }
                }
            }

            let Some(date_idx) = date_index else {
                continue;
            };
            let Some(raw_date) = row.get(date_idx) else {
                continue;
            };
            let Ok(timestamp) = parse_mess_datum(raw_date) else {
                continue;
            };

            if let Some(min_date) = ctx.min_date {
                if timestamp < min_date {
                    continue;
                }
            }
            if let Some(max_date) = ctx.max_date {
                if timestamp > max_date {
                    continue;
                }
            }

            let raw_value = value_index.and_then(|idx| row.get(idx)).and_then(parse_sentinel);
            let mut fields = WeatherFields::default();
            field_setter(&mut fields, raw_value);

            if let Some(idx) = wind_direction_index {
                fields.wind_direction = row.get(idx).and_then(parse_sentinel);
            }

            let fields = WeatherFields {
                temperature: ctx.ignored_values.apply(&ctx.url, timestamp, "temperature", fields.temperature),
                wind_direction: ctx.ignored_values.apply(&ctx.url, timestamp, "wind_direction", fields.wind_direction),
                wind_speed: ctx.ignored_values.apply(&ctx.url, timestamp, "wind_speed", fields.wind_speed),
                precipitation: ctx.ignored_values.apply(&ctx.url, timestamp, "precipitation", fields.precipitation),
                sunshine: ctx.ignored_values.apply(&ctx.url, timestamp, "sunshine", fields.sunshine),
                pressure_msl: ctx.ignored_values.apply(&ctx.url, timestamp, "pressure_msl", fields.pressure_msl),
            }
            .sanitized();

            let location = find_location(&geography, timestamp);

            records.push(ParsedRecord {
                source: SourceIdentity {
                    observation_type,
                    station_code: station_code.clone(),
                    wmo_station_id: None,
                    station_name: location.as_ref().map(|g| g.station_name.clone()),
                    location: location.map_or(Location::LookupByForecastStation, |g| Location::Known {
                        latitude: g.latitude,
                        longitude: g.longitude,
                        height: g.height,
                    }),
                },
                timestamp,
                fields,
            });
        }

        Ok(records)
    }
}

fn parse_sentinel(value: &str) -> Option<f64> {
    let value = value.trim();
    let parsed = value.parse::<f64>().ok()?;
    if (parsed - (-999.0)).abs() < f64::EPSILON {
        None
    } else {
        Some(parsed)
    }
}

fn find_product_entry(archive: &mut zip::ZipArchive<File>) -> anyhow::Result<usize> {
    for index in 0..archive.len() {
        let name = archive.by_index(index)?.name().to_owned();
        if name.to_lowercase().starts_with("produkt_") {
            return Ok(index);
        }
    }
    anyhow::bail!("no produkt_*.txt entry found in observations archive")
}

/// Reads the `Metadaten_Geographie_<id>.txt` entry into a history sorted
/// ascending by `valid_from`, so the latest entry with `valid_from <= t` can
/// be found by scanning from the end.
fn read_geography_history(archive: &mut zip::ZipArchive<File>) -> anyhow::Result<Vec<GeographyEntry>> {
    let mut geography_index = None;
    for index in 0..archive.len() {
        let name = archive.by_index(index)?.name().to_owned();
        if name.to_lowercase().starts_with("metadaten_geographie") {
            geography_index = Some(index);
            break;
        }
    }
    let Some(index) = geography_index else {
        return Ok(Vec::new());
    };

    let mut entry = archive.by_index(index)?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    drop(entry);

    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers()?.clone();
    let idx = |name: &str| headers.iter().position(|h| h.trim() == name);
    let (Some(from_idx), Some(lat_idx), Some(lon_idx), Some(height_idx), Some(name_idx)) = (
        idx("von_datum"),
        idx("Geogr.Breite"),
        idx("Geogr.Laenge"),
        idx("Stationshoehe"),
        idx("Stationsname"),
    ) else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for row in reader.records() {
        let row = row?;
        let Some(valid_from) = row.get(from_idx).and_then(|v| parse_mess_datum(&format!("{v}00")).ok()) else {
            continue;
        };
        let Some(latitude) = row.get(lat_idx).and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        let Some(longitude) = row.get(lon_idx).and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        let Some(height) = row.get(height_idx).and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        let station_name = row.get(name_idx).unwrap_or_default().to_owned();

        entries.push(GeographyEntry {
            valid_from,
            latitude,
            longitude,
            height,
            station_name,
        });
    }

    entries.sort_by_key(|e| e.valid_from);
    Ok(entries)
}

fn find_location(history: &[GeographyEntry], timestamp: DateTime<Utc>) -> Option<GeographyEntry> {
    history
        .iter()
        .rev()
        .find(|entry| entry.valid_from <= timestamp)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn should_skip_when_filename_range_is_entirely_before_min_date() {
        let parser = ObservationsParser::new(ObservationVariant::Temperature);
        let ctx = ParseContext {
            url: "stundenwerte_TU_00044_19500101_19551231_hist.zip".to_owned(),
            min_date: Some(parse_mess_datum("2020010100").unwrap()),
            max_date: None,
            ignored_values: std::sync::Arc::new(crate::parsers::IgnoredValues::empty()),
        };
        assert!(parser.should_skip(&ctx));
    }

    #[test]
    fn dispatches_temperature_variant() {
        assert_eq!(
            ObservationVariant::from_filename("stundenwerte_TU_00044_19500101_19991231_hist.zip"),
            Some(ObservationVariant::Temperature)
        );
    }

    #[test]
    fn dispatches_pressure_variant_akt() {
        assert_eq!(
            ObservationVariant::from_filename("stundenwerte_P0_00044_akt.zip"),
            Some(ObservationVariant::Pressure)
        );
    }

    #[test]
    fn treats_minus_999_as_sentinel() {
        assert_eq!(parse_sentinel("-999"), None);
    }

    #[test]
    fn picks_latest_geography_entry_not_after_timestamp() {
        let history = vec![
            GeographyEntry {
                valid_from: parse_mess_datum("1950010100").unwrap(),
                latitude: 1.0,
                longitude: 1.0,
                height: 1.0,
                station_name: "old".to_owned(),
            },
            GeographyEntry {
                valid_from: parse_mess_datum("2000010100").unwrap(),
                latitude: 2.0,
                longitude: 2.0,
                height: 2.0,
                station_name: "new".to_owned(),
            },
        ];
        let found = find_location(&history, parse_mess_datum("2010010100").unwrap()).unwrap();
        assert_eq!(found.station_name, "new");
    }
}
