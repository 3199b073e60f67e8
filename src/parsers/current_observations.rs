//! Current-observations parser: a semicolon-delimited CSV snapshot of the
//! last hour's readings per POI station, keyed back to a MOSMIX forecast
//! station by code.
//!
//! Grounded on the teacher's `parse_weather_station_list_csv`
//! (space/semicolon-delimited `csv::ReaderBuilder` with lenient trimming),
//! generalized to this pipeline's sentinel/decimal-comma handling. Column
//! resolution follows `original_source/brightsky/parsers.py`'s
//! `CurrentObservationsParser`: the file's header row carries the DWD's
//! published English element descriptions verbatim, and every row is
//! addressed by those names rather than by position.

use super::{ParseContext, Parser};
use crate::error::PipelineError;
use crate::model::{Location, ObservationType, ParsedRecord, SourceIdentity, WeatherFields};
use crate::units::{celsius_to_kelvin, hpa_to_pa, kmh_to_ms, minutes_to_seconds, parse_current_observations_timestamp};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::path::Path;

pub struct CurrentObservationsParser;

impl Parser for CurrentObservationsParser {
    fn parse(&self, path: &Path, ctx: &ParseContext) -> Result<Vec<ParsedRecord>, PipelineError> {
        self.parse_inner(path, ctx).map_err(|source| PipelineError::Parse {
            url: ctx.url.clone(),
            source,
        })
    }
}

/// The header row's literal column name for the `DD.MM.YY` date part of the
/// timestamp. The same column holds the station id (trailing `_` stripped)
/// in the row directly below the header.
const DATE_COLUMN: &str = "surface observations";
/// The header row's literal column name for the `HH:MM` hour part of the
/// timestamp.
const HOUR_COLUMN: &str = "Parameter description";

/// `(header name, field setter)`. Names and the occasional inconsistent
/// spacing are copied verbatim from the DWD's published POI column headers.
const ELEMENTS: &[(&str, fn(&mut WeatherFields, Option<f64>))] = &[
    ("dry_bulb_temperature_at_2_meter_above_ground", |f, v| {
        f.temperature = v.map(celsius_to_kelvin);
    }),
    (
        "mean_wind_direction_during_last_10 min_at_10_meters_above_ground",
        |f, v| f.wind_direction = v,
    ),
    (
        "mean_wind_speed_during last_10_min_at_10_meters_above_ground",
        |f, v| f.wind_speed = v.map(kmh_to_ms),
    ),
    ("precipitation_amount_last_hour", |f, v| f.precipitation = v),
    ("pressure_reduced_to_mean_sea_level", |f, v| {
        f.pressure_msl = v.map(hpa_to_pa);
    }),
    ("total_time_of_sunshine_during_last_hour", |f, v| {
        f.sunshine = v.map(minutes_to_seconds);
    }),
];

fn parse_decimal(value: &str) -> Option<f64> {
    let value = value.trim();
    if value == "---" || value.is_empty() {
        return None;
    }
    value.replace(',', ".").parse::<f64>().ok()
}

fn column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|header| header.trim() == name)
}

impl CurrentObservationsParser {
    fn parse_inner(&self, path: &Path, ctx: &ParseContext) -> anyhow::Result<Vec<ParsedRecord>> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b';')
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)?;

        let headers = reader.headers()?.clone();
        let date_index = column(&headers, DATE_COLUMN)
            .ok_or_else(|| anyhow::anyhow!("missing '{DATE_COLUMN}' column in current-observations file"))?;
        let hour_index = column(&headers, HOUR_COLUMN)
            .ok_or_else(|| anyhow::anyhow!("missing '{HOUR_COLUMN}' column in current-observations file"))?;
        let element_indices: Vec<(usize, fn(&mut WeatherFields, Option<f64>))> = ELEMENTS
            .iter()
            .filter_map(|&(name, setter)| column(&headers, name).map(|idx| (idx, setter)))
            .collect();

        let mut rows = reader.records();

        let station_row = rows.next().transpose()?;
        let Some(station_row) = station_row else {
            return Ok(Vec::new());
        };
        let station_code = station_row
            .get(date_index)
            .unwrap_or_default()
            .trim_end_matches('_')
            .to_owned();
        anyhow::ensure!(!station_code.is_empty(), "missing station code in current-observations file");

        // next row carries localized (German) header titles, skip it
        rows.next().transpose()?;

        let mut records = Vec::new();

        for row in rows {
            let row = row?;
            let Some(date_part) = row.get(date_index) else {
                continue;
            };
            let Some(hour_part) = row.get(hour_index) else {
                continue;
            };
            let Ok(timestamp) = parse_current_observations_timestamp(&format!("{date_part} {hour_part}")) else {
                continue;
            };

            let mut fields = WeatherFields::default();
            for &(index, setter) in &element_indices {
                let value = row.get(index).and_then(parse_decimal);
                setter(&mut fields, value);
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

            records.push(ParsedRecord {
                source: SourceIdentity {
                    observation_type: ObservationType::Current,
                    station_code: station_code.clone(),
                    wmo_station_id: None,
                    station_name: None,
                    location: Location::LookupByForecastStation,
                },
                timestamp,
                fields,
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_decimal_comma() {
        assert_eq!(parse_decimal("23,5"), Some(23.5));
    }

    #[test]
    fn treats_sentinel_as_null() {
        assert_eq!(parse_decimal("---"), None);
    }

    #[test]
    fn resolves_columns_by_header_name() {
        let headers = StringRecord::from(vec![DATE_COLUMN, HOUR_COLUMN, "dry_bulb_temperature_at_2_meter_above_ground"]);
        assert_eq!(column(&headers, DATE_COLUMN), Some(0));
        assert_eq!(column(&headers, HOUR_COLUMN), Some(1));
        assert_eq!(
            column(&headers, "dry_bulb_temperature_at_2_meter_above_ground"),
            Some(2)
        );
        assert_eq!(column(&headers, "not_a_real_column"), None);
    }

    #[test]
    fn composes_timestamp_from_date_and_hour_columns() {
        let date_part = "27.07.26";
        let hour_part = "14:00";
        let timestamp = parse_current_observations_timestamp(&format!("{date_part} {hour_part}")).unwrap();
        assert_eq!(timestamp.to_string(), "2026-07-27 14:00:00 UTC");
    }
}
