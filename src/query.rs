//! Geospatial `sources()` and temporal `weather()` queries with one-shot
//! missing-field fallback.

use crate::error::PipelineError;
use crate::model::{Source, WeatherFields, WeatherRow};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use std::collections::HashMap;

/// Selector for `sources()`/`weather()`: exactly one of these identifies the
/// target station(s).
#[derive(Debug, Clone)]
pub enum SourceSelector {
    SourceId(i64),
    DwdStationId(String),
    WmoStationId(String),
    Coordinates { latitude: f64, longitude: f64, max_dist_meters: f64 },
}

pub async fn sources(pool: &PgPool, selector: &SourceSelector) -> Result<Vec<Source>, PipelineError> {
    let rows = match selector {
        SourceSelector::SourceId(id) => {
            sqlx::query_as::<_, Source>(
                "SELECT id, observation_type, station_code, wmo_station_id, station_name,
                        latitude, longitude, height, NULL::double precision AS distance,
                        NULL::timestamptz AS first_record, NULL::timestamptz AS last_record
                 FROM sources WHERE id = $1",
            )
            .bind(id)
            .fetch_all(pool)
            .await?
        }
        SourceSelector::DwdStationId(code) => {
            sqlx::query_as::<_, Source>(
                "SELECT id, observation_type, station_code, wmo_station_id, station_name,
                        latitude, longitude, height, NULL::double precision AS distance,
                        NULL::timestamptz AS first_record, NULL::timestamptz AS last_record
                 FROM sources WHERE station_code = $1
                 ORDER BY
                   CASE observation_type
                     WHEN 'current' THEN 0 WHEN 'recent' THEN 1
                     WHEN 'historical' THEN 2 WHEN 'forecast' THEN 3 ELSE 4
                   END",
            )
            .bind(code)
            .fetch_all(pool)
            .await?
        }
        SourceSelector::WmoStationId(code) => {
            sqlx::query_as::<_, Source>(
                "SELECT id, observation_type, station_code, wmo_station_id, station_name,
                        latitude, longitude, height, NULL::double precision AS distance,
                        NULL::timestamptz AS first_record, NULL::timestamptz AS last_record
                 FROM sources WHERE wmo_station_id = $1
                 ORDER BY
                   CASE observation_type
                     WHEN 'current' THEN 0 WHEN 'recent' THEN 1
                     WHEN 'historical' THEN 2 WHEN 'forecast' THEN 3 ELSE 4
                   END",
            )
            .bind(code)
            .fetch_all(pool)
            .await?
        }
        SourceSelector::Coordinates {
            latitude,
            longitude,
            max_dist_meters,
        } => {
            sqlx::query_as::<_, Source>(
                "SELECT id, observation_type, station_code, wmo_station_id, station_name,
                        latitude, longitude, height,
                        earth_distance(ll_to_earth($1, $2), ll_to_earth(latitude, longitude)) AS distance,
                        NULL::timestamptz AS first_record, NULL::timestamptz AS last_record
                 FROM sources
                 WHERE earth_box(ll_to_earth($1, $2), $3) @> ll_to_earth(latitude, longitude)
                   AND earth_distance(ll_to_earth($1, $2), ll_to_earth(latitude, longitude)) <= $3
                 ORDER BY
                   CASE observation_type
                     WHEN 'current' THEN 0 WHEN 'recent' THEN 1
                     WHEN 'historical' THEN 2 WHEN 'forecast' THEN 3 ELSE 4
                   END,
                   distance",
            )
            .bind(latitude)
            .bind(longitude)
            .bind(max_dist_meters)
            .fetch_all(pool)
            .await?
        }
    };

    if rows.is_empty() {
        return Err(PipelineError::Lookup);
    }

    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct WeatherResult {
    pub rows: Vec<WeatherRow>,
    pub sources: Vec<Source>,
    pub fallback_source_ids: HashMap<DateTime<Utc>, HashMap<String, i64>>,
}

/// Runs `weather(date, last_date, selector)`. When `source_id` is present in
/// the selector the lookup is direct; otherwise candidate sources are
/// resolved via [`sources`] in preference order and composed with
/// `DISTINCT ON (timestamp)`. A single extra fallback query fills remaining
/// nulls from the same candidate set, per field, recording the contributing
/// source id.
pub async fn weather(
    pool: &PgPool,
    date: DateTime<Utc>,
    last_date: Option<DateTime<Utc>>,
    selector: &SourceSelector,
    fallback: bool,
) -> Result<WeatherResult, PipelineError> {
    let last_date = last_date.unwrap_or(date + Duration::days(1));

    let matched_sources = sources(pool, selector).await?;
    let source_ids: Vec<i64> = matched_sources.iter().map(|s| s.id).collect();

    let primary_rows = sqlx::query_as::<_, WeatherRow>(
        "SELECT DISTINCT ON (weather.timestamp)
                weather.source_id, weather.timestamp, weather.temperature, weather.wind_direction,
                weather.wind_speed, weather.precipitation, weather.sunshine, weather.pressure_msl
         FROM weather
         WHERE weather.source_id = ANY($1) AND weather.timestamp BETWEEN $2 AND $3
         ORDER BY weather.timestamp, array_position($1, weather.source_id)",
    )
    .bind(&source_ids)
    .bind(date)
    .bind(last_date)
    .fetch_all(pool)
    .await?;

    let mut fallback_source_ids: HashMap<DateTime<Utc>, HashMap<String, i64>> = HashMap::new();

    let has_gaps = primary_rows.iter().any(|row| has_missing_field(&row.fields));

    let mut rows = primary_rows;

    if fallback && has_gaps {
        let missing = missing_field_names(&rows);
        let not_null_clause = missing
            .iter()
            .map(|name| format!("weather.{name} IS NOT NULL"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT weather.source_id, weather.timestamp, weather.temperature, weather.wind_direction,
                    weather.wind_speed, weather.precipitation, weather.sunshine, weather.pressure_msl
             FROM weather
             WHERE weather.source_id = ANY($1) AND weather.timestamp BETWEEN $2 AND $3
               AND {not_null_clause}"
        );
        let fallback_rows = sqlx::query_as::<_, WeatherRow>(&sql)
            .bind(&source_ids)
            .bind(date)
            .bind(last_date)
            .fetch_all(pool)
            .await?;

        let fallback_by_timestamp: HashMap<DateTime<Utc>, &WeatherRow> =
            fallback_rows.iter().map(|row| (row.timestamp, row)).collect();

        for row in &mut rows {
            let Some(&candidate) = fallback_by_timestamp.get(&row.timestamp) else {
                continue;
            };
            if candidate.source_id == row.source_id {
                continue;
            }

            let mut contributed = HashMap::new();
            fill_field(&mut row.fields.temperature, candidate.fields.temperature, "temperature", candidate.source_id, &mut contributed);
            fill_field(&mut row.fields.wind_direction, candidate.fields.wind_direction, "wind_direction", candidate.source_id, &mut contributed);
            fill_field(&mut row.fields.wind_speed, candidate.fields.wind_speed, "wind_speed", candidate.source_id, &mut contributed);
            fill_field(&mut row.fields.precipitation, candidate.fields.precipitation, "precipitation", candidate.source_id, &mut contributed);
            fill_field(&mut row.fields.sunshine, candidate.fields.sunshine, "sunshine", candidate.source_id, &mut contributed);
            fill_field(&mut row.fields.pressure_msl, candidate.fields.pressure_msl, "pressure_msl", candidate.source_id, &mut contributed);

            if !contributed.is_empty() {
                fallback_source_ids.insert(row.timestamp, contributed);
            }
        }
    }

    let contributing_ids: std::collections::HashSet<i64> = rows
        .iter()
        .map(|row| row.source_id)
        .chain(fallback_source_ids.values().flat_map(|m| m.values().copied()))
        .collect();
    let contributing_sources = matched_sources
        .into_iter()
        .filter(|source| contributing_ids.contains(&source.id))
        .collect();

    Ok(WeatherResult {
        rows,
        sources: contributing_sources,
        fallback_source_ids,
    })
}

const fn has_missing_field(fields: &WeatherFields) -> bool {
    fields.temperature.is_none()
        || fields.wind_direction.is_none()
        || fields.wind_speed.is_none()
        || fields.precipitation.is_none()
        || fields.sunshine.is_none()
        || fields.pressure_msl.is_none()
}

/// The six weather columns, in their SQL column name form, eligible for
/// fallback filling.
const FIELD_NAMES: [&str; 6] =
    ["temperature", "wind_direction", "wind_speed", "precipitation", "sunshine", "pressure_msl"];

fn field_is_none(fields: &WeatherFields, name: &str) -> bool {
    match name {
        "temperature" => fields.temperature.is_none(),
        "wind_direction" => fields.wind_direction.is_none(),
        "wind_speed" => fields.wind_speed.is_none(),
        "precipitation" => fields.precipitation.is_none(),
        "sunshine" => fields.sunshine.is_none(),
        "pressure_msl" => fields.pressure_msl.is_none(),
        _ => false,
    }
}

/// Union of fields missing in at least one row, mirroring the original's
/// `missing_fields` set computed across all incomplete primary rows.
fn missing_field_names(rows: &[WeatherRow]) -> Vec<&'static str> {
    FIELD_NAMES
        .into_iter()
        .filter(|&name| rows.iter().any(|row| field_is_none(&row.fields, name)))
        .collect()
}

fn fill_field(
    target: &mut Option<f64>,
    candidate: Option<f64>,
    name: &str,
    candidate_source_id: i64,
    contributed: &mut HashMap<String, i64>,
) {
    if target.is_none() {
        if let Some(value) = candidate {
            *target = Some(value);
            contributed.insert(name.to_owned(), candidate_source_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detects_missing_fields() {
        let mut fields = WeatherFields::default();
        assert!(has_missing_field(&fields));
        fields.temperature = Some(1.0);
        fields.wind_direction = Some(1.0);
        fields.wind_speed = Some(1.0);
        fields.precipitation = Some(1.0);
        fields.sunshine = Some(1.0);
        fields.pressure_msl = Some(1.0);
        assert!(!has_missing_field(&fields));
    }

    #[test]
    fn fills_missing_field_from_fallback_candidate() {
        let mut target = None;
        let mut contributed = HashMap::new();
        fill_field(&mut target, Some(5.0), "temperature", 42, &mut contributed);
        assert_eq!(target, Some(5.0));
        assert_eq!(contributed.get("temperature"), Some(&42));
    }

    #[test]
    fn does_not_overwrite_present_field() {
        let mut target = Some(1.0);
        let mut contributed = HashMap::new();
        fill_field(&mut target, Some(5.0), "temperature", 42, &mut contributed);
        assert_eq!(target, Some(1.0));
        assert!(contributed.is_empty());
    }

    #[test]
    fn missing_field_names_is_the_union_across_rows() {
        let mut complete = WeatherFields::default();
        complete.temperature = Some(1.0);
        complete.wind_direction = Some(1.0);
        complete.wind_speed = Some(1.0);
        complete.precipitation = Some(1.0);
        complete.sunshine = Some(1.0);
        complete.pressure_msl = Some(1.0);

        let mut missing_pressure = complete.clone();
        missing_pressure.pressure_msl = None;

        let mut missing_wind = complete.clone();
        missing_wind.wind_speed = None;

        let rows = vec![
            WeatherRow { source_id: 1, timestamp: Utc::now(), fields: missing_pressure },
            WeatherRow { source_id: 2, timestamp: Utc::now(), fields: missing_wind },
        ];

        let missing = missing_field_names(&rows);
        assert_eq!(missing, vec!["wind_speed", "pressure_msl"]);
    }
}
