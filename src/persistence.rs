//! Upsert of parsed records into `sources`/`weather`, and retention cleanup.

use crate::error::PipelineError;
use crate::model::{Location, ObservationType, ParsedRecord};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;

const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Resolves a parsed record's source to a surrogate id, inserting a new
/// source row when the identity hasn't been seen before. Current-observation
/// records carry no coordinates of their own and are resolved against an
/// already-known forecast source by station code (`MissingStationError` if
/// none exists).
async fn resolve_source_id(conn: &mut PgConnection, record: &ParsedRecord) -> Result<i64, PipelineError> {
    match &record.source.location {
        Location::Known {
            latitude,
            longitude,
            height,
        } => {
            let row = sqlx::query(
                "INSERT INTO sources (observation_type, station_code, wmo_station_id, station_name, latitude, longitude, height)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (observation_type, station_code, latitude, longitude, height)
                 DO UPDATE SET
                     station_name = COALESCE(excluded.station_name, sources.station_name),
                     wmo_station_id = COALESCE(excluded.wmo_station_id, sources.wmo_station_id)
                 RETURNING id",
            )
            .bind(record.source.observation_type.to_string())
            .bind(&record.source.station_code)
            .bind(&record.source.wmo_station_id)
            .bind(&record.source.station_name)
            .bind(latitude)
            .bind(longitude)
            .bind(height)
            .fetch_one(&mut *conn)
            .await?;

            Ok(row.try_get("id")?)
        }
        Location::LookupByForecastStation => {
            let row = sqlx::query("SELECT id FROM sources WHERE observation_type = $1 AND station_code = $2")
                .bind(ObservationType::Forecast.to_string())
                .bind(&record.source.station_code)
                .fetch_optional(&mut *conn)
                .await?;

            match row {
                Some(row) => Ok(row.try_get("id")?),
                None => Err(PipelineError::MissingStation {
                    station_code: record.source.station_code.clone(),
                }),
            }
        }
    }
}

async fn upsert_weather_row(conn: &mut PgConnection, source_id: i64, record: &ParsedRecord) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO weather (source_id, timestamp, temperature, wind_direction, wind_speed, precipitation, sunshine, pressure_msl)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (source_id, timestamp) DO UPDATE SET
             temperature = COALESCE(excluded.temperature, weather.temperature),
             wind_direction = COALESCE(excluded.wind_direction, weather.wind_direction),
             wind_speed = COALESCE(excluded.wind_speed, weather.wind_speed),
             precipitation = COALESCE(excluded.precipitation, weather.precipitation),
             sunshine = COALESCE(excluded.sunshine, weather.sunshine),
             pressure_msl = COALESCE(excluded.pressure_msl, weather.pressure_msl)",
    )
    .bind(source_id)
    .bind(record.timestamp)
    .bind(record.fields.temperature)
    .bind(record.fields.wind_direction)
    .bind(record.fields.wind_speed)
    .bind(record.fields.precipitation)
    .bind(record.fields.sunshine)
    .bind(record.fields.pressure_msl)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Persists every record of a single file inside one transaction, then
/// writes the parsed-file ledger entry atomically with it. On any failure
/// the transaction rolls back and the ledger is left untouched, so the next
/// poll retries the file from scratch.
pub async fn persist_file(
    pool: &PgPool,
    url: &str,
    last_modified: DateTime<Utc>,
    file_size: i64,
    records: &[ParsedRecord],
) -> Result<(), PipelineError> {
    let mut tx = pool.begin().await?;

    for record in records {
        let source_id = resolve_source_id(&mut tx, record).await?;
        upsert_weather_row(&mut tx, source_id, record).await?;
    }

    sqlx::query(
        "INSERT INTO parsed_files (url, last_modified, file_size, parsed_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (url) DO UPDATE SET
             last_modified = excluded.last_modified,
             file_size = excluded.file_size,
             parsed_at = excluded.parsed_at",
    )
    .bind(url)
    .bind(last_modified)
    .bind(file_size)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(())
}

/// Writes only the ledger entry for a file that failed to parse. A malformed
/// file is not retried until its fingerprint changes, so the ledger is
/// written even though no records were produced — unlike a fetch failure or
/// a `MissingStationError`, which leave the ledger untouched to allow retry.
pub async fn write_ledger_entry(
    pool: &PgPool,
    url: &str,
    last_modified: DateTime<Utc>,
    file_size: i64,
) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO parsed_files (url, last_modified, file_size, parsed_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (url) DO UPDATE SET
             last_modified = excluded.last_modified,
             file_size = excluded.file_size,
             parsed_at = excluded.parsed_at",
    )
    .bind(url)
    .bind(last_modified)
    .bind(file_size)
    .execute(pool)
    .await?;

    Ok(())
}

/// Deletes weather rows older than the retention horizon, keeping forecast
/// rows (which represent future predictions, not history) untouched.
pub async fn clean(pool: &PgPool, retention_days: Option<i64>) -> Result<u64, PipelineError> {
    let horizon = Utc::now() - Duration::days(retention_days.unwrap_or(DEFAULT_RETENTION_DAYS));

    let result = sqlx::query(
        "DELETE FROM weather
         USING sources
         WHERE weather.source_id = sources.id
           AND sources.observation_type != $1
           AND weather.timestamp < $2",
    )
    .bind(ObservationType::Forecast.to_string())
    .bind(horizon)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
