//! Thin JSON HTTP front end over [`crate::query`]. No auth, no rate
//! limiting, no OpenAPI schema — those are out of scope here.

use crate::error::PipelineError;
use crate::query::{self, SourceSelector, WeatherResult};
use rocket::serde::json::Json;
use rocket::{get, routes, Build, Rocket, State};
use serde::Serialize;
use sqlx::postgres::PgPool;

pub struct AppState {
    pub pool: PgPool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiError {
    Message { error: String },
}

fn build_selector(
    lat: Option<f64>,
    lon: Option<f64>,
    dwd_station_id: Option<String>,
    wmo_station_id: Option<String>,
    source_id: Option<i64>,
    max_dist: Option<f64>,
) -> Result<SourceSelector, PipelineError> {
    if let Some(source_id) = source_id {
        return Ok(SourceSelector::SourceId(source_id));
    }
    if let Some(code) = dwd_station_id {
        return Ok(SourceSelector::DwdStationId(code));
    }
    if let Some(code) = wmo_station_id {
        return Ok(SourceSelector::WmoStationId(code));
    }
    if let (Some(latitude), Some(longitude)) = (lat, lon) {
        return Ok(SourceSelector::Coordinates {
            latitude,
            longitude,
            max_dist_meters: max_dist.unwrap_or(50_000.0),
        });
    }
    Err(PipelineError::Validation(
        "one of source_id, dwd_station_id, wmo_station_id or lat+lon is required".to_owned(),
    ))
}

#[get("/weather?<date>&<last_date>&<lat>&<lon>&<dwd_station_id>&<wmo_station_id>&<source_id>&<max_dist>")]
async fn get_weather(
    state: &State<AppState>,
    date: &str,
    last_date: Option<&str>,
    lat: Option<f64>,
    lon: Option<f64>,
    dwd_station_id: Option<String>,
    wmo_station_id: Option<String>,
    source_id: Option<i64>,
    max_dist: Option<f64>,
) -> Result<Json<WeatherResponse>, (rocket::http::Status, Json<ApiError>)> {
    let respond_err = |status: rocket::http::Status, message: String| {
        (status, Json(ApiError::Message { error: message }))
    };

    let date = chrono::DateTime::parse_from_rfc3339(date)
        .map(|d| d.with_timezone(&chrono::Utc))
        .map_err(|err| respond_err(rocket::http::Status::BadRequest, err.to_string()))?;
    let last_date = last_date
        .map(chrono::DateTime::parse_from_rfc3339)
        .transpose()
        .map_err(|err| respond_err(rocket::http::Status::BadRequest, err.to_string()))?
        .map(|d| d.with_timezone(&chrono::Utc));

    let selector = build_selector(lat, lon, dwd_station_id, wmo_station_id, source_id, max_dist)
        .map_err(|err| respond_err(rocket::http::Status::BadRequest, err.to_string()))?;

    match query::weather(&state.pool, date, last_date, &selector, true).await {
        Ok(result) => Ok(Json(WeatherResponse::from(result))),
        Err(PipelineError::Lookup) => Err(respond_err(rocket::http::Status::NotFound, "no data found".to_owned())),
        Err(err) => Err(respond_err(rocket::http::Status::InternalServerError, err.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct WeatherResponse {
    weather: Vec<crate::model::WeatherRow>,
    sources: Vec<crate::model::Source>,
}

impl From<WeatherResult> for WeatherResponse {
    fn from(result: WeatherResult) -> Self {
        Self {
            weather: result.rows,
            sources: result.sources,
        }
    }
}

#[get("/sources?<lat>&<lon>&<dwd_station_id>&<wmo_station_id>&<source_id>&<max_dist>")]
async fn get_sources(
    state: &State<AppState>,
    lat: Option<f64>,
    lon: Option<f64>,
    dwd_station_id: Option<String>,
    wmo_station_id: Option<String>,
    source_id: Option<i64>,
    max_dist: Option<f64>,
) -> Result<Json<Vec<crate::model::Source>>, (rocket::http::Status, Json<ApiError>)> {
    let respond_err = |status: rocket::http::Status, message: String| {
        (status, Json(ApiError::Message { error: message }))
    };

    let selector = build_selector(lat, lon, dwd_station_id, wmo_station_id, source_id, max_dist)
        .map_err(|err| respond_err(rocket::http::Status::BadRequest, err.to_string()))?;

    match query::sources(&state.pool, &selector).await {
        Ok(sources) => Ok(Json(sources)),
        Err(PipelineError::Lookup) => Err(respond_err(rocket::http::Status::NotFound, "no sources found".to_owned())),
        Err(err) => Err(respond_err(rocket::http::Status::InternalServerError, err.to_string())),
    }
}

#[must_use]
pub fn configure_rocket(pool: PgPool, bind: &str) -> Rocket<Build> {
    let (address, port) = bind.rsplit_once(':').map_or(("0.0.0.0", 5678), |(addr, port)| {
        (addr, port.parse().unwrap_or(5678))
    });

    let figment = rocket::Config::figment()
        .merge(("address", address))
        .merge(("port", port));

    rocket::custom(figment)
        .manage(AppState { pool })
        .mount("/", routes![get_weather, get_sources])
}
