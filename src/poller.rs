//! Directory-listing walk and fingerprint diff against the parsed-file
//! ledger, emitting jobs for files whose `(last_modified, file_size)` has
//! changed since the last successful parse.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use sqlx::postgres::PgPool;
use std::collections::HashMap;

const SEED_URLS: &[&str] = &[
    "https://opendata.dwd.de/weather/local_forecasts/mos/MOSMIX_S/all_stations/kml/",
    "https://opendata.dwd.de/weather/weather_reports/poi/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/air_temperature/recent/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/air_temperature/historical/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/precipitation/recent/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/precipitation/historical/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/wind/recent/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/wind/historical/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/solar/recent/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/solar/historical/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/pressure/recent/",
    "https://opendata.dwd.de/climate_environment/CDC/observations_germany/climate/10_minutes/pressure/historical/",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PollJob {
    pub url: String,
    pub last_modified: DateTime<Utc>,
    pub file_size: i64,
}

static LINK_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)<a href="([^"]+)">"#).unwrap());
/// Apache autoindex listing rows give the timestamp as `DD-Mon-YYYY HH:MM`
/// (alphabetic month), not a numeric-month ISO form.
static LISTING_ROW_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}-[A-Za-z]{3}-\d{4}\s+\d{2}:\d{2})\s+(\d+)").unwrap());

async fn load_ledger(pool: &PgPool) -> anyhow::Result<HashMap<String, (DateTime<Utc>, i64)>> {
    let rows: Vec<(String, DateTime<Utc>, i64)> =
        sqlx::query_as("SELECT url, last_modified, file_size FROM parsed_files")
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(url, lm, size)| (url, (lm, size))).collect())
}

fn list_directory(client: &Client, url: &str) -> anyhow::Result<Vec<(String, Option<(DateTime<Utc>, i64)>)>> {
    let body = client.get(url).send()?.text()?;

    let mut entries = Vec::new();
    for line in body.lines() {
        let Some(href_caps) = LINK_PATTERN.captures(line) else {
            continue;
        };
        let href = &href_caps[1];
        if href.starts_with('.') || href.starts_with('?') {
            continue;
        }

        let fingerprint = LISTING_ROW_PATTERN.captures(line).and_then(|caps| {
            let naive = NaiveDateTime::parse_from_str(&caps[1], "%d-%b-%Y %H:%M").ok()?;
            let size: i64 = caps[2].parse().ok()?;
            Some((Utc.from_utc_datetime(&naive), size))
        });

        entries.push((href.to_owned(), fingerprint));
    }

    Ok(entries)
}

fn resolve(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_owned()
    } else {
        format!("{}/{href}", base.trim_end_matches('/'))
    }
}

/// Walks every seed directory depth-first, returning jobs for files whose
/// fingerprint differs from the ledger (or is wholly new). Does not write
/// the ledger itself; persistence does that once a file is fully ingested.
pub async fn poll(pool: &PgPool) -> anyhow::Result<Vec<PollJob>> {
    let ledger = load_ledger(pool).await?;
    let client = Client::new();

    let mut jobs = Vec::new();
    let mut stack: Vec<String> = SEED_URLS.iter().map(|s| (*s).to_owned()).collect();

    while let Some(directory_url) = stack.pop() {
        let entries = match list_directory(&client, &directory_url) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to list {directory_url}: {err}");
                continue;
            }
        };

        for (href, fingerprint) in entries {
            let is_directory = href.ends_with('/');
            let full_url = resolve(&directory_url, &href);

            if is_directory {
                stack.push(full_url);
                continue;
            }

            let filename = full_url.rsplit('/').next().unwrap_or(&full_url);
            if crate::parsers::dispatch(filename).is_none() {
                continue;
            }

            let Some((last_modified, file_size)) = fingerprint else {
                debug!("no fingerprint parsed for {full_url}, skipping");
                continue;
            };

            let unchanged = ledger
                .get(&full_url)
                .is_some_and(|(lm, size)| *lm == last_modified && *size == file_size);

            if unchanged {
                continue;
            }

            jobs.push(PollJob {
                url: full_url,
                last_modified,
                file_size,
            });
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolves_relative_href() {
        assert_eq!(
            resolve("https://opendata.dwd.de/weather/poi/", "10minutenwerte_tu_00044_akt.csv"),
            "https://opendata.dwd.de/weather/poi/10minutenwerte_tu_00044_akt.csv"
        );
    }

    #[test]
    fn extracts_links_from_listing_line() {
        let line = r#"<a href="10minutenwerte_tu_00044_akt.csv">10minutenwerte_tu_00044_akt.csv</a>             01-Aug-2024 10:02    4096"#;
        let caps = LINK_PATTERN.captures(line).unwrap();
        assert_eq!(&caps[1], "10minutenwerte_tu_00044_akt.csv");
        let row = LISTING_ROW_PATTERN.captures(line).unwrap();
        assert_eq!(&row[1], "01-Aug-2024 10:02");
        assert_eq!(&row[2], "4096");
    }

    #[test]
    fn parses_alphabetic_month_listing_timestamp() {
        let naive = NaiveDateTime::parse_from_str("01-Aug-2024 10:02", "%d-%b-%Y %H:%M").unwrap();
        assert_eq!(Utc.from_utc_datetime(&naive).to_string(), "2024-08-01 10:02:00 UTC");
    }
}
