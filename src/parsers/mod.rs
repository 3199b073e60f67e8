//! Parser family: filename-dispatched decoders that turn a downloaded file
//! into a stream of normalized [`ParsedRecord`]s.
//!
//! Grounded on the teacher's `providers::deutscher_wetterdienst` CSV/ZIP
//! handling (`strip_duplicate_spaces`, `is_measurement_file`,
//! `minute_precision_date_format`), generalized from a single provider into
//! the dispatch-by-filename-pattern family this pipeline needs.

pub mod current_observations;
pub mod mosmix;
pub mod observations;

use crate::error::PipelineError;
use crate::model::ParsedRecord;
use chrono::{DateTime, Utc};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// `url -> timestamp -> field -> value`, permitting known-bad values to be
/// overridden to null rather than persisted.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct IgnoredValues(HashMap<String, HashMap<DateTime<Utc>, HashMap<String, f64>>>);

impl IgnoredValues {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(HashMap::new())
    }

    /// Nulls `current` if it matches a configured ignored value for
    /// `(url, timestamp, field)`, warning when a configured override is
    /// stale (the live value no longer matches what was recorded as bad).
    #[must_use]
    pub fn apply(&self, url: &str, timestamp: DateTime<Utc>, field: &str, current: Option<f64>) -> Option<f64> {
        let Some(configured) = self
            .0
            .get(url)
            .and_then(|by_time| by_time.get(&timestamp))
            .and_then(|by_field| by_field.get(field))
        else {
            return current;
        };

        match current {
            Some(value) if (value - *configured).abs() < f64::EPSILON => None,
            Some(_) => {
                warn!(
                    "ignored-value entry for {url} at {timestamp} field {field} no longer matches the live value"
                );
                current
            }
            None => current,
        }
    }
}

/// Context threaded through every parser invocation: the global date window
/// and the process-wide ignored-values overrides.
#[derive(Clone)]
pub struct ParseContext {
    pub url: String,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub ignored_values: Arc<IgnoredValues>,
}

pub trait Parser {
    /// Whether this file can be skipped entirely without opening it, based
    /// on a date range embedded in its filename.
    fn should_skip(&self, _ctx: &ParseContext) -> bool {
        false
    }

    fn parse(&self, path: &Path, ctx: &ParseContext) -> Result<Vec<ParsedRecord>, PipelineError>;
}

static MOSMIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)MOSMIX_[SL]_LATEST.*\.kmz$").unwrap());
static CURRENT_OBSERVATIONS_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\w{5}-BEOB\.csv$").unwrap());
static HISTORICAL_RECENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^stundenwerte_(TU|RR|FF|SD|P0)_\d+_(?:\d{8}_\d{8}_hist|akt)\.zip$").unwrap()
});

/// Resolves the parser implementation for a filename, returning `None` for
/// files this pipeline does not know how to ingest (the poller skips them).
#[must_use]
pub fn dispatch(filename: &str) -> Option<Box<dyn Parser + Send>> {
    if MOSMIX_PATTERN.is_match(filename) {
        return Some(Box::new(mosmix::MosmixParser));
    }

    if CURRENT_OBSERVATIONS_PATTERN.is_match(filename) {
        return Some(Box::new(current_observations::CurrentObservationsParser));
    }

    if let Some(variant) = observations::ObservationVariant::from_filename(filename) {
        return Some(Box::new(observations::ObservationsParser::new(variant)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dispatches_mosmix_files() {
        assert!(dispatch("MOSMIX_S_LATEST_240.kmz").is_some());
    }

    #[test]
    fn dispatches_current_observations_files() {
        assert!(dispatch("10715-BEOB.csv").is_some());
    }

    #[test]
    fn dispatches_historical_observation_files() {
        assert!(dispatch("stundenwerte_TU_00044_19500101_19991231_hist.zip").is_some());
        assert!(dispatch("stundenwerte_P0_00044_akt.zip").is_some());
    }

    #[test]
    fn ignores_unknown_files() {
        assert!(dispatch("readme.txt").is_none());
    }
}
