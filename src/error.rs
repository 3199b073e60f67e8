use log::error;
use std::fmt::Display;
use std::process::exit;

/// Taxonomy of errors the pipeline can produce, matched on by callers that need
/// to decide whether to retry, skip, or write the parsed-file ledger.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("fetch failed for {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("circuit open for host {host}")]
    CircuitOpen { host: String },

    #[error("failed to parse {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no forecast station found for current-observations station {station_code}")]
    MissingStation { station_code: String },

    #[error("query returned no rows")]
    Lookup,

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub fn exit_if_handle_fatal<E, R>(error: E) -> R
where
    E: Display,
{
    error!("Fatal error: {error}");

    exit(2)
}
