//! In-process worker pool consuming the poller's job stream.
//!
//! The distributed worker-queue runtime described alongside this pipeline is
//! an external collaborator; this pool is the pipeline's own stand-in,
//! sized the way the teacher sizes its Rocket worker pool and the way the
//! original Python implementation sizes its `huey` consumer: `2 * cores + 1`.

use crate::cache::Downloader;
use crate::config::Config;
use crate::parsers::{IgnoredValues, ParseContext};
use crate::poller::PollJob;
use log::{error, info, warn};
use sqlx::postgres::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;

#[must_use]
pub fn worker_count() -> usize {
    2 * std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) + 1
}

/// Runs one job: fetch, parse, persist, optionally discard the download.
#[allow(clippy::too_many_arguments, reason = "mirrors the fields ParseContext threads through a job")]
pub async fn run_job(
    pool: &PgPool,
    downloader: &Downloader,
    ignored_values: &Arc<IgnoredValues>,
    keep_downloads: bool,
    min_date: Option<chrono::DateTime<chrono::Utc>>,
    max_date: Option<chrono::DateTime<chrono::Utc>>,
    job: PollJob,
) {
    let ctx = ParseContext {
        url: job.url.clone(),
        min_date,
        max_date,
        ignored_values: Arc::clone(ignored_values),
    };

    let path = match downloader.fetch(&job.url) {
        Ok(path) => path,
        Err(err) => {
            error!("fetch failed for {}: {err}", job.url);
            return;
        }
    };

    let filename = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
    let Some(parser) = crate::parsers::dispatch(filename) else {
        warn!("no parser for {}", job.url);
        return;
    };

    if parser.should_skip(&ctx) {
        info!("skipping {} (outside configured date range)", job.url);
        return;
    }

    let records = match parser.parse(&path, &ctx) {
        Ok(records) => records,
        Err(err) => {
            error!("parse failed for {}: {err}, marking ledger to prevent reattempt", job.url);
            if let Err(err) =
                crate::persistence::write_ledger_entry(pool, &job.url, job.last_modified, job.file_size).await
            {
                error!("failed to write ledger entry for malformed file {}: {err}", job.url);
            }
            return;
        }
    };

    match crate::persistence::persist_file(pool, &job.url, job.last_modified, job.file_size, &records).await {
        Ok(()) => {}
        Err(crate::error::PipelineError::MissingStation { station_code }) => {
            warn!(
                "no forecast station {station_code} for current-observations file {}, ledger left untouched for retry",
                job.url
            );
            return;
        }
        Err(err) => {
            error!("persist failed for {}: {err}", job.url);
            return;
        }
    }

    if !keep_downloads {
        if let Err(err) = downloader.discard(&path) {
            warn!("failed to discard cached download for {}: {err}", job.url);
        }
    }
}

/// Runs the worker loop: repeatedly polls, enqueues into a bounded channel
/// (giving the backpressure the concurrency model calls for), and drains it
/// with `N = 2*cores+1` concurrent jobs.
pub async fn run(pool: PgPool, config: Config) -> anyhow::Result<()> {
    let downloader = Arc::new(Downloader::new(config.cache_dir.clone()));
    let ignored_values = Arc::new(match &config.ignored_values_path {
        Some(path) => IgnoredValues::load(path)?,
        None => IgnoredValues::empty(),
    });

    let (tx, rx) = mpsc::channel::<PollJob>(worker_count() * 4);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let poll_pool = pool.clone();
    let producer = tokio::spawn(async move {
        loop {
            match crate::poller::poll(&poll_pool).await {
                Ok(jobs) => {
                    for job in jobs {
                        if tx.send(job).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => error!("poll failed: {err}"),
            }
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        }
    });

    let mut handles = Vec::new();
    for _ in 0..worker_count() {
        let pool = pool.clone();
        let downloader = Arc::clone(&downloader);
        let ignored_values = Arc::clone(&ignored_values);
        let rx = Arc::clone(&rx);
        let keep_downloads = config.keep_downloads;
        let min_date = config.min_date;
        let max_date = config.max_date;

        handles.push(tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else {
                    return;
                };
                run_job(&pool, &downloader, &ignored_values, keep_downloads, min_date, max_date, job).await;
            }
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            error!("worker task panicked: {err}");
        }
    }
    producer.abort();

    Ok(())
}
