use crate::config::{read, DEFAULT_CONFIG};
use crate::error::exit_if_handle_fatal;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cache;
mod config;
mod db;
mod error;
mod logging;
mod model;
mod parsers;
mod persistence;
mod poller;
mod query;
mod server;
mod units;
mod worker;

#[cfg(debug_assertions)]
#[derive(Copy, Clone, Debug, Default)]
struct DebugLevel;

#[cfg(debug_assertions)]
impl clap_verbosity_flag::LogLevel for DebugLevel {
    fn default() -> Option<log::Level> {
        Some(log::Level::Debug)
    }
}

#[cfg(debug_assertions)]
type DefaultLogLevel = DebugLevel;

#[cfg(not(debug_assertions))]
type DefaultLogLevel = clap_verbosity_flag::WarnLevel;

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Parse a single file and emit its records as JSON
    Parse {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        export: bool,
    },
    /// List (or enqueue) files that changed since the last poll
    Poll {
        #[arg(long)]
        enqueue: bool,
    },
    /// Delete weather rows past the retention horizon
    Clean,
    /// Run the in-process worker loop
    Work,
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0:5678")]
        bind: String,
        #[arg(long)]
        reload: bool,
    },
    /// Query weather for a date, optionally at a location
    Query {
        date: String,
        lat: Option<f64>,
        lon: Option<f64>,
        last_date: Option<String>,
        #[arg(long)]
        dwd_station_id: Option<String>,
        #[arg(long)]
        wmo_station_id: Option<String>,
        #[arg(long)]
        source_id: Option<i64>,
        #[arg(long)]
        max_dist: Option<f64>,
    },
    /// List sources, optionally near a location
    Sources {
        lat: Option<f64>,
        lon: Option<f64>,
        #[arg(long)]
        dwd_station_id: Option<String>,
        #[arg(long)]
        wmo_station_id: Option<String>,
        #[arg(long)]
        source_id: Option<i64>,
        #[arg(long)]
        max_dist: Option<f64>,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity<DefaultLogLevel>,

    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Apply database migrations before running the subcommand
    #[arg(long)]
    migrate: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = args.verbose.log_level().unwrap_or(log::Level::Info);
    logging::init(log_level)?;

    let config = read(args.config).unwrap_or_else(exit_if_handle_fatal);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, args.migrate, args.command))
}

fn build_selector(
    lat: Option<f64>,
    lon: Option<f64>,
    dwd_station_id: Option<String>,
    wmo_station_id: Option<String>,
    source_id: Option<i64>,
    max_dist: Option<f64>,
) -> anyhow::Result<query::SourceSelector> {
    if let Some(source_id) = source_id {
        return Ok(query::SourceSelector::SourceId(source_id));
    }
    if let Some(code) = dwd_station_id {
        return Ok(query::SourceSelector::DwdStationId(code));
    }
    if let Some(code) = wmo_station_id {
        return Ok(query::SourceSelector::WmoStationId(code));
    }
    if let (Some(latitude), Some(longitude)) = (lat, lon) {
        return Ok(query::SourceSelector::Coordinates {
            latitude,
            longitude,
            max_dist_meters: max_dist.unwrap_or(50_000.0),
        });
    }
    anyhow::bail!("one of --source-id, --dwd-station-id, --wmo-station-id or LAT LON is required")
}

fn parse_date_arg(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

async fn run(config: config::Config, eager_migrate: bool, command: Command) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;

    if eager_migrate {
        db::migrate(&pool).await?;
    }

    match command {
        Command::Migrate => {
            db::migrate(&pool).await?;
        }
        Command::Parse { path, url, export } => {
            let (local_path, source_url) = match (path, url) {
                (Some(path), _) => {
                    let url = path.to_string_lossy().into_owned();
                    (path, url)
                }
                (None, Some(url)) => {
                    let downloader = cache::Downloader::new(config.cache_dir.clone());
                    let path = downloader.fetch(&url)?;
                    (path, url)
                }
                (None, None) => anyhow::bail!("either --path or --url is required"),
            };

            let ignored_values = match &config.ignored_values_path {
                Some(path) => std::sync::Arc::new(parsers::IgnoredValues::load(path)?),
                None => std::sync::Arc::new(parsers::IgnoredValues::empty()),
            };

            let filename = local_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default();
            let Some(parser) = parsers::dispatch(filename) else {
                anyhow::bail!("no parser registered for {filename}");
            };

            let ctx = parsers::ParseContext {
                url: source_url.clone(),
                min_date: config.min_date,
                max_date: config.max_date,
                ignored_values,
            };

            let records = parser.parse(&local_path, &ctx)?;

            if export {
                let metadata = std::fs::metadata(&local_path)?;
                persistence::persist_file(
                    &pool,
                    &source_url,
                    chrono::Utc::now(),
                    i64::try_from(metadata.len())?,
                    &records,
                )
                .await?;
            } else {
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
        }
        Command::Poll { enqueue } => {
            let jobs = poller::poll(&pool).await?;
            if enqueue {
                let downloader = cache::Downloader::new(config.cache_dir.clone());
                let ignored_values = std::sync::Arc::new(match &config.ignored_values_path {
                    Some(path) => parsers::IgnoredValues::load(path)?,
                    None => parsers::IgnoredValues::empty(),
                });
                let count = jobs.len();
                for job in jobs {
                    worker::run_job(
                        &pool,
                        &downloader,
                        &ignored_values,
                        config.keep_downloads,
                        config.min_date,
                        config.max_date,
                        job,
                    )
                    .await;
                }
                println!("enqueued {count} jobs");
            } else {
                for job in &jobs {
                    println!("{}", job.url);
                }
            }
        }
        Command::Clean => {
            let deleted = persistence::clean(&pool, None).await?;
            println!("deleted {deleted} rows");
        }
        Command::Work => {
            worker::run(pool, config).await?;
        }
        Command::Serve { bind, reload } => {
            let _ = reload;
            let rocket = server::configure_rocket(pool, &bind);
            rocket.launch().await?;
        }
        Command::Query {
            date,
            lat,
            lon,
            last_date,
            dwd_station_id,
            wmo_station_id,
            source_id,
            max_dist,
        } => {
            let date = parse_date_arg(&date)?;
            let last_date = last_date.map(|d| parse_date_arg(&d)).transpose()?;
            let selector = build_selector(lat, lon, dwd_station_id, wmo_station_id, source_id, max_dist)?;
            let result = query::weather(&pool, date, last_date, &selector, true).await?;
            println!("{}", serde_json::to_string_pretty(&result.rows)?);
        }
        Command::Sources {
            lat,
            lon,
            dwd_station_id,
            wmo_station_id,
            source_id,
            max_dist,
        } => {
            let selector = build_selector(lat, lon, dwd_station_id, wmo_station_id, source_id, max_dist)?;
            let sources = query::sources(&pool, &selector).await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
    }

    Ok(())
}
