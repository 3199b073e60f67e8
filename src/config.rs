use const_format::concatcp;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_CONFIG: &str = concatcp!("/etc/", NAME, "/", NAME, ".toml");

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache").join(NAME)
}

fn default_bind() -> String {
    "0.0.0.0:5678".to_owned()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub database_url: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub min_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub max_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub keep_downloads: bool,
    #[serde(default)]
    pub ignored_values_path: Option<PathBuf>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/wetterkern".to_owned(),
            redis_url: None,
            min_date: None,
            max_date: None,
            keep_downloads: false,
            ignored_values_path: None,
            cache_dir: default_cache_dir(),
            bind: default_bind(),
        }
    }
}

pub fn read(config_file: PathBuf) -> anyhow::Result<Config> {
    info!("Reading config file {config_file:?}");

    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("WETTERKERN_").split("__"))
        .extract()?;

    debug!("Read config is {config:?}");

    Ok(config)
}
