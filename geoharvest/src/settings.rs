use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use geoharvest_core::parse::{DEFAULT_MIN_POPULATION, DEFAULT_PROGRESS_FRACTION};
use geoharvest_fetch::{
    FetchSettings, DEFAULT_BASE_URL, DEFAULT_HTTP_TIMEOUT, DEFAULT_RETRY_LIMIT,
    DEFAULT_RETRY_WAIT, DEFAULT_STALE_AFTER,
};

const CONFIG_PREFIX: &str = "GEOHARVEST";
const CONFIG_FILE_PATH: &str = "./geoharvest.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    /// Lowers the default log filter to `debug`.
    #[serde(default)]
    pub trace: bool,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_progress_fraction")]
    pub progress_fraction: f64,
    #[serde(default = "default_min_population")]
    pub min_population: u64,
    /// How many countries may ingest at the same time.
    #[serde(default = "default_spawn_batch_size")]
    pub spawn_batch_size: usize,
    /// Allow-list of ISO2 codes; absent means every country in the
    /// master index.
    #[serde(default)]
    pub countries: Option<Vec<String>>,
}

fn default_target_dir() -> PathBuf {
    PathBuf::from("./geonames")
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER.as_secs()
}

fn default_retry_wait_ms() -> u64 {
    DEFAULT_RETRY_WAIT.as_millis() as u64
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT.as_millis() as u64
}

fn default_progress_fraction() -> f64 {
    DEFAULT_PROGRESS_FRACTION
}

fn default_min_population() -> u64 {
    DEFAULT_MIN_POPULATION
}

fn default_spawn_batch_size() -> usize {
    8
}

impl Settings {
    /// Merge the optional default file, an explicit config file and the
    /// `GEOHARVEST_*` environment, in that order.
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(File::with_name(CONFIG_FILE_PATH).required(false));
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        builder
            .add_source(Environment::with_prefix(CONFIG_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            base_url: self.base_url.clone(),
            target_dir: self.target_dir.clone(),
            proxy: match (&self.proxy_host, self.proxy_port) {
                (Some(host), Some(port)) => Some((host.clone(), port)),
                _ => None,
            },
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            stale_after: Duration::from_secs(self.stale_after_secs),
            retry_wait: Duration::from_millis(self.retry_wait_ms),
            retry_limit: self.retry_limit,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            target_dir: default_target_dir(),
            base_url: default_base_url(),
            proxy_host: None,
            proxy_port: None,
            trace: false,
            stale_after_secs: default_stale_after_secs(),
            retry_wait_ms: default_retry_wait_ms(),
            retry_limit: default_retry_limit(),
            http_timeout_ms: default_http_timeout_ms(),
            progress_fraction: default_progress_fraction(),
            min_population: default_min_population(),
            spawn_batch_size: default_spawn_batch_size(),
            countries: None,
        }
    }
}
