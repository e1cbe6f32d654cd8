//! Crawl configuration.
//!
//! Keys mirror the deployed crawler's configuration file (camelCase,
//! grouped under `worker` and `crawloptions`); every field has a default
//! so a missing file or a partial file both work.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Upper bound in milliseconds of the uniform random pre-dial backoff.
    pub max_back_off_time: u64,
    /// Per-harvest-attempt deadline, in seconds.
    pub connect_timeout: u64,
    /// Concurrent harvests a single worker may run (its token count).
    pub queue_size: usize,
    /// DHT protocol ids offered during stream negotiation, in preference
    /// order.
    pub protocol_strings: Vec<String>,
    /// Agent string announced by the local hosts.
    pub user_agent: String,
    /// Number of worker instances to run.
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_back_off_time: 500,
            connect_timeout: 45,
            queue_size: 16,
            protocol_strings: vec![
                "/ipfs/kad/1.0.0".to_string(),
                "/ipfs/kad/2.0.0".to_string(),
            ],
            user_agent: "kadscan/0.1".to_string(),
            count: 1,
        }
    }
}

impl WorkerConfig {
    pub fn connect_deadline(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub data_output_enabled: bool,
    pub outpath: PathBuf,
    /// chrono strftime pattern used in snapshot file names.
    pub filename_time_format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            data_output_enabled: true,
            outpath: PathBuf::from("output_data_crawls"),
            filename_time_format: "%d-%m-%y--%H:%M:%S".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlOptions {
    pub data_output: OutputConfig,
    pub canaryfile: PathBuf,
    pub sanity_enabled: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            data_output: OutputConfig::default(),
            canaryfile: PathBuf::from("configs/canary.txt"),
            sanity_enabled: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub worker: WorkerConfig,
    pub crawloptions: CrawlOptions,
}

impl CrawlConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load from `path` if given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                debug!("no config file given, using defaults");
                Ok(Self::default())
            }
        }
    }
}
