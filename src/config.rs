use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::bench::sweep::DEFAULT_MAX_TRANSFER_BYTES;
use crate::common::FatalKind;
use crate::gpu::queue::{QueueCapability, QueueRequest};
use crate::report::OutputFormat;

pub const BENCH_CONFIG_FILENAME: &str = "bench_config.ron";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Ordinal of the physical device in enumeration order.
    pub device_index: usize,
    /// Enable the Khronos validation layer.
    pub validation: bool,
    /// Queues to provision, in order. Each entry lists the capabilities one
    /// queue must have.
    pub queues: Vec<Vec<QueueCapability>>,
    /// Which of `queues` the sweep runs on.
    pub benchmark_queue: usize,
    pub max_transfer_size: u64,
    pub clamp_to_device_limit: bool,
    pub output: OutputFormat,
    pub log_file: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            device_index: 0,
            validation: false,
            queues: vec![
                vec![QueueCapability::Graphics, QueueCapability::Transfer],
                vec![QueueCapability::Transfer],
            ],
            benchmark_queue: 1,
            max_transfer_size: DEFAULT_MAX_TRANSFER_BYTES,
            clamp_to_device_limit: false,
            output: OutputFormat::Text,
            log_file: None,
        }
    }
}

impl BenchConfig {
    pub fn queue_requests(&self) -> Vec<QueueRequest> {
        self.queues.iter().map(|caps| QueueRequest::from_capabilities(caps)).collect()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse config file: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

impl ConfigError {
    pub fn kind(&self) -> FatalKind {
        FatalKind::Configuration
    }
}

/// Reads and parses `path`. Fields the file leaves out take their defaults.
pub fn load_config(path: &Path) -> Result<BenchConfig, ConfigError> {
    let mut contents = String::new();
    std::fs::File::open(path)?.read_to_string(&mut contents)?;
    Ok(ron::from_str(&contents)?)
}

/// Like [`load_config`], but never fails: a missing file silently yields
/// defaults, any other problem is logged and also yields defaults.
pub fn load_or_default(path: &Path) -> BenchConfig {
    or_default(path, load_config(path))
}

/// The fallback half of [`load_or_default`], for callers that had to load
/// before logging was up.
pub fn or_default(path: &Path, loaded: Result<BenchConfig, ConfigError>) -> BenchConfig {
    match loaded {
        Ok(config) => config,
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config at {}, using defaults.", path.display());
            BenchConfig::default()
        }
        Err(e) => {
            warn!("Couldn't load {}, using defaults. Error was: {}", path.display(), e);
            BenchConfig::default()
        }
    }
}
