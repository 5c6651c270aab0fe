//! TOML session configuration.
//!
//! ```toml
//! poll_interval_ms = 2000
//! grace_period_ms = 3000
//! output_dir = "output"
//!
//! [worker]
//! program = "python3"
//! args = ["main.py"]
//! working_dir = "/srv/scraper"
//!
//! [worker.env]
//! PYTHONUNBUFFERED = "1"
//!
//! [[channels]]
//! key = "comments"
//! file = "{target}_comments.json"
//!
//! [limits]
//! max_pending_bytes = 8388608
//! ```
//!
//! Omitted fields fall back to the builder defaults; omitting `[[channels]]` keeps the
//! default catalog.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tail_events::ScanLimits;
use thiserror::Error;

use crate::{
    catalog::ChannelSpec,
    defaults::{DEFAULT_EVENT_BUFFER, DEFAULT_GRACE_PERIOD, DEFAULT_OUTPUT_DIR, DEFAULT_POLL_INTERVAL},
    ScrapeSession, SessionError,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to decode session config: {source}")]
    Decode {
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    pub event_buffer: usize,
    pub output_dir: PathBuf,
    pub worker: WorkerConfig,
    pub channels: Vec<ChannelConfig>,
    pub limits: LimitsConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            grace_period_ms: millis(DEFAULT_GRACE_PERIOD),
            event_buffer: DEFAULT_EVENT_BUFFER,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            worker: WorkerConfig::default(),
            channels: Vec::new(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub key: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_pending_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: ScanLimits::default().max_pending_bytes,
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&input).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|source| ConfigError::Decode { source })
    }
}

impl ScrapeSession {
    pub fn from_config(config: SessionConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::builder()
            .output_dir(config.output_dir)
            .poll_interval(Duration::from_millis(config.poll_interval_ms))
            .grace_period(Duration::from_millis(config.grace_period_ms))
            .event_buffer(config.event_buffer)
            .scan_limits(ScanLimits {
                max_pending_bytes: config.limits.max_pending_bytes,
            });

        let worker = config.worker;
        if let Some(program) = worker.program {
            builder = builder.program(program);
        }
        if let Some(args) = worker.args {
            builder = builder.args(args);
        }
        if let Some(dir) = worker.working_dir {
            builder = builder.working_dir(dir);
        }
        for (key, value) in worker.env {
            builder = builder.env(key, value);
        }

        if !config.channels.is_empty() {
            let channels = config
                .channels
                .into_iter()
                .map(|channel| ChannelSpec::new(&channel.key, channel.file))
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.channels(channels);
        }

        Ok(builder.build()?)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
