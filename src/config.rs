//! Pipeline configuration.
//!
//! Every field has a default matching the original deployment, so an empty
//! configuration runs. Values are layered: defaults, then an optional TOML
//! file (`reactive-pipeline.toml` unless a path is given), then environment
//! variables such as `PIPELINE__CONSUMER__MAX_BATCH=500`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::PayloadFormat;
use crate::consumer::{ConsumerSettings, RetryPolicy};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "reactive-pipeline.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PIPELINE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub event_stream: EventStreamConfig,
    #[serde(default)]
    pub cache_stream: CacheStreamConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub cache_node: CacheNodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// The stream feeding the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStreamConfig {
    pub stream_id: String,
    /// Name of the Store-Update Consumer.
    pub consumer: String,
    pub table: String,
    pub format: PayloadFormat,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            stream_id: "reactive-system-event-stream".into(),
            consumer: "store-updater".into(),
            table: "ProgramTable".into(),
            format: PayloadFormat::Bitcode,
        }
    }
}

/// The cache-invalidation stream feeding the cache channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStreamConfig {
    pub stream_id: String,
    /// Name of the Cache-Update Consumer.
    pub consumer: String,
    pub channel: String,
    pub format: PayloadFormat,
}

impl Default for CacheStreamConfig {
    fn default() -> Self {
        Self {
            stream_id: "reactive-system-redis-update-stream".into(),
            consumer: "cache-updater".into(),
            channel: crate::cache::DEFAULT_CHANNEL.into(),
            format: PayloadFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum events applied per cycle.
    pub max_batch: usize,
    /// Records fetched per stream call.
    pub page_size: usize,
    pub poll_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_batch: 100,
            page_size: 100,
            poll_timeout_ms: 1_000,
            call_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_backoff(Duration::from_millis(self.initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.multiplier)
    }
}

/// Checkpoints live in memory unless a directory is configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: Option<PathBuf>,
}

/// Dead letters live in memory unless a JSON-lines file is configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheNodeConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheNodeConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::cache::DEFAULT_MAX_ENTRIES,
            ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
        }
    }
}

impl CacheNodeConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            with_target: true,
        }
    }
}

/// Operator API listen address (feature `http`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8088".into(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.into()));

        if self.event_stream.stream_id.is_empty() || self.cache_stream.stream_id.is_empty() {
            return invalid("stream ids must not be empty");
        }
        if self.event_stream.consumer.is_empty() || self.cache_stream.consumer.is_empty() {
            return invalid("consumer names must not be empty");
        }
        if self.event_stream.table.is_empty() {
            return invalid("event_stream.table must not be empty");
        }
        if self.cache_stream.channel.is_empty() {
            return invalid("cache_stream.channel must not be empty");
        }
        if self.consumer.max_batch == 0 || self.consumer.page_size == 0 {
            return invalid("consumer.max_batch and consumer.page_size must be > 0");
        }
        if self.consumer.call_timeout_ms == 0 {
            return invalid("consumer.call_timeout_ms must be > 0");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be > 0");
        }
        if !(self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }
        if self.cache_node.max_entries == 0 {
            return invalid("cache_node.max_entries must be > 0");
        }
        if self.cache_node.ttl_secs == 0 {
            return invalid("cache_node.ttl_secs must be > 0");
        }
        if self.http.addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "http.addr {:?} is not a socket address",
                self.http.addr
            )));
        }
        Ok(())
    }

    fn settings(&self, consumer: &str, stream_id: &str) -> ConsumerSettings {
        ConsumerSettings::new(consumer, stream_id)
            .with_max_batch(self.consumer.max_batch)
            .with_poll_timeout(Duration::from_millis(self.consumer.poll_timeout_ms))
            .with_call_timeout(Duration::from_millis(self.consumer.call_timeout_ms))
            .with_retry(self.retry.policy())
    }

    /// Settings of the Store-Update Consumer.
    pub fn store_settings(&self) -> ConsumerSettings {
        self.settings(&self.event_stream.consumer, &self.event_stream.stream_id)
    }

    /// Settings of the Cache-Update Consumer.
    pub fn cache_settings(&self) -> ConsumerSettings {
        self.settings(&self.cache_stream.consumer, &self.cache_stream.stream_id)
    }
}

/// Load configuration from `path` (or [`DEFAULT_CONFIG_FILE`] when it
/// exists), apply `PIPELINE__*` environment overrides, then validate.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let mut builder = Config::builder();
    match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::Invalid(format!(
                    "config file {} not found",
                    p.display()
                )));
            }
            builder = builder.add_source(File::from(p.to_path_buf()));
        }
        None => {
            // Try default root-level file
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path));
            }
        }
    }
    // Environment variable overrides, e.g., PIPELINE__RETRY__MAX_ATTEMPTS=8
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .separator("__"),
    );

    let merged: PipelineConfig = builder.build()?.try_deserialize()?;
    merged.validate()?;
    Ok(merged)
}
