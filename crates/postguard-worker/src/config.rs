//! Worker configuration
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! file, `POSTGUARD__<SECTION>__<KEY>` environment variables, then command
//! line overrides.

use crate::processor::ProcessorSettings;
use ::config::{Config, Environment, File, FileFormat};
use postguard_classifiers::ModelSpec;
use postguard_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "POSTGUARD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub reload: ReloadConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Redis Streams with a consumer group
    #[default]
    Redis,
    /// In-process broker fed from stdin
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Consumer name within the group. A stable name (pod name, hostname)
    /// lets a restarted worker replay its own pending entries right away;
    /// a random name is generated when unset, and the entries are then
    /// claimed after `claim_idle_secs`.
    #[serde(default)]
    pub consumer: Option<String>,

    #[serde(default = "default_input_queue")]
    pub input_queue: String,

    #[serde(default = "default_output_queue")]
    pub output_queue: String,

    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Entries pending this long in any consumer are claimed and redelivered
    #[serde(default = "default_claim_idle_secs")]
    pub claim_idle_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            redis_url: default_redis_url(),
            group: default_group(),
            consumer: None,
            input_queue: default_input_queue(),
            output_queue: default_output_queue(),
            block_timeout_ms: default_block_timeout_ms(),
            batch_size: default_batch_size(),
            claim_idle_secs: default_claim_idle_secs(),
        }
    }
}

impl QueueConfig {
    pub fn consumer_name(&self) -> String {
        self.consumer
            .clone()
            .unwrap_or_else(|| format!("postguard-{}", uuid::Uuid::new_v4()))
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_secs(self.claim_idle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Artifact reference loaded at startup and on reload
    #[serde(default = "default_artifact")]
    pub artifact: String,

    /// Messages scoring strictly above this are republished
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Size of the inference pool; defaults to the number of CPUs
    #[serde(default)]
    pub compute_workers: Option<usize>,

    #[serde(default)]
    pub model: ModelSpec,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            artifact: default_artifact(),
            threshold: default_threshold(),
            compute_workers: None,
            model: ModelSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Deliveries processed at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Deliveries of one message before it goes to the dead-letter queue
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight work may run after intake stops
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadConfig {
    /// Re-resolve the artifact reference at this interval and reload when
    /// its version changes; disabled when unset
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl ReloadConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint; disabled when unset
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

/// Command line values that take precedence over every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub artifact: Option<String>,
    pub threshold: Option<f32>,
    pub redis_url: Option<String>,
    pub input_queue: Option<String>,
    pub output_queue: Option<String>,
    pub max_concurrency: Option<usize>,
    pub metrics_listen: Option<String>,
    pub in_memory: bool,
}

impl WorkerConfig {
    /// Load configuration from all sources and validate it
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let defaults = Config::try_from(&WorkerConfig::default())
            .map_err(|e| Error::config(format!("Failed to build defaults: {}", e)))?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("scoring.artifact", overrides.artifact.clone())
            .and_then(|b| b.set_override_option("scoring.threshold", overrides.threshold.map(f64::from)))
            .and_then(|b| b.set_override_option("queue.redis_url", overrides.redis_url.clone()))
            .and_then(|b| b.set_override_option("queue.input_queue", overrides.input_queue.clone()))
            .and_then(|b| b.set_override_option("queue.output_queue", overrides.output_queue.clone()))
            .and_then(|b| {
                b.set_override_option(
                    "consumer.max_concurrency",
                    overrides.max_concurrency.map(|n| n as u64),
                )
            })
            .and_then(|b| b.set_override_option("metrics.listen", overrides.metrics_listen.clone()))
            .map_err(|e| Error::config(format!("Invalid override: {}", e)))?;

        if overrides.in_memory {
            builder = builder
                .set_override("queue.backend", "memory")
                .map_err(|e| Error::config(format!("Invalid override: {}", e)))?;
        }

        let config: WorkerConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Processor settings derived from this configuration
    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            input_queue: self.queue.input_queue.clone(),
            output_queue: self.queue.output_queue.clone(),
            threshold: self.scoring.threshold,
            max_concurrency: self.consumer.max_concurrency,
            max_deliveries: self.consumer.max_deliveries,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let threshold = self.scoring.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::config(format!(
                "scoring.threshold must be within [0, 1], got {}",
                threshold
            )));
        }

        if self.scoring.artifact.trim().is_empty() {
            return Err(Error::config("scoring.artifact must not be empty"));
        }

        if self.scoring.compute_workers == Some(0) {
            return Err(Error::config("scoring.compute_workers must be positive"));
        }

        if self.consumer.max_concurrency == 0 {
            return Err(Error::config("consumer.max_concurrency must be positive"));
        }

        if self.consumer.max_deliveries == 0 {
            return Err(Error::config("consumer.max_deliveries must be positive"));
        }

        if self.queue.input_queue.trim().is_empty() || self.queue.output_queue.trim().is_empty() {
            return Err(Error::config("queue names must not be empty"));
        }

        if self.queue.input_queue == self.queue.output_queue {
            return Err(Error::config(format!(
                "input and output queue are both '{}'",
                self.queue.input_queue
            )));
        }

        if self.queue.batch_size == 0 {
            return Err(Error::config("queue.batch_size must be positive"));
        }

        // A claim pass could take entries still being worked on.
        if self.queue.claim_idle_secs <= self.shutdown.grace_secs {
            return Err(Error::config(format!(
                "queue.claim_idle_secs ({}) must exceed shutdown.grace_secs ({})",
                self.queue.claim_idle_secs, self.shutdown.grace_secs
            )));
        }

        Ok(())
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_group() -> String {
    "postguard".to_string()
}

fn default_input_queue() -> String {
    "post-create".to_string()
}

fn default_output_queue() -> String {
    "post-sentiment".to_string()
}

fn default_block_timeout_ms() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    16
}

fn default_claim_idle_secs() -> u64 {
    120
}

fn default_artifact() -> String {
    "builtin:lexicon".to_string()
}

fn default_threshold() -> f32 {
    0.8
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_deliveries() -> u32 {
    10
}

fn default_grace_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::load(None, &ConfigOverrides::default()).unwrap();
        assert_eq!(config.queue.input_queue, "post-create");
        assert_eq!(config.queue.output_queue, "post-sentiment");
        assert_eq!(config.scoring.threshold, 0.8);
        assert_eq!(config.scoring.model.max_length, 256);
        assert_eq!(config.scoring.artifact, "builtin:lexicon");
        assert_eq!(config.queue.backend, QueueBackend::Redis);
        assert_eq!(config.processor_settings().max_deliveries, 10);
        assert!(config.metrics.listen.is_none());
        assert!(config.reload.poll_interval().is_none());
    }

    #[test]
    fn test_yaml_file_and_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "scoring:\n  threshold: 0.6\n  model:\n    architecture: roberta\n    flag_index: 2\nconsumer:\n  max_concurrency: 3\nreload:\n  poll_interval_secs: 30\n"
        )
        .unwrap();

        let overrides = ConfigOverrides {
            output_queue: Some("flagged".to_string()),
            in_memory: true,
            ..Default::default()
        };
        let config = WorkerConfig::load(Some(file.path()), &overrides).unwrap();

        assert_eq!(config.scoring.threshold, 0.6);
        assert_eq!(config.scoring.model.flag_index, Some(2));
        assert_eq!(config.consumer.max_concurrency, 3);
        assert_eq!(config.reload.poll_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.queue.output_queue, "flagged");
        assert_eq!(config.queue.input_queue, "post-create");
        assert_eq!(config.queue.backend, QueueBackend::Memory);
    }

    #[test]
    fn test_cli_threshold_wins_over_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "scoring:\n  threshold: 0.6\n").unwrap();

        let overrides = ConfigOverrides {
            threshold: Some(0.9),
            ..Default::default()
        };
        let config = WorkerConfig::load(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.scoring.threshold, 0.9);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = WorkerConfig::load(Some(Path::new("/no/such/worker.yaml")), &ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = WorkerConfig::default();
        assert!(config.validate().is_ok());

        config.scoring.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.consumer.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.queue.input_queue = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.queue.output_queue = config.queue.input_queue.clone();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.scoring.threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.consumer.max_deliveries = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.queue.claim_idle_secs = config.shutdown.grace_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_claim_idle_default_outlasts_grace() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue.claim_idle(), Duration::from_secs(120));
        assert!(config.queue.claim_idle() > config.shutdown.grace());
    }

    #[test]
    fn test_consumer_name() {
        let mut queue = QueueConfig::default();
        assert!(queue.consumer_name().starts_with("postguard-"));

        queue.consumer = Some("worker-0".to_string());
        assert_eq!(queue.consumer_name(), "worker-0");
    }
}
