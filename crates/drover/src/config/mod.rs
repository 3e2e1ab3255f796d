//! Configuration for the drover ingester.

mod feed_key;

use chrono::Duration as ChronoDuration;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::info;
use url::Url;

pub use drover_core::config::{
    ConfigPath, GlobalConfig, Mergeable, MetricsConfig, interpolate, load_from_paths,
};
pub use feed_key::FeedKey;

use drover_core::error::ConfigError;
use drover_core::{AppConfig, ComponentKey, PipelineContext, PipelineSetupError};

use crate::ingest::FeedPipeline;
use crate::schema::SchemaEvolutionMode;
use crate::sink::RetryPolicy;

pub const OTX_BASE_URL: &str = "https://otx.alienvault.com";
pub const FEODO_URL: &str = "https://feodotracker.abuse.ch/downloads/ipblocklist.json";

fn default_otx_base_url() -> String {
    OTX_BASE_URL.to_string()
}

fn default_feodo_url() -> String {
    FEODO_URL.to_string()
}

fn default_page_limit() -> u32 {
    50
}

/// Upper bound on `initial_lookback_days` (about a century).
const MAX_INITIAL_LOOKBACK_DAYS: u32 = 36_500;

fn default_initial_lookback_days() -> u32 {
    30
}

fn default_poll_interval() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    60
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    12
}

/// An API credential. Never printed by `Debug`.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Which upstream a feed pulls from, with its source-specific options.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// AlienVault OTX pulses from subscribed authors, paginated.
    OtxSubscribed {
        api_key: ApiKey,
        #[serde(default = "default_otx_base_url")]
        base_url: String,
        #[serde(default = "default_page_limit")]
        page_limit: u32,
    },
    /// abuse.ch Feodo Tracker botnet C2 blocklist, one snapshot per fetch.
    AbusechFeodo {
        #[serde(default = "default_feodo_url")]
        url: String,
    },
}

impl SourceConfig {
    /// Table a feed of this type lands in unless overridden.
    pub fn default_table(&self) -> &'static str {
        match self {
            SourceConfig::OtxSubscribed { .. } => "otx_pulses",
            SourceConfig::AbusechFeodo { .. } => "abusech_feodo",
        }
    }

    fn endpoint(&self) -> &str {
        match self {
            SourceConfig::OtxSubscribed { base_url, .. } => base_url,
            SourceConfig::AbusechFeodo { url } => url,
        }
    }
}

/// Configuration for one feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Destination table; defaults to the source type's table.
    #[serde(default)]
    pub table: Option<String>,
    /// Watermark used before the feed has ever been checkpointed.
    #[serde(default = "default_initial_lookback_days")]
    pub initial_lookback_days: u32,
    /// Interval between runs in watch mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Timeout for each HTTP request to the feed.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Consecutive failed runs tolerated in watch mode (0 = never stop).
    #[serde(default)]
    pub max_failures: usize,
}

impl FeedConfig {
    pub fn table_name(&self) -> &str {
        self.table
            .as_deref()
            .unwrap_or_else(|| self.source.default_table())
    }

    pub fn initial_lookback(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.initial_lookback_days))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where checkpoints live.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Object store URL; `memory://` keeps checkpoints in process.
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Backoff settings for inserts into tables that are not yet visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        RetryPolicy::new(
            Duration::from_millis(config.initial_delay_ms),
            config.max_attempts,
        )
    }
}

/// Where tables live.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// Object store URL of the warehouse root.
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How existing table schemas react to new fields.
    #[serde(default)]
    pub schema_evolution: SchemaEvolutionMode,
}

/// Main configuration for drover.
///
/// # Example
///
/// ```yaml
/// feeds:
///   otx-subscribed:
///     type: otx_subscribed
///     api_key: ${DROVER_OTX_API_KEY}
///   abuse.ch-feodo:
///     type: abusech_feodo
///     poll_interval_secs: 900
///
/// checkpoint:
///   url: gs://bucket/drover/checkpoints
///
/// sink:
///   url: gs://bucket/drover/warehouse
///   retry:
///     initial_delay_ms: 100
///     max_attempts: 12
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feeds: IndexMap<FeedKey, FeedConfig>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub sink: Option<SinkConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Mergeable for Config {
    type Key = FeedKey;
    type Component = FeedConfig;

    fn components(&self) -> &IndexMap<FeedKey, FeedConfig> {
        &self.feeds
    }

    fn components_mut(&mut self) -> &mut IndexMap<FeedKey, FeedConfig> {
        &mut self.feeds
    }

    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn global_mut(&mut self) -> &mut GlobalConfig {
        &mut self.global
    }

    fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })
    }

    fn merge_sections(&mut self, other: &mut Self) -> Result<(), ConfigError> {
        merge_section(&mut self.checkpoint, other.checkpoint.take(), "checkpoint")?;
        merge_section(&mut self.sink, other.sink.take(), "sink")
    }
}

fn merge_section<T>(slot: &mut Option<T>, incoming: Option<T>, section: &str) -> Result<(), ConfigError> {
    match (slot.is_some(), incoming) {
        (true, Some(_)) => Err(ConfigError::DuplicateSection {
            section: section.to_string(),
        }),
        (false, Some(value)) => {
            *slot = Some(value);
            Ok(())
        }
        (_, None) => Ok(()),
    }
}

impl Config {
    /// Load configuration from multiple paths (files or directories).
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let result = interpolate(contents);
        if !result.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: result.errors.join("\n"),
            });
        }

        let config = Self::parse_yaml(&result.text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Checks:
    /// - At least one feed, each with a path-safe key and usable endpoint
    /// - No two feeds write the same table
    /// - `checkpoint` and `sink` are present and point at usable storage
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feeds.is_empty() {
            return Err(ConfigError::NoComponents {
                component: "feed".to_string(),
            });
        }

        let mut tables = HashSet::new();
        for (key, feed) in &self.feeds {
            let invalid = |message: String| ConfigError::InvalidComponent {
                component: "feed".to_string(),
                key: key.to_string(),
                message,
            };

            key.validate().map_err(invalid)?;
            ComponentKey::new(feed.table_name())
                .validate()
                .map_err(|e| invalid(format!("invalid table name: {e}")))?;
            Url::parse(feed.source.endpoint())
                .map_err(|e| invalid(format!("invalid URL '{}': {e}", feed.source.endpoint())))?;

            if let SourceConfig::OtxSubscribed { page_limit: 0, .. } = feed.source {
                return Err(invalid("page_limit must be greater than zero".to_string()));
            }
            if feed.poll_interval_secs == 0 {
                return Err(invalid("poll_interval_secs must be greater than zero".to_string()));
            }
            if feed.request_timeout_secs == 0 {
                return Err(invalid("request_timeout_secs must be greater than zero".to_string()));
            }
            if feed.initial_lookback_days > MAX_INITIAL_LOOKBACK_DAYS {
                return Err(invalid(format!(
                    "initial_lookback_days must be at most {MAX_INITIAL_LOOKBACK_DAYS}"
                )));
            }
            if !tables.insert(feed.table_name()) {
                return Err(invalid(format!(
                    "table '{}' is already written by another feed",
                    feed.table_name()
                )));
            }
        }

        let checkpoint = self.checkpoint.as_ref().ok_or(ConfigError::MissingSection {
            section: "checkpoint".to_string(),
        })?;
        let url = parse_section_url("checkpoint", &checkpoint.url)?;
        if url.scheme() == "file" {
            return Err(ConfigError::InvalidSection {
                section: "checkpoint".to_string(),
                message: "file:// storage does not support conditional writes".to_string(),
            });
        }

        let sink = self.sink.as_ref().ok_or(ConfigError::MissingSection {
            section: "sink".to_string(),
        })?;
        parse_section_url("sink", &sink.url)?;
        if sink.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidSection {
                section: "sink".to_string(),
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Iterate over all feeds with their keys.
    pub fn feeds(&self) -> impl Iterator<Item = (&FeedKey, &FeedConfig)> {
        self.feeds.iter()
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }
}

fn parse_section_url(section: &str, url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|e| ConfigError::InvalidSection {
        section: section.to_string(),
        message: format!("invalid URL '{url}': {e}"),
    })
}

impl AppConfig for Config {
    type Pipeline = FeedPipeline;

    const COMPONENT_NAME: &'static str = "feed";

    fn validate(&self) -> Result<(), ConfigError> {
        Config::validate(self)
    }

    async fn create_pipelines(
        &self,
        context: PipelineContext,
    ) -> Result<Vec<FeedPipeline>, PipelineSetupError> {
        crate::ingest::build_pipelines(self, context)
    }

    fn log_startup_info(&self) {
        info!("Starting drover with {} feed(s)", self.feed_count());
        for (key, feed) in self.feeds() {
            info!(
                "  Feed: {} ({}) -> {}",
                key,
                feed.source.endpoint(),
                feed.table_name()
            );
        }
    }
}
