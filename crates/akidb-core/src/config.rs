//! Configuration management for the AkiDB data coordinator
//!
//! Sources, highest priority first:
//! 1. Environment variables (`AKIDB_DATACOORD__SEGMENT__SIZE_BYTES=...`)
//! 2. Config file named by the `AKIDB_DATACOORD_CONFIG` env var
//! 3. ./config/datacoord.{yaml,toml}
//! 4. Hardcoded defaults

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure for the data coordinator
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DataCoordConfig {
    #[serde(default)]
    pub segment: SegmentConfig,

    #[serde(default)]
    pub channels: ChannelConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub meta: MetaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DataCoordConfig {
    /// Load configuration from defaults, files and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        if let Ok(config_path) = std::env::var("AKIDB_DATACOORD_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/datacoord").required(false))
            .add_source(
                Environment::with_prefix("AKIDB_DATACOORD")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: DataCoordConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, on top of defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: DataCoordConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let segment = SegmentConfig::default();
        let channels = ChannelConfig::default();
        let cluster = ClusterConfig::default();
        let meta = MetaConfig::default();
        let logging = LoggingConfig::default();
        builder
            // Segment
            .set_default("segment.size_bytes", segment.size_bytes)?
            .set_default("segment.seal_proportion", segment.seal_proportion)?
            .set_default("segment.grant_lifetime_ms", segment.grant_lifetime_ms)?
            .set_default("segment.max_open_attempts", segment.max_open_attempts)?
            // Channels
            .set_default("channels.per_collection", channels.per_collection)?
            .set_default("channels.insert_prefix", channels.insert_prefix)?
            .set_default("channels.time_tick", channels.time_tick)?
            .set_default("channels.statistics", channels.statistics)?
            .set_default("channels.flush_completed", channels.flush_completed)?
            .set_default("channels.buffer", channels.buffer as u64)?
            // Cluster
            .set_default("cluster.coordinator_id", cluster.coordinator_id)?
            .set_default("cluster.expected_nodes", cluster.expected_nodes as u64)?
            .set_default(
                "cluster.formation_timeout_secs",
                cluster.formation_timeout_secs,
            )?
            .set_default("cluster.silence_timeout_secs", cluster.silence_timeout_secs)?
            .set_default("cluster.reap_interval_secs", cluster.reap_interval_secs)?
            // Meta
            .set_default("meta.root_path", meta.root_path)?
            .set_default("meta.sqlite_url", meta.sqlite_url)?
            .set_default("meta.id_block_size", meta.id_block_size)?
            // Logging
            .set_default("logging.level", logging.level)?
            .set_default("logging.format", logging.format)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment.size_bytes == 0 {
            return Err(ConfigError::Message(
                "segment.size_bytes must be > 0".to_string(),
            ));
        }

        if !(self.segment.seal_proportion > 0.0 && self.segment.seal_proportion <= 1.0) {
            return Err(ConfigError::Message(
                "segment.seal_proportion must be in (0, 1]".to_string(),
            ));
        }

        if self.segment.max_open_attempts == 0 {
            return Err(ConfigError::Message(
                "segment.max_open_attempts must be > 0".to_string(),
            ));
        }

        if self.channels.per_collection == 0 {
            return Err(ConfigError::Message(
                "channels.per_collection must be > 0".to_string(),
            ));
        }

        if self.channels.buffer == 0 {
            return Err(ConfigError::Message(
                "channels.buffer must be > 0".to_string(),
            ));
        }

        if self.cluster.expected_nodes == 0 {
            return Err(ConfigError::Message(
                "cluster.expected_nodes must be > 0".to_string(),
            ));
        }

        if self.cluster.silence_timeout_secs == 0 || self.cluster.reap_interval_secs == 0 {
            return Err(ConfigError::Message(
                "cluster.silence_timeout_secs and cluster.reap_interval_secs must be > 0"
                    .to_string(),
            ));
        }

        if self.meta.id_block_size == 0 {
            return Err(ConfigError::Message(
                "meta.id_block_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Segment sizing and grant policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentConfig {
    /// Target segment size in bytes; capacity is this over the row size
    pub size_bytes: u64,

    /// Fraction of capacity (rows or bytes) at which a segment stops growing
    pub seal_proportion: f64,

    /// How long a grant stays valid, in milliseconds of hybrid time
    pub grant_lifetime_ms: u64,

    /// Segments a single assignment request may open before it fails
    pub max_open_attempts: u32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            size_bytes: 512 * 1024 * 1024,
            seal_proportion: 0.75,
            grant_lifetime_ms: 2000,
            max_open_attempts: 3,
        }
    }
}

/// Channel naming and buffering
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Insert channels created per collection
    pub per_collection: u32,

    /// Prefix of generated insert channel names
    pub insert_prefix: String,

    /// Channel nodes publish time-ticks on
    pub time_tick: String,

    /// Channel nodes publish segment statistics on
    pub statistics: String,

    /// Channel nodes publish flush completions on
    pub flush_completed: String,

    /// Capacity of each inbound message queue
    pub buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            per_collection: 2,
            insert_prefix: "insert-channel-".to_string(),
            time_tick: "datacoord-timetick".to_string(),
            statistics: "datacoord-segment-statistics".to_string(),
            flush_completed: "datacoord-flush-completed".to_string(),
            buffer: 1024,
        }
    }
}

/// Worker-node cluster settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Id this coordinator reports to registering nodes
    pub coordinator_id: i64,

    /// Nodes that must register before the coordinator serves
    pub expected_nodes: usize,

    /// Upper bound on the startup wait for node registration
    pub formation_timeout_secs: u64,

    /// A node silent for this long is deregistered
    pub silence_timeout_secs: u64,

    /// How often silent nodes are looked for
    pub reap_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            coordinator_id: 0,
            expected_nodes: 1,
            formation_timeout_secs: 60,
            silence_timeout_secs: 30,
            reap_interval_secs: 5,
        }
    }
}

impl ClusterConfig {
    pub fn formation_timeout(&self) -> Duration {
        Duration::from_secs(self.formation_timeout_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Metadata store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaConfig {
    /// Key prefix under which every record lives
    pub root_path: String,

    /// SQLite database backing the key-value store
    pub sqlite_url: String,

    /// Ids reserved per round-trip to the store
    pub id_block_size: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            root_path: "datacoord/meta".to_string(),
            sqlite_url: "sqlite://datacoord.db?mode=rwc".to_string(),
            id_block_size: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,

    /// json or pretty
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
