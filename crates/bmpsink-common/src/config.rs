//! Configuration file structure
//!
//! The file is TOML with four sections: `[base]` for pipeline sizing,
//! `[postgres]` for the store, `[kafka]` for the bus and `[[tables]]` for the
//! statement generator mappings. Every field has a default so an empty file is
//! a valid (if not very useful) configuration.

use crate::error::{ConfigError, Result};
use crate::types::RecordKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Complete consumer configuration, constructed once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub base: BaseConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let base = &self.base;
        if base.consumer_threads == 0 {
            return Err(ConfigError::invalid("base.consumer_threads must be at least 1"));
        }
        if base.writer_max_threads_per_type == 0 {
            return Err(ConfigError::invalid(
                "base.writer_max_threads_per_type must be at least 1",
            ));
        }
        if base.writer_queue_size == 0 || base.consumer_queue_size == 0 {
            return Err(ConfigError::invalid("queue sizes must be at least 1"));
        }

        let pg = &self.postgres;
        if pg.retries == 0 {
            return Err(ConfigError::invalid("postgres.retries must be at least 1"));
        }
        if pg.batch_records == 0 {
            return Err(ConfigError::invalid("postgres.batch_records must be at least 1"));
        }
        if pg.host.is_empty() {
            return Err(ConfigError::invalid("postgres.host is required"));
        }

        if self.kafka.subscribe_topic_patterns.is_empty() {
            return Err(ConfigError::invalid(
                "kafka.subscribe_topic_patterns must list at least one pattern",
            ));
        }
        self.kafka.compiled_patterns()?;

        let mut kinds = HashSet::new();
        for table in &self.tables {
            if !kinds.insert(table.kind) {
                return Err(ConfigError::invalid(format!(
                    "duplicate table mapping for {}",
                    table.kind
                )));
            }
            table.validate()?;
        }

        Ok(())
    }
}

/// Pipeline sizing and writer pool policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Seconds between stats log lines, 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    /// Number of independent ingestion instances
    #[serde(default = "default_consumer_threads")]
    pub consumer_threads: usize,
    #[serde(default = "default_writer_max_threads_per_type")]
    pub writer_max_threads_per_type: usize,
    /// Consecutive over-watermark checks tolerated before acting
    #[serde(default = "default_writer_allowed_over_queue_times")]
    pub writer_allowed_over_queue_times: u32,
    /// Cool-down between pool size changes
    #[serde(default = "default_writer_seconds_thread_scale_back")]
    pub writer_seconds_thread_scale_back: u64,
    /// Cool-down between rebalance passes
    #[serde(default = "default_writer_rebalance_seconds")]
    pub writer_rebalance_seconds: u64,
    #[serde(default = "default_writer_check_interval_secs")]
    pub writer_check_interval_secs: u64,
    /// Capacity of each writer worker's queue
    #[serde(default = "default_writer_queue_size")]
    pub writer_queue_size: usize,
    /// Capacity of the hand-off queue
    #[serde(default = "default_consumer_queue_size")]
    pub consumer_queue_size: usize,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            stats_interval: default_stats_interval(),
            consumer_threads: default_consumer_threads(),
            writer_max_threads_per_type: default_writer_max_threads_per_type(),
            writer_allowed_over_queue_times: default_writer_allowed_over_queue_times(),
            writer_seconds_thread_scale_back: default_writer_seconds_thread_scale_back(),
            writer_rebalance_seconds: default_writer_rebalance_seconds(),
            writer_check_interval_secs: default_writer_check_interval_secs(),
            writer_queue_size: default_writer_queue_size(),
            consumer_queue_size: default_consumer_queue_size(),
        }
    }
}

impl BaseConfig {
    pub fn scale_back_cooldown(&self) -> Duration {
        Duration::from_secs(self.writer_seconds_thread_scale_back)
    }

    pub fn rebalance_cooldown(&self) -> Duration {
        Duration::from_secs(self.writer_rebalance_seconds)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.writer_check_interval_secs)
    }
}

fn default_stats_interval() -> u64 {
    300
}

fn default_consumer_threads() -> usize {
    1
}

fn default_writer_max_threads_per_type() -> usize {
    3
}

fn default_writer_allowed_over_queue_times() -> u32 {
    2
}

fn default_writer_seconds_thread_scale_back() -> u64 {
    1200
}

fn default_writer_rebalance_seconds() -> u64 {
    1800
}

fn default_writer_check_interval_secs() -> u64 {
    10
}

fn default_writer_queue_size() -> usize {
    20000
}

fn default_consumer_queue_size() -> usize {
    80000
}

/// Postgres connection and batching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// `host[:port]`
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_openbmp")]
    pub db_name: String,
    #[serde(default = "default_openbmp")]
    pub username: String,
    #[serde(default = "default_openbmp")]
    pub password: String,
    #[serde(default = "default_true")]
    pub ssl_enable: bool,
    /// Only honoured when `ssl_enable` is set
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    /// Distinct records buffered before a writer flushes
    #[serde(default = "default_batch_records")]
    pub batch_records: usize,
    /// Maximum time a record waits in a writer buffer
    #[serde(default = "default_batch_time_millis")]
    pub batch_time_millis: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            db_name: default_openbmp(),
            username: default_openbmp(),
            password: default_openbmp(),
            ssl_enable: default_true(),
            ssl_mode: default_ssl_mode(),
            batch_records: default_batch_records(),
            batch_time_millis: default_batch_time_millis(),
            retries: default_retries(),
        }
    }
}

impl PostgresConfig {
    pub fn batch_time(&self) -> Duration {
        Duration::from_millis(self.batch_time_millis)
    }

    /// Split `host[:port]`, defaulting the port to 5432
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        match self.host.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConfigError::invalid(format!("postgres.host has invalid port: {}", self.host))
                })?;
                Ok((host.to_string(), port))
            }
            None => Ok((self.host.clone(), 5432)),
        }
    }
}

fn default_pg_host() -> String {
    "localhost:5432".to_string()
}

fn default_openbmp() -> String {
    "openbmp".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ssl_mode() -> String {
    "require".to_string()
}

fn default_batch_records() -> usize {
    200
}

fn default_batch_time_millis() -> u64 {
    75
}

fn default_retries() -> u32 {
    10
}

/// Bus subscription and client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Delay between staged subscriptions
    #[serde(default = "default_topic_subscribe_delay_millis")]
    pub topic_subscribe_delay_millis: u64,
    /// Topic regexes, subscribed one at a time in this order
    #[serde(default = "default_subscribe_topic_patterns")]
    pub subscribe_topic_patterns: Vec<String>,
    /// Client properties, layered over [`KafkaConfig::default_client_properties`]
    #[serde(default)]
    pub consumer_config: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            topic_subscribe_delay_millis: default_topic_subscribe_delay_millis(),
            subscribe_topic_patterns: default_subscribe_topic_patterns(),
            consumer_config: BTreeMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.topic_subscribe_delay_millis)
    }

    pub fn compiled_patterns(&self) -> Result<Vec<Regex>> {
        self.subscribe_topic_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ConfigError::invalid(format!("invalid topic pattern '{p}': {e}"))
                })
            })
            .collect()
    }

    pub fn default_client_properties() -> BTreeMap<String, String> {
        [
            ("bootstrap.servers", "localhost:9092"),
            ("group.id", "openbmp-psql-consumer"),
            ("client.id", "openbmp-psql-consumer"),
            ("enable.auto.commit", "true"),
            ("auto.commit.interval.ms", "1000"),
            ("session.timeout.ms", "16000"),
            ("max.poll.interval.ms", "120000"),
            ("heartbeat.interval.ms", "5000"),
            ("max.partition.fetch.bytes", "2000000"),
            ("fetch.wait.max.ms", "50"),
            ("auto.offset.reset", "earliest"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// Effective client properties: defaults overridden by the file
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = Self::default_client_properties();
        props.extend(
            self.consumer_config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        props
    }
}

fn default_topic_subscribe_delay_millis() -> u64 {
    10000
}

fn default_subscribe_topic_patterns() -> Vec<String> {
    [
        r"openbmp\.parsed\.collector",
        r"openbmp\.parsed\.router",
        r"openbmp\.parsed\.peer",
        r"openbmp\.parsed\.(base_attribute|unicast_prefix|l3vpn|bmp_stat|ls_node|ls_link|ls_prefix)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Mapping from a record kind to its target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub kind: RecordKind,
    pub table: String,
    /// Full statement text up to the values list, overrides the derived one
    #[serde(default)]
    pub prefix: Option<String>,
    /// Conflict clause appended after the values list
    #[serde(default)]
    pub suffix: String,
    /// Ordered columns, each `name` or `name::cast`
    pub columns: Vec<String>,
    /// Columns forming the record identity
    #[serde(default)]
    pub identity: Vec<String>,
}

/// One column of a table mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub cast: Option<String>,
}

impl TableConfig {
    pub fn column_specs(&self) -> Vec<ColumnSpec> {
        self.columns
            .iter()
            .map(|c| match c.split_once("::") {
                Some((name, cast)) => ColumnSpec {
                    name: name.trim().to_string(),
                    cast: Some(cast.trim().to_string()),
                },
                None => ColumnSpec {
                    name: c.trim().to_string(),
                    cast: None,
                },
            })
            .collect()
    }

    /// Statement text up to and including `VALUES`
    pub fn statement_prefix(&self) -> String {
        if let Some(prefix) = &self.prefix {
            return prefix.clone();
        }
        let names: Vec<String> = self.column_specs().into_iter().map(|c| c.name).collect();
        format!("INSERT INTO {} ({}) VALUES ", self.table, names.join(","))
    }

    fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(ConfigError::invalid(format!(
                "table mapping for {} has no table name",
                self.kind
            )));
        }
        if self.columns.is_empty() {
            return Err(ConfigError::invalid(format!(
                "table mapping for {} has no columns",
                self.kind
            )));
        }
        let names: HashSet<String> = self.column_specs().into_iter().map(|c| c.name).collect();
        if let Some(missing) = self.identity.iter().find(|id| !names.contains(*id)) {
            return Err(ConfigError::invalid(format!(
                "identity column '{missing}' is not a column of {}",
                self.table
            )));
        }
        Ok(())
    }
}
