//! bmpsink common
//!
//! Configuration and the types shared by the storage, writer and consumer
//! crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BaseConfig, ColumnSpec, Config, KafkaConfig, PostgresConfig, TableConfig};
pub use error::{ConfigError, Result};
pub use types::{Category, RecordKind, TOPIC_PREFIX, WriteRequest};
