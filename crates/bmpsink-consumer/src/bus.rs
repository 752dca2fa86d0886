//! Message bus seam
//!
//! The ingestion loop only needs a handful of operations from the bus
//! client: pattern subscription, bounded polling, pausing all assigned
//! partitions while a batch is being processed, and a zero-wait poll that
//! keeps group membership alive without fetching.

use crate::error::BusError;
use async_trait::async_trait;
use bmpsink_writer::KeepAlive;
use regex::Regex;
use std::time::Duration;
use tracing::warn;

/// One record as received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub topic: String,
    /// Partition key, usually the hash of the entity the record describes
    pub key: String,
    pub value: String,
    /// Explicit record type tag, when the producer set one
    pub content_type: Option<String>,
}

impl BusRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[async_trait]
pub trait BusConsumer: Send {
    /// Replace the current subscription with `pattern`
    async fn subscribe(&mut self, pattern: &Regex) -> Result<(), BusError>;

    /// Wait up to `timeout` for records
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<BusRecord>, BusError>;

    /// Stop fetching from every assigned partition
    async fn pause(&mut self) -> Result<(), BusError>;

    async fn resume(&mut self) -> Result<(), BusError>;

    /// Zero-wait poll while paused, keeps the consumer in its group
    async fn heartbeat(&mut self) -> Result<(), BusError>;

    /// Commit consumed offsets synchronously
    async fn commit(&mut self) -> Result<(), BusError>;

    async fn close(&mut self);
}

/// Adapts a bus to the writer pool's keep-alive hook
pub struct BusKeepAlive<'a>(pub &'a mut dyn BusConsumer);

#[async_trait]
impl KeepAlive for BusKeepAlive<'_> {
    async fn keep_alive(&mut self) {
        if let Err(e) = self.0.heartbeat().await {
            warn!(error = %e, "Bus heartbeat failed");
        }
    }
}
