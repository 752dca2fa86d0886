//! Kafka bus adapter
//!
//! Wraps an rdkafka [`BaseConsumer`]. librdkafka calls block, so polls run
//! on the blocking pool.

use crate::app::BusFactory;
use crate::bus::{BusConsumer, BusRecord};
use crate::error::BusError;
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on records returned by one poll
const MAX_POLL_RECORDS: usize = 2000;

/// Header names carrying the record type tag
const TYPE_HEADERS: [&str; 2] = ["T", "type"];

/// Logs partition assignment changes of the consumer group
struct RebalanceLogger;

impl ClientContext for RebalanceLogger {}

impl ConsumerContext for RebalanceLogger {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => info!(partitions = %describe(tpl), "Partitions being assigned"),
            Rebalance::Revoke(tpl) => info!(partitions = %describe(tpl), "Partitions being revoked"),
            Rebalance::Error(e) => warn!(error = %e, "Rebalance failed"),
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => info!(partitions = %describe(tpl), "Partitions assigned"),
            Rebalance::Revoke(tpl) => info!(partitions = %describe(tpl), "Partitions revoked"),
            Rebalance::Error(e) => warn!(error = %e, "Rebalance failed"),
        }
    }
}

/// `topic[partition]` list for log lines
fn describe(tpl: &TopicPartitionList) -> String {
    tpl.elements()
        .iter()
        .map(|e| format!("{}[{}]", e.topic(), e.partition()))
        .collect::<Vec<_>>()
        .join(",")
}

type GroupConsumer = BaseConsumer<RebalanceLogger>;

pub struct KafkaBus {
    consumer: Arc<GroupConsumer>,
    /// Records fetched by a heartbeat, returned by the next poll
    stash: Vec<BusRecord>,
}

// Needed because rdkafka's BaseConsumer doesn't impl Debug
impl std::fmt::Debug for KafkaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBus")
            .field("stash", &self.stash.len())
            .finish_non_exhaustive()
    }
}

impl KafkaBus {
    pub fn new(properties: &BTreeMap<String, String>) -> Result<Self, BusError> {
        let mut cfg = ClientConfig::new();
        for (key, value) in properties {
            cfg.set(key, value);
        }
        let consumer: GroupConsumer = cfg
            .create_with_context(RebalanceLogger)
            .map_err(|e| BusError::client(e.to_string()))?;
        Ok(Self {
            consumer: Arc::new(consumer),
            stash: Vec::new(),
        })
    }

    async fn fetch(&self, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || fetch_blocking(&consumer, timeout))
            .await
            .map_err(|e| BusError::client(e.to_string()))?
    }
}

fn fetch_blocking(consumer: &GroupConsumer, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
    let mut records = Vec::new();
    let mut wait = timeout;

    while records.len() < MAX_POLL_RECORDS {
        match consumer.poll(wait) {
            None => break,
            Some(Ok(msg)) => records.push(to_record(&msg)),
            Some(Err(KafkaError::PartitionEOF(_))) => {}
            Some(Err(e)) => {
                if e.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) {
                    return Err(BusError::client(e.to_string()));
                }
                warn!(error = %e, "Kafka poll error");
                break;
            }
        }
        wait = Duration::ZERO;
    }
    Ok(records)
}

fn to_record(msg: &BorrowedMessage<'_>) -> BusRecord {
    let text = |bytes: Option<&[u8]>| {
        bytes
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    };

    let content_type = msg.headers().and_then(|headers| {
        headers
            .iter()
            .find(|h| TYPE_HEADERS.contains(&h.key))
            .and_then(|h| h.value)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    });

    BusRecord {
        topic: msg.topic().to_string(),
        key: text(msg.key()),
        value: text(msg.payload()),
        content_type,
    }
}

#[async_trait]
impl BusConsumer for KafkaBus {
    async fn subscribe(&mut self, pattern: &Regex) -> Result<(), BusError> {
        // librdkafka treats a leading ^ as a regex subscription
        let topic = format!("^({})", pattern.as_str());
        self.consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        if !self.stash.is_empty() {
            return Ok(std::mem::take(&mut self.stash));
        }
        self.fetch(timeout).await
    }

    async fn pause(&mut self) -> Result<(), BusError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| BusError::client(e.to_string()))?;
        self.consumer
            .pause(&assignment)
            .map_err(|e| BusError::client(e.to_string()))
    }

    async fn resume(&mut self) -> Result<(), BusError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| BusError::client(e.to_string()))?;
        self.consumer
            .resume(&assignment)
            .map_err(|e| BusError::client(e.to_string()))
    }

    async fn heartbeat(&mut self) -> Result<(), BusError> {
        let records = self.fetch(Duration::ZERO).await?;
        self.stash.extend(records);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BusError> {
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(error = %e, "Commit skipped");
        }
        Ok(())
    }

    async fn close(&mut self) {
        info!("Closing Kafka consumer");
        self.consumer.unsubscribe();
    }
}

/// Builds one [`KafkaBus`] per instance from the merged client properties
#[derive(Debug, Clone)]
pub struct KafkaBusFactory {
    properties: BTreeMap<String, String>,
}

impl KafkaBusFactory {
    pub fn new(properties: BTreeMap<String, String>) -> Self {
        Self { properties }
    }
}

impl BusFactory for KafkaBusFactory {
    fn create(&self, instance: usize) -> Result<Box<dyn BusConsumer>, BusError> {
        let mut properties = self.properties.clone();
        if let Some(client_id) = properties.get_mut("client.id") {
            client_id.push_str(&format!("-{instance}"));
        }
        Ok(Box::new(KafkaBus::new(&properties)?))
    }
}
