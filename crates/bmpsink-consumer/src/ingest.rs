//! Ingestion loop
//!
//! One instance owns a bus consumer, a hand-off queue, the writer pools and
//! a storage connection of its own for inline writes. Each cycle polls the
//! bus briefly; a non-empty batch is processed with the bus paused, so the
//! consumer keeps its group membership without fetching more data while
//! records are turned into write requests.
//!
//! Collector, router and peer records are written inline on the instance's
//! own connection together with their corrective statements. Everything else
//! becomes a [`WriteRequest`] and goes through the hand-off queue.

use crate::bus::{BusConsumer, BusKeepAlive, BusRecord};
use crate::corrections::{collector_updates, peer_rib_updates};
use crate::error::{BusError, ConsumerError, Result};
use crate::generator::{Record, StatementGenerator};
use crate::router::{REFRESH_QUERY, RouterTracker};
use crate::stats::ConsumerStats;
use crate::subscribe::TopicSubscriber;
use bmpsink_common::{Category, Config, RecordKind, WriteRequest};
use bmpsink_storage::{StorageConnector, StorageHandler};
use bmpsink_writer::{HandoffQueue, KeepAlive, PoolConfig, WriterPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bus poll timeout per cycle
pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Hand-off drain passes between progress lines during shutdown
const SHUTDOWN_LOG_EVERY: u64 = 100;

const SHUTDOWN_DRAIN_STEP: Duration = Duration::from_millis(1);

pub struct IngestLoop {
    id: usize,
    bus: Box<dyn BusConsumer>,
    db: StorageHandler,
    pool: WriterPool,
    handoff: HandoffQueue,
    generator: Arc<dyn StatementGenerator>,
    routers: RouterTracker,
    subscriber: TopicSubscriber,
    stats: Arc<ConsumerStats>,
    shutdown: Arc<AtomicBool>,
    retries: u32,
    check_interval: Duration,
    last_check: Instant,
}

impl std::fmt::Debug for IngestLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestLoop")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("handoff", &self.handoff.len())
            .field("subscribed", &self.subscriber.subscribed_count())
            .finish_non_exhaustive()
    }
}

impl IngestLoop {
    /// Build an instance; writer workers are started right away
    pub fn new(
        id: usize,
        config: &Config,
        bus: Box<dyn BusConsumer>,
        connector: Arc<dyn StorageConnector>,
        generator: Arc<dyn StatementGenerator>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let subscriber = TopicSubscriber::new(
            config.kafka.compiled_patterns()?,
            config.kafka.subscribe_delay(),
        );
        let db = StorageHandler::new(connector.open());
        let pool = WriterPool::new(connector, PoolConfig::from_config(config));

        Ok(Self {
            id,
            bus,
            db,
            pool,
            handoff: HandoffQueue::new(config.base.consumer_queue_size),
            generator,
            routers: RouterTracker::new(),
            subscriber,
            stats: Arc::new(ConsumerStats::new()),
            shutdown,
            retries: config.postgres.retries,
            check_interval: config.base.check_interval(),
            last_check: Instant::now(),
        })
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown is requested or the bus fails.
    ///
    /// The pipeline is drained and closed on both paths; only a bus failure
    /// is returned as an error.
    pub async fn run(mut self) -> Result<()> {
        info!(instance = self.id, "Consumer started");
        if !self.db.connect().await {
            warn!(instance = self.id, "Storage not reachable yet, will retry on first write");
        }
        self.stats.set_running(true);
        self.refresh_routers().await;

        let result = self.poll_loop().await;
        self.stats.set_running(false);
        if let Err(e) = &result {
            error!(instance = self.id, error = %e, "Consumer stopped on bus error");
        }

        self.shutdown_pipeline().await;
        info!(instance = self.id, "Consumer stopped");
        result.map_err(|e| ConsumerError::InstanceFailed {
            instance: self.id,
            reason: e.to_string(),
        })
    }

    async fn poll_loop(&mut self) -> std::result::Result<(), BusError> {
        while !self.shutdown.load(Ordering::SeqCst) {
            self.subscriber.step(self.bus.as_mut()).await?;

            let records = self.bus.poll(POLL_TIMEOUT).await?;
            if records.is_empty() {
                self.handoff.drain_into(&mut self.pool);

                // partial subscription is not idle
                if self.subscriber.all_subscribed() && self.health_check_due() {
                    self.bus.pause().await?;
                    self.check_health().await;
                    self.bus.resume().await?;
                }
            } else {
                self.bus.pause().await?;
                for record in records {
                    self.handle_record(record).await;
                }
                if self.health_check_due() {
                    self.check_health().await;
                }
                self.handoff.drain_into(&mut self.pool);
                self.bus.resume().await?;
            }

            self.stats
                .set_depths(self.handoff.len(), self.pool.queue_depth());
        }
        Ok(())
    }

    fn health_check_due(&self) -> bool {
        self.last_check.elapsed() >= self.check_interval
    }

    async fn check_health(&mut self) {
        let mut keepalive = BusKeepAlive(self.bus.as_mut());
        self.pool.check_health(&mut keepalive).await;
        self.last_check = Instant::now();
    }

    async fn heartbeat(&mut self) {
        BusKeepAlive(self.bus.as_mut()).keep_alive().await;
    }

    async fn handle_record(&mut self, record: BusRecord) {
        self.stats.record_message();

        let Some(kind) = RecordKind::classify(record.content_type.as_deref(), &record.topic)
        else {
            debug!(topic = %record.topic, content_type = ?record.content_type, "Skipping record of unknown type");
            return;
        };

        let rows = match self.generator.decode(kind, &record.value) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(%kind, key = %record.key, error = %e, "Failed to decode record, skipping");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        self.stats.record_kind(kind);

        if kind.is_synchronous() {
            self.apply_inline(kind, &rows).await;
        } else {
            self.enqueue(kind, &record.key, &rows).await;
        }
    }

    /// Insert statement for `rows`, if the kind is stored
    fn statement(&self, kind: RecordKind, rows: &[Record]) -> Option<String> {
        let (prefix, suffix) = self.generator.insert_statement(kind)?;
        let values = self.generator.values_statement(kind, rows);
        if values.is_empty() {
            return None;
        }
        Some(WriteRequest::new("", Category::Default, prefix, suffix, values).to_sql())
    }

    async fn apply_inline(&mut self, kind: RecordKind, rows: &[Record]) {
        let statement = self.statement(kind, rows);

        match kind {
            RecordKind::Collector => {
                if let Some(sql) = statement {
                    self.db.query(&sql, self.retries).await;
                }
                for sql in collector_updates(rows) {
                    self.db.query(&sql, self.retries).await;
                }
                self.heartbeat().await;
            }
            RecordKind::Router => {
                if let Some(sql) = statement {
                    self.db.query(&sql, self.retries).await;
                }
                self.heartbeat().await;
                for sql in self.routers.apply(rows) {
                    debug!(%sql, "Marking peers down for reconnected router");
                    self.db.query(&sql, self.retries).await;
                }
                self.refresh_routers().await;
            }
            RecordKind::Peer => {
                if let Some(sql) = statement {
                    self.db.query(&sql, self.retries).await;
                }
                self.heartbeat().await;
                for sql in peer_rib_updates(rows) {
                    self.db.query(&sql, self.retries).await;
                    self.heartbeat().await;
                }
            }
            _ => {
                if let Some(sql) = statement {
                    self.db.query(&sql, self.retries).await;
                }
            }
        }
    }

    async fn enqueue(&mut self, kind: RecordKind, key: &str, rows: &[Record]) {
        let Some((prefix, suffix)) = self.generator.insert_statement(kind) else {
            debug!(%kind, "No table mapped, skipping record");
            return;
        };
        let values = self.generator.values_statement(kind, rows);
        let routing_key = if key.is_empty() {
            match values.keys().next() {
                Some(identity) => identity.clone(),
                None => return,
            }
        } else {
            key.to_string()
        };

        let req = WriteRequest::new(routing_key, kind.category(), prefix, suffix, values);
        let mut keepalive = BusKeepAlive(self.bus.as_mut());
        self.handoff.push(req, &mut self.pool, &mut keepalive).await;
    }

    async fn refresh_routers(&mut self) {
        let rows = self.db.select(REFRESH_QUERY).await;
        self.routers.refresh(&rows);
    }

    async fn shutdown_pipeline(&mut self) {
        if let Err(e) = self.bus.pause().await {
            debug!(error = %e, "Pause before shutdown failed");
        }

        let mut passes: u64 = 0;
        while !self.handoff.is_empty() {
            passes += 1;
            if passes % SHUTDOWN_LOG_EVERY == 0 {
                info!(instance = self.id, remaining = self.handoff.len(), "Draining consumer queue");
                self.heartbeat().await;
            }
            self.handoff.drain_into(&mut self.pool);
            tokio::time::sleep(SHUTDOWN_DRAIN_STEP).await;
        }

        let mut keepalive = BusKeepAlive(self.bus.as_mut());
        self.pool.shutdown(&mut keepalive).await;
        self.db.disconnect().await;
        self.bus.close().await;
        self.stats.set_depths(0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TableStatementGenerator;
    use crate::memory_bus::MemoryBus;
    use bmpsink_storage::MemoryStore;

    const CONFIG: &str = r#"
[base]
writer_max_threads_per_type = 1
writer_check_interval_secs = 3600
writer_queue_size = 100
consumer_queue_size = 100

[postgres]
batch_time_millis = 10
retries = 2

[kafka]
topic_subscribe_delay_millis = 0

[[tables]]
kind = "router"
table = "routers"
columns = ["hash_id", "name", "state"]
identity = ["hash_id"]

[[tables]]
kind = "unicast_prefix"
table = "ip_rib"
columns = ["hash_id", "peer_hash_id", "prefix"]
identity = ["hash_id"]
"#;

    fn build(bus: &MemoryBus, store: &MemoryStore, shutdown: Arc<AtomicBool>) -> IngestLoop {
        let config = Config::from_toml(CONFIG).unwrap();
        let generator = Arc::new(TableStatementGenerator::new(&config.tables));
        IngestLoop::new(
            0,
            &config,
            Box::new(bus.clone()),
            Arc::new(store.clone()),
            generator,
            shutdown,
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_router_record_written_inline_with_correction() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut ingest = build(&bus, &store, Arc::clone(&shutdown));

        let record = BusRecord::new(
            "openbmp.parsed.router",
            "r1",
            r#"[{"hash_id": "r1", "name": "edge", "state": "up", "action": "init", "timestamp": "2024-05-01 10:00:00"}]"#,
        );
        ingest.handle_record(record).await;

        let statements = store.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("INSERT INTO routers (hash_id,name,state) VALUES ('r1','edge','up')"));
        assert!(statements[1].starts_with("UPDATE bgp_peers SET state = 'down'"));
        assert_eq!(bus.counters().heartbeats, 1);
        assert_eq!(ingest.stats().snapshot().kind_count(RecordKind::Router), 1);

        ingest.shutdown_pipeline().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_and_undecodable_records_are_skipped() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let mut ingest = build(&bus, &store, Arc::new(AtomicBool::new(false)));

        ingest
            .handle_record(BusRecord::new("openbmp.parsed.bogus", "k", "[]"))
            .await;
        ingest
            .handle_record(BusRecord::new("openbmp.parsed.unicast_prefix", "k", "{oops"))
            .await;

        assert!(ingest.handoff.is_empty());
        let snapshot = ingest.stats().snapshot();
        assert_eq!(snapshot.messages, 2);
        assert_eq!(snapshot.kind_count(RecordKind::UnicastPrefix), 0);

        ingest.shutdown_pipeline().await;
        assert!(store.statements().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_key_routes_by_first_identity() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let mut ingest = build(&bus, &store, Arc::new(AtomicBool::new(false)));

        ingest
            .handle_record(BusRecord::new(
                "openbmp.parsed.unicast_prefix",
                "",
                r#"[{"hash_id": "h9", "peer_hash_id": "p1", "prefix": "10.0.0.0"}]"#,
            ))
            .await;
        ingest.handoff.drain_into(&mut ingest.pool);

        assert_eq!(
            ingest.pool.category(Category::Default).worker_for_key("h9"),
            ingest.pool.category(Category::Default).worker_ids().first().copied()
        );

        ingest.shutdown_pipeline().await;
        assert_eq!(
            store.statements(),
            vec!["INSERT INTO ip_rib (hash_id,peer_hash_id,prefix) VALUES ('h9','p1','10.0.0.0')"]
        );
        assert!(bus.counters().closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_row_message_counts_once() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let mut ingest = build(&bus, &store, Arc::new(AtomicBool::new(false)));

        ingest
            .handle_record(BusRecord::new(
                "openbmp.parsed.unicast_prefix",
                "peerA",
                r#"[{"hash_id": "h1", "peer_hash_id": "peerA", "prefix": "10.0.0.0"},
                    {"hash_id": "h2", "peer_hash_id": "peerA", "prefix": "10.1.0.0"},
                    {"hash_id": "h3", "peer_hash_id": "peerA", "prefix": "10.2.0.0"}]"#,
            ))
            .await;

        let snapshot = ingest.stats().snapshot();
        assert_eq!(snapshot.messages, 1);
        assert_eq!(snapshot.kind_count(RecordKind::UnicastPrefix), 1);

        ingest.shutdown_pipeline().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pauses_only_around_batches() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let ingest = build(&bus, &store, Arc::clone(&shutdown));

        let topic = "openbmp.parsed.unicast_prefix";
        bus.push_batch(vec![BusRecord::new(
            topic,
            "peerA",
            r#"[{"hash_id": "h1", "peer_hash_id": "peerA", "prefix": "10.0.0.0"}]"#,
        )]);
        bus.push_batch(vec![BusRecord::new(
            topic,
            "peerB",
            r#"[{"hash_id": "h2", "peer_hash_id": "peerB", "prefix": "10.1.0.0"}]"#,
        )]);

        let task = tokio::spawn(ingest.run());
        let deadline = Instant::now() + Duration::from_secs(10);
        while bus.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // idle polls with no health check due
        tokio::time::sleep(Duration::from_millis(100)).await;

        let counters = bus.counters();
        assert_eq!(counters.pauses, 2);
        assert_eq!(counters.resumes, 2);
        assert!(counters.polls > 2);
        assert!(!bus.is_paused());

        shutdown.store(true, Ordering::SeqCst);
        task.await.unwrap().unwrap();

        // shutdown pauses once more before draining
        assert_eq!(bus.counters().pauses, 3);
        let written = store.statements().join("\n");
        assert!(written.contains("'h1'") && written.contains("'h2'"));
    }
}
