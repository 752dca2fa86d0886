//! End-to-end runs of the consumer against the in-memory bus and store

use bmpsink_common::Config;
use bmpsink_consumer::{
    BusConsumer, BusError, BusFactory, BusRecord, ConsumerApp, ConsumerError, MemoryBus,
    TableStatementGenerator,
};
use bmpsink_storage::MemoryStore;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

struct SharedBus(MemoryBus);

impl BusFactory for SharedBus {
    fn create(&self, _instance: usize) -> Result<Box<dyn BusConsumer>, BusError> {
        Ok(Box::new(self.0.clone()))
    }
}

const TABLES: &str = r#"
[[tables]]
kind = "collector"
table = "collectors"
columns = ["hash_id", "action"]
identity = ["hash_id"]

[[tables]]
kind = "peer"
table = "bgp_peers"
columns = ["hash_id", "router_hash_id", "state"]
identity = ["hash_id"]

[[tables]]
kind = "unicast_prefix"
table = "ip_rib"
columns = ["hash_id", "peer_hash_id", "prefix::inet", "prefix_len"]
identity = ["hash_id"]
"#;

fn app(bus: &MemoryBus, store: &MemoryStore, base: &str) -> ConsumerApp {
    let config = Config::from_toml(&format!("{base}\n{TABLES}")).unwrap();
    let generator = Arc::new(TableStatementGenerator::new(&config.tables));
    ConsumerApp::new(
        config,
        Arc::new(SharedBus(bus.clone())),
        Arc::new(store.clone()),
        generator,
    )
}

/// Run the app until the bus has handed out every record, then stop it
async fn run_until_consumed(app: &ConsumerApp, bus: &MemoryBus) -> Result<(), ConsumerError> {
    let shutdown = app.shutdown_handle();
    let bus = bus.clone();
    let stopper = tokio::spawn(async move {
        let deadline = Instant::now() + Duration::from_secs(10);
        while bus.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.store(true, Ordering::SeqCst);
    });

    let result = app.run().await;
    stopper.await.unwrap();
    result
}

fn prefix(hash: &str, net: &str, len: u8) -> String {
    format!(r#"[{{"hash_id": "{hash}", "peer_hash_id": "peerA", "prefix": "{net}", "prefix_len": {len}}}]"#)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_lands_on_one_worker_with_latest_values() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let app = app(
        &bus,
        &store,
        r#"
[base]
stats_interval = 0
writer_max_threads_per_type = 2

[postgres]
batch_time_millis = 60000

[kafka]
topic_subscribe_delay_millis = 0
"#,
    );

    let topic = "openbmp.parsed.unicast_prefix";
    bus.push_batch(vec![
        BusRecord::new(topic, "peerA", prefix("h1", "10.0.0.0", 8)),
        BusRecord::new(topic, "peerA", prefix("h2", "10.1.0.0", 16)),
    ]);
    bus.push_batch(vec![BusRecord::new(topic, "peerA", prefix("h1", "10.0.0.0", 24))]);

    run_until_consumed(&app, &bus).await.unwrap();

    let inserts: Vec<_> = store
        .executed()
        .into_iter()
        .filter(|s| s.sql.starts_with("INSERT INTO ip_rib"))
        .collect();
    assert_eq!(inserts.len(), 1);
    assert_eq!(
        inserts[0].sql,
        "INSERT INTO ip_rib (hash_id,peer_hash_id,prefix,prefix_len) VALUES \
         ('h1','peerA','10.0.0.0'::inet,24),('h2','peerA','10.1.0.0'::inet,16)"
    );
    assert!(bus.counters().closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_statements_share_one_writer_connection() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let app = app(
        &bus,
        &store,
        r#"
[base]
stats_interval = 0
writer_max_threads_per_type = 2
writer_check_interval_secs = 3600

[postgres]
batch_records = 1
batch_time_millis = 60000

[kafka]
topic_subscribe_delay_millis = 0
"#,
    );

    let topic = "openbmp.parsed.unicast_prefix";
    bus.push_batch(vec![
        BusRecord::new(topic, "peerA", prefix("h1", "10.0.0.0", 8)),
        BusRecord::new(topic, "peerA", prefix("h2", "10.1.0.0", 16)),
    ]);
    bus.push_batch(vec![BusRecord::new(topic, "peerA", prefix("h3", "10.2.0.0", 24))]);

    run_until_consumed(&app, &bus).await.unwrap();

    // one row per flush, so every message is its own statement
    let inserts: Vec<_> = store
        .executed()
        .into_iter()
        .filter(|s| s.sql.starts_with("INSERT INTO ip_rib"))
        .collect();
    assert_eq!(inserts.len(), 3);
    assert!(inserts.iter().all(|s| s.backend_id == inserts[0].backend_id));
    for (insert, hash) in inserts.iter().zip(["'h1'", "'h2'", "'h3'"]) {
        assert!(insert.sql.contains(hash), "{}", insert.sql);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_router_reconnect_corrects_once() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let app = app(
        &bus,
        &store,
        r#"
[base]
stats_interval = 0
writer_max_threads_per_type = 1

[kafka]
topic_subscribe_delay_millis = 0
"#,
    );

    let router = |ts: &str| {
        BusRecord::new(
            "openbmp.parsed.router",
            "r1",
            format!(r#"[{{"hash_id": "r1", "action": "init", "timestamp": "{ts}"}}]"#),
        )
    };
    bus.push_batch(vec![router("2024-05-01 10:00:00")]);
    bus.push_batch(vec![router("2024-05-01 10:05:00")]);

    run_until_consumed(&app, &bus).await.unwrap();

    let corrections: Vec<String> = store
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("UPDATE bgp_peers"))
        .collect();
    assert_eq!(
        corrections,
        vec!["UPDATE bgp_peers SET state = 'down' WHERE router_hash_id = 'r1' AND timestamp < '2024-05-01 10:00:00'"]
    );
    assert!(bus.counters().heartbeats >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_staged_subscription_orders_dependent_records() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let app = app(
        &bus,
        &store,
        r#"
[base]
stats_interval = 0
writer_max_threads_per_type = 1

[kafka]
topic_subscribe_delay_millis = 50
"#,
    );

    // queued ahead of the collector, but only subscribed to later
    bus.push_batch(vec![BusRecord::new(
        "openbmp.parsed.peer",
        "p1",
        r#"[{"hash_id": "p1", "router_hash_id": "r1", "state": "up", "timestamp": "2024-05-01 10:00:00"}]"#,
    )]);
    bus.push_batch(vec![BusRecord::new(
        "openbmp.parsed.collector",
        "c1",
        r#"[{"hash_id": "c1", "action": "started"}]"#,
    )]);

    run_until_consumed(&app, &bus).await.unwrap();

    assert_eq!(
        store.statements(),
        vec![
            "INSERT INTO collectors (hash_id,action) VALUES ('c1','started')",
            "UPDATE routers SET state = 'down' WHERE collector_hash_id = 'c1'",
            "INSERT INTO bgp_peers (hash_id,router_hash_id,state) VALUES ('p1','r1','up')",
            "DELETE FROM ip_rib WHERE peer_hash_id = 'p1' AND timestamp < '2024-05-01 10:00:00'",
        ]
    );
    assert!(bus.counters().subscriptions.len() >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bus_failure_fails_instance_and_drains() {
    let bus = MemoryBus::new();
    let store = MemoryStore::new();
    let app = app(
        &bus,
        &store,
        r#"
[base]
stats_interval = 0
writer_max_threads_per_type = 1

[kafka]
topic_subscribe_delay_millis = 0
"#,
    );

    bus.fail_next_poll(BusError::client("broker transport failure"));
    let err = app.run().await.unwrap_err();
    match err {
        ConsumerError::InstanceFailed { instance, reason } => {
            assert_eq!(instance, 0);
            assert!(reason.contains("broker transport failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(bus.counters().closed);
}
