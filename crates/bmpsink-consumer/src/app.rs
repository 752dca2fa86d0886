//! Consumer supervisor
//!
//! Starts the configured number of ingestion instances, logs their stats on
//! an interval, and stops every instance as soon as one of them stops.

use crate::bus::BusConsumer;
use crate::error::{BusError, ConsumerError, Result};
use crate::generator::StatementGenerator;
use crate::ingest::IngestLoop;
use bmpsink_common::Config;
use bmpsink_storage::{StorageConnector, StorageHandler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};
use tracing::{error, info};

/// Creates one bus consumer per ingestion instance
pub trait BusFactory: Send + Sync {
    fn create(&self, instance: usize) -> std::result::Result<Box<dyn BusConsumer>, BusError>;
}

pub struct ConsumerApp {
    config: Config,
    buses: Arc<dyn BusFactory>,
    connector: Arc<dyn StorageConnector>,
    generator: Arc<dyn StatementGenerator>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConsumerApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerApp")
            .field("instances", &self.config.base.consumer_threads)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConsumerApp {
    pub fn new(
        config: Config,
        buses: Arc<dyn BusFactory>,
        connector: Arc<dyn StorageConnector>,
        generator: Arc<dyn StatementGenerator>,
    ) -> Self {
        Self {
            config,
            buses,
            connector,
            generator,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops every instance once set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Whether the store accepts a connection right now
    pub async fn check_storage(&self) -> bool {
        let mut db = StorageHandler::new(self.connector.open());
        let connected = db.connect().await;
        db.disconnect().await;
        connected
    }

    fn build_instance(&self, instance: usize) -> Result<IngestLoop> {
        let bus = self.buses.create(instance)?;
        IngestLoop::new(
            instance,
            &self.config,
            bus,
            Arc::clone(&self.connector),
            Arc::clone(&self.generator),
            Arc::clone(&self.shutdown),
        )
    }

    /// Run every instance until shutdown or until one of them stops.
    ///
    /// Returns the first instance failure, if any.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut stats = Vec::with_capacity(self.config.base.consumer_threads);

        for instance in 0..self.config.base.consumer_threads {
            let ingest = match self.build_instance(instance) {
                Ok(ingest) => ingest,
                Err(e) => {
                    error!(instance, error = %e, "Failed to start consumer, stopping started ones");
                    self.shutdown.store(true, Ordering::SeqCst);
                    while tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            };
            stats.push((instance, ingest.stats()));

            // inner task so a panic is still attributed to its instance
            tasks.spawn(async move { (instance, tokio::spawn(ingest.run()).await) });
        }
        info!(instances = stats.len(), "Consumers started");

        let mut ticker = (self.config.base.stats_interval > 0).then(|| {
            let period = Duration::from_secs(self.config.base.stats_interval);
            tokio::time::interval_at(Instant::now() + period, period)
        });

        let mut failure = None;
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let outcome = match joined {
                        Ok((_, Ok(Ok(())))) => None,
                        Ok((_, Ok(Err(e)))) => Some(e),
                        Ok((instance, Err(e))) => Some(ConsumerError::InstanceFailed {
                            instance,
                            reason: e.to_string(),
                        }),
                        Err(e) => Some(ConsumerError::InstanceFailed {
                            instance: usize::MAX,
                            reason: e.to_string(),
                        }),
                    };

                    if !self.shutdown.swap(true, Ordering::SeqCst) {
                        info!("Consumer stopped, shutting down all consumers");
                    }
                    if let Some(e) = outcome {
                        error!(error = %e, "Consumer failed");
                        failure.get_or_insert(e);
                    }
                }
                () = tick(&mut ticker) => {
                    for (instance, stats) in &stats {
                        stats.log_stats(*instance);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::TableStatementGenerator;
    use crate::memory_bus::MemoryBus;
    use bmpsink_storage::MemoryStore;

    struct SharedBus(MemoryBus);

    impl BusFactory for SharedBus {
        fn create(&self, _instance: usize) -> std::result::Result<Box<dyn BusConsumer>, BusError> {
            Ok(Box::new(self.0.clone()))
        }
    }

    fn app(bus: &MemoryBus, store: &MemoryStore) -> ConsumerApp {
        let config = Config::from_toml(
            r#"
[base]
stats_interval = 0
writer_max_threads_per_type = 1
writer_queue_size = 10
consumer_queue_size = 10
"#,
        )
        .unwrap();
        let generator = Arc::new(TableStatementGenerator::new(&config.tables));
        ConsumerApp::new(
            config,
            Arc::new(SharedBus(bus.clone())),
            Arc::new(store.clone()),
            generator,
        )
    }

    /// Hands out the shared bus to the first instance only
    struct FirstOnly(MemoryBus);

    impl BusFactory for FirstOnly {
        fn create(&self, instance: usize) -> std::result::Result<Box<dyn BusConsumer>, BusError> {
            if instance == 0 {
                Ok(Box::new(self.0.clone()))
            } else {
                Err(BusError::client("no brokers available"))
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_check_storage() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let app = app(&bus, &store);

        assert!(app.check_storage().await);
        store.fail_next_connects(1);
        assert!(!app.check_storage().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_flag_stops_cleanly() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let app = app(&bus, &store);

        let shutdown = app.shutdown_handle();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.store(true, Ordering::SeqCst);
        });

        app.run().await.unwrap();
        stopper.await.unwrap();
        assert!(bus.counters().closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bus_failure_stops_app() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let app = app(&bus, &store);

        bus.fail_next_poll(BusError::client("broker gone"));
        let err = app.run().await.unwrap_err();
        assert!(matches!(err, ConsumerError::InstanceFailed { instance: 0, .. }));
        assert!(app.shutdown_handle().load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_startup_stops_started_instances() {
        let bus = MemoryBus::new();
        let store = MemoryStore::new();
        let config = Config::from_toml(
            r#"
[base]
stats_interval = 0
consumer_threads = 2
writer_max_threads_per_type = 1
"#,
        )
        .unwrap();
        let generator = Arc::new(TableStatementGenerator::new(&config.tables));
        let app = ConsumerApp::new(
            config,
            Arc::new(FirstOnly(bus.clone())),
            Arc::new(store.clone()),
            generator,
        );

        let err = app.run().await.unwrap_err();
        assert!(matches!(err, ConsumerError::Bus(BusError::Client(_))));
        assert!(app.shutdown_handle().load(Ordering::SeqCst));
        assert!(bus.counters().closed);
    }
}
