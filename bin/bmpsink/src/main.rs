//! bmpsink - BMP feed to PostgreSQL consumer
//!
//! Loads the configuration, checks that the store is reachable and runs the
//! configured number of ingestion instances until interrupted.

use anyhow::Result;
use bmpsink_common::Config;
use bmpsink_consumer::{BusFactory, ConsumerApp, TableStatementGenerator};
use bmpsink_storage::PgConnector;
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CONFIG: i32 = 1;
const EXIT_STORAGE: i32 = 2;
const EXIT_CONSUMER: i32 = 3;

/// Startup error of a binary built without a bus adapter
const MISSING_KAFKA_FEATURE: &str = "bmpsink was built without the `kafka` cargo feature and cannot \
     read from Kafka; rebuild with `cargo build --release --features kafka`";

#[derive(Parser, Debug)]
#[command(name = "bmpsink")]
#[command(about = "Consume parsed BMP records from Kafka and store them in PostgreSQL")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/bmpsink/bmpsink.toml", env = "BMPSINK_CONFIG")]
    config: String,

    /// Seconds between stats lines, 0 disables (overrides the config file)
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(feature = "kafka")]
fn bus_factory(config: &Config) -> Option<Arc<dyn BusFactory>> {
    Some(Arc::new(bmpsink_consumer::KafkaBusFactory::new(
        config.kafka.client_properties(),
    )))
}

#[cfg(not(feature = "kafka"))]
fn bus_factory(_config: &Config) -> Option<Arc<dyn BusFactory>> {
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting bmpsink");
    info!("Config file: {}", args.config);

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(interval) = args.stats_interval {
        config.base.stats_interval = interval;
    }
    if config.tables.is_empty() {
        warn!("No [[tables]] configured, records will only be counted");
    }

    let Some(buses) = bus_factory(&config) else {
        error!("{}", MISSING_KAFKA_FEATURE);
        std::process::exit(EXIT_CONFIG);
    };

    let connector = match PgConnector::new(&config.postgres) {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            error!("Invalid postgres settings: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!(
        host = %config.postgres.host,
        db = %config.postgres.db_name,
        instances = config.base.consumer_threads,
        "Configuration loaded"
    );

    let generator = Arc::new(TableStatementGenerator::new(&config.tables));
    let app = ConsumerApp::new(config, buses, connector, generator);

    if !app.check_storage().await {
        error!("Failed to connect to PostgreSQL, exiting");
        std::process::exit(EXIT_STORAGE);
    }

    let shutdown = app.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        shutdown.store(true, Ordering::SeqCst);
    });

    if let Err(e) = app.run().await {
        error!("Consumer stopped: {}", e);
        std::process::exit(EXIT_CONSUMER);
    }

    info!("bmpsink stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_toml(include_str!("../bmpsink.toml")).unwrap();
        assert_eq!(config.tables.len(), 5);
        assert_eq!(config.kafka.compiled_patterns().unwrap().len(), 4);
        assert_eq!(
            config.kafka.client_properties()["group.id"],
            "openbmp-psql-consumer"
        );
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn test_no_bus_without_kafka_feature() {
        assert!(bus_factory(&Config::default()).is_none());
        assert!(MISSING_KAFKA_FEATURE.contains("--features kafka"));
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn test_kafka_bus_factory() {
        assert!(bus_factory(&Config::default()).is_some());
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from(["bmpsink", "--config", "a.toml", "--stats-interval", "0"]);
        assert_eq!(args.config, "a.toml");
        assert_eq!(args.stats_interval, Some(0));
        assert_eq!(args.log_level, "info");
    }
}
