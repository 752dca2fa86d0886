//! bmpsink consumer
//!
//! The ingestion side of the pipeline: bus abstraction and adapters,
//! staged topic subscription, statement generation, the router tracker and
//! inline corrections, the per-instance ingestion loop and the supervisor
//! that runs several instances side by side.

pub mod app;
pub mod bus;
pub mod corrections;
pub mod error;
pub mod generator;
pub mod ingest;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory_bus;
pub mod router;
pub mod stats;
pub mod subscribe;

pub use app::{BusFactory, ConsumerApp};
pub use bus::{BusConsumer, BusKeepAlive, BusRecord};
pub use error::{BusError, ConsumerError, GeneratorError, Result};
pub use generator::{Record, StatementGenerator, TableStatementGenerator};
pub use ingest::{IngestLoop, POLL_TIMEOUT};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaBusFactory};
pub use memory_bus::{BusCounters, MemoryBus};
pub use router::{REFRESH_QUERY, RouterEntry, RouterTracker};
pub use stats::{ConsumerStats, StatsSnapshot};
pub use subscribe::TopicSubscriber;
