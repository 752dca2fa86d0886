//! bmpsink storage
//!
//! Access to the relational store. Each concurrent writer owns its own
//! [`StorageHandler`], opened through a shared [`StorageConnector`].

pub mod backend;
pub mod error;
pub mod handler;
pub mod memory;
pub mod postgres;

pub use backend::{Row, StorageBackend, StorageConnector};
pub use error::{Result, StorageError};
pub use handler::{DEADLOCK_BACKOFF, RECONNECT_BACKOFF, StorageHandler};
pub use memory::{ExecutedStatement, MemoryStore};
pub use postgres::PgConnector;
