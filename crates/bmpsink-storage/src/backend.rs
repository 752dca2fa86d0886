//! Backend traits
//!
//! A [`StorageBackend`] is one connection to the relational store. A
//! [`StorageConnector`] hands out fresh, unconnected backends so that every
//! concurrent writer owns its own connection.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// One result row, keyed by column name. NULL columns are omitted.
pub type Row = HashMap<String, String>;

#[async_trait]
pub trait StorageBackend: Send {
    /// Establish (or re-establish) the connection
    async fn connect(&mut self) -> Result<()>;

    /// Run a statement that returns no rows, returning the affected row count
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a query and return every row as text
    async fn select(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// Close the connection, errors are ignored
    async fn disconnect(&mut self);
}

/// Factory for backends, shared by every writer of a consumer
pub trait StorageConnector: Send + Sync {
    fn open(&self) -> Box<dyn StorageBackend>;
}
