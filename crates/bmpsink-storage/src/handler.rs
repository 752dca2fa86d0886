//! Storage handler
//!
//! Wraps one backend connection with the retry contract the writers rely
//! on. Failures never escape [`StorageHandler::query`]: a lost connection is
//! re-established with a blocking reconnect loop, a deadlock is retried after
//! a short pause, and anything else consumes the retry budget and is then
//! dropped with a warning.

use crate::backend::{Row, StorageBackend};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause between reconnect attempts
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(1000);

/// Pause before retrying a statement aborted by deadlock detection
pub const DEADLOCK_BACKOFF: Duration = Duration::from_millis(150);

pub struct StorageHandler {
    backend: Box<dyn StorageBackend>,
    connected: bool,
    reconnect_backoff: Duration,
    deadlock_backoff: Duration,
}

impl std::fmt::Debug for StorageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandler")
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl StorageHandler {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            connected: false,
            reconnect_backoff: RECONNECT_BACKOFF,
            deadlock_backoff: DEADLOCK_BACKOFF,
        }
    }

    /// Override the reconnect and deadlock pauses
    #[must_use]
    pub fn with_backoff(mut self, reconnect: Duration, deadlock: Duration) -> Self {
        self.reconnect_backoff = reconnect;
        self.deadlock_backoff = deadlock;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connect to the store. Failures are logged and reported as `false`.
    pub async fn connect(&mut self) -> bool {
        match self.backend.connect().await {
            Ok(()) => {
                info!("Connected to storage");
                self.connected = true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to storage");
                self.connected = false;
            }
        }
        self.connected
    }

    async fn reconnect(&mut self) {
        self.connected = false;
        while !self.connect().await {
            tokio::time::sleep(self.reconnect_backoff).await;
        }
    }

    /// Execute a statement with up to `retries` attempts.
    ///
    /// Returns whether the statement eventually succeeded. A connection loss
    /// blocks until the store is reachable again and does not end the loop
    /// early, it only consumes the attempt that failed.
    pub async fn query(&mut self, sql: &str, retries: u32) -> bool {
        if !self.connected {
            self.connect().await;
        }

        for attempt in 0..retries {
            trace!(attempt, sql, "Executing statement");
            match self.backend.execute(sql).await {
                Ok(_) => return true,
                Err(e) => {
                    if attempt + 1 >= retries && e.code() != Some("42601") {
                        info!(attempt, code = e.code().unwrap_or("-"), error = %e, "Statement failed");
                    }

                    if e.is_connection() {
                        error!(error = %e, "Not connected to storage");
                        self.reconnect().await;
                    } else if e.is_deadlock() {
                        tokio::time::sleep(self.deadlock_backoff).await;
                    }
                }
            }
        }

        warn!("Failed to insert/update after {} max retries", retries);
        debug!(sql, "Dropped statement");
        false
    }

    /// Run a read query. Errors are logged and yield no rows.
    pub async fn select(&mut self, sql: &str) -> Vec<Row> {
        if !self.connected {
            self.connect().await;
        }

        match self.backend.select(sql).await {
            Ok(rows) => rows,
            Err(e) => {
                if e.is_connection() {
                    self.connected = false;
                }
                warn!(error = %e, sql, "Select failed");
                Vec::new()
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.backend.disconnect().await;
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StorageConnector;
    use crate::error::StorageError;
    use crate::memory::MemoryStore;

    fn handler(store: &MemoryStore) -> StorageHandler {
        StorageHandler::new(store.open())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_query_success() {
        let store = MemoryStore::new();
        let mut db = handler(&store);

        assert!(db.connect().await);
        assert!(db.query("INSERT INTO t VALUES (1)", 3).await);
        assert_eq!(store.statements(), vec!["INSERT INTO t VALUES (1)"]);
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let store = MemoryStore::new();
        let mut db = handler(&store);
        assert!(db.connect().await);

        store.fail_next_executes(vec![
            StorageError::connection("Broken pipe"),
            StorageError::connection("connection reset by peer"),
        ]);
        store.fail_next_connects(2);

        assert!(db.query("INSERT INTO t VALUES (1)", 5).await);
        assert!(db.is_connected());
        assert_eq!(store.statements().len(), 1);
        // initial connect plus one successful reconnect per lost connection
        assert_eq!(store.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_deadlock_retried() {
        let store = MemoryStore::new();
        let mut db = handler(&store);

        store.fail_next_executes(vec![StorageError::deadlock("deadlock detected")]);
        assert!(db.query("UPDATE t SET x = 1", 2).await);
        assert_eq!(store.statements().len(), 1);
        assert_eq!(store.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let store = MemoryStore::new();
        let mut db = handler(&store);

        store.fail_next_executes(vec![
            StorageError::statement("syntax error"),
            StorageError::statement("syntax error"),
            StorageError::statement("syntax error"),
        ]);
        assert!(!db.query("INSER INTO t", 3).await);
        assert!(store.statements().is_empty());

        // budget exhausted, the next statement is unaffected
        assert!(db.query("INSERT INTO t VALUES (2)", 3).await);
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        let store = MemoryStore::new();
        store.fail_next_connects(1);
        let mut db = handler(&store);

        assert!(!db.connect().await);
        assert!(!db.is_connected());
        assert!(db.connect().await);
    }

    #[tokio::test]
    async fn test_select_rows() {
        let store = MemoryStore::new();
        let mut row = Row::new();
        row.insert("name".to_string(), "r1".to_string());
        store.set_select_rows(vec![row.clone()]);

        let mut db = handler(&store);
        assert_eq!(db.select("SELECT name FROM routers").await, vec![row]);
        assert_eq!(store.selects(), vec!["SELECT name FROM routers"]);
    }
}
