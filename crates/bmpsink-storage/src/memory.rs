//! In-memory storage backend
//!
//! Records every statement instead of running it. Failures, latency and
//! select results can be scripted, which is what the writer and consumer
//! tests use in place of a real database.

use crate::backend::{Row, StorageBackend, StorageConnector};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A statement as received by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    /// Backend that ran it, one per `open()`
    pub backend_id: u64,
    pub sql: String,
}

#[derive(Default)]
struct MemoryState {
    executed: Vec<ExecutedStatement>,
    selects: Vec<String>,
    select_rows: Vec<Row>,
    execute_failures: VecDeque<StorageError>,
    connect_failures: usize,
    connects: usize,
    latency: Duration,
    next_backend_id: u64,
}

/// Shared in-memory store; clones observe the same state
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("executed", &state.executed.len())
            .field("connects", &state.connects)
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// SQL text of every executed statement, in order
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .executed
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.lock().executed.clone()
    }

    pub fn selects(&self) -> Vec<String> {
        self.state.lock().selects.clone()
    }

    /// Number of successful connects across all backends
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Fail the next executes, in order, with the given errors
    pub fn fail_next_executes(&self, errors: impl IntoIterator<Item = StorageError>) {
        self.state.lock().execute_failures.extend(errors);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().connect_failures = count;
    }

    /// Rows returned by every subsequent select
    pub fn set_select_rows(&self, rows: Vec<Row>) {
        self.state.lock().select_rows = rows;
    }

    /// Delay applied to each execute before it is recorded
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }
}

impl StorageConnector for MemoryStore {
    fn open(&self) -> Box<dyn StorageBackend> {
        let backend_id = {
            let mut state = self.state.lock();
            state.next_backend_id += 1;
            state.next_backend_id
        };
        Box::new(MemoryBackend {
            store: self.clone(),
            backend_id,
            connected: false,
        })
    }
}

struct MemoryBackend {
    store: MemoryStore,
    backend_id: u64,
    connected: bool,
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.store.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            self.connected = false;
            return Err(StorageError::connection("connection refused"));
        }
        state.connects += 1;
        self.connected = true;
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        if !self.connected {
            return Err(StorageError::connection("no connection to the server"));
        }

        let latency = self.store.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.store.state.lock();
        if let Some(err) = state.execute_failures.pop_front() {
            if err.is_connection() {
                self.connected = false;
            }
            return Err(err);
        }
        state.executed.push(ExecutedStatement {
            backend_id: self.backend_id,
            sql: sql.to_string(),
        });
        Ok(1)
    }

    async fn select(&mut self, sql: &str) -> Result<Vec<Row>> {
        if !self.connected {
            return Err(StorageError::connection("no connection to the server"));
        }
        let mut state = self.store.state.lock();
        state.selects.push(sql.to_string());
        Ok(state.select_rows.clone())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}
