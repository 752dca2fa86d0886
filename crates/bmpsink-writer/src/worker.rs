//! Writer worker
//!
//! A worker owns one storage connection and the receiving end of a bounded
//! queue. Requests are merged into a [`MergeBuffer`] and flushed when the
//! batch window closes or the buffer reaches its record limit. Closing the
//! queue is the shutdown signal: the worker flushes what it holds,
//! disconnects and exits.

use crate::merge::MergeBuffer;
use bmpsink_common::{Config, WriteRequest};
use bmpsink_storage::{DEADLOCK_BACKOFF, RECONNECT_BACKOFF, StorageHandler};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A single value longer than this forces the buffer out immediately
pub const MAX_VALUE_LEN: usize = 100_000;

/// Retry budget for requests that bypass batching
pub const IMMEDIATE_RETRIES: u32 = 3;

/// Per-worker batching and retry settings
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_time: Duration,
    pub batch_records: usize,
    pub retries: u32,
    pub reconnect_backoff: Duration,
    pub deadlock_backoff: Duration,
}

impl WriterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_time: config.postgres.batch_time(),
            batch_records: config.postgres.batch_records,
            retries: config.postgres.retries,
            reconnect_backoff: RECONNECT_BACKOFF,
            deadlock_backoff: DEADLOCK_BACKOFF,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct WriterWorker {
    id: usize,
    rx: mpsc::Receiver<WriteRequest>,
    db: StorageHandler,
    config: WriterConfig,
    buffer: MergeBuffer,
    last_flush: Instant,
}

impl WriterWorker {
    /// Start a worker task with a queue of `queue_size` requests
    pub fn spawn(
        id: usize,
        db: StorageHandler,
        config: WriterConfig,
        queue_size: usize,
    ) -> WriterHandle {
        let (tx, rx) = mpsc::channel(queue_size);
        let db = db.with_backoff(config.reconnect_backoff, config.deadlock_backoff);
        let worker = Self {
            id,
            rx,
            db,
            config,
            buffer: MergeBuffer::new(),
            last_flush: Instant::now(),
        };
        let task = tokio::spawn(worker.run());
        WriterHandle { id, tx, task }
    }

    async fn run(mut self) {
        debug!(writer = self.id, "Writer started");
        self.db.connect().await;

        loop {
            let deadline = self.last_flush + self.config.batch_time;
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(req)) => self.accept(req).await,
                Ok(None) => break,
                Err(_) => {}
            }

            if self.last_flush.elapsed() >= self.config.batch_time {
                self.flush().await;
            } else if self.buffer.record_count() >= self.config.batch_records {
                self.flush().await;
            }
        }

        self.flush().await;
        self.db.disconnect().await;
        debug!(writer = self.id, "Writer stopped");
    }

    async fn accept(&mut self, req: WriteRequest) {
        if !req.batchable {
            self.db.query(&req.to_sql(), IMMEDIATE_RETRIES).await;
            return;
        }

        let oversized = req.max_value_len() > MAX_VALUE_LEN;
        self.buffer.merge(req);
        if oversized {
            debug!(writer = self.id, "Oversized value, flushing early");
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            return;
        }

        let records = self.buffer.record_count();
        for sql in self.buffer.take_statements() {
            self.db.query(&sql, self.config.retries).await;
        }
        debug!(writer = self.id, records, "Flushed batch");
    }
}

/// Pool-side handle to a running worker
pub struct WriterHandle {
    id: usize,
    tx: mpsc::Sender<WriteRequest>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("id", &self.id)
            .field("depth", &self.depth())
            .finish()
    }
}

impl WriterHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Requests waiting in the worker's queue
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Whether the worker task has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a request without waiting; a full or closed queue hands it back
    pub fn try_send(&self, req: WriteRequest) -> Result<(), WriteRequest> {
        self.tx.try_send(req).map_err(|e| match e {
            TrySendError::Full(req) | TrySendError::Closed(req) => req,
        })
    }

    /// Close the queue and wait for the worker to flush and exit
    pub async fn shutdown(self) {
        let Self { id, tx, task } = self;
        drop(tx);
        match task.await {
            Ok(()) => info!(writer = id, "Writer shut down"),
            Err(e) => warn!(writer = id, error = %e, "Writer task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmpsink_common::Category;
    use bmpsink_storage::{MemoryStore, StorageConnector};
    use indexmap::IndexMap;

    fn spawn(store: &MemoryStore, batch_time: Duration, batch_records: usize) -> WriterHandle {
        let config = WriterConfig {
            batch_time,
            batch_records,
            retries: 3,
            reconnect_backoff: Duration::from_millis(1),
            deadlock_backoff: Duration::from_millis(1),
        };
        WriterWorker::spawn(0, StorageHandler::new(store.open()), config, 1000)
    }

    fn request(identity: &str, value: &str) -> WriteRequest {
        let mut values = IndexMap::new();
        values.insert(identity.to_string(), value.to_string());
        WriteRequest::new("peerA", Category::Default, "INSERT INTO t VALUES ", "", values)
    }

    #[tokio::test]
    async fn test_flush_on_batch_time() {
        let store = MemoryStore::new();
        let writer = spawn(&store, Duration::from_millis(75), 200);

        writer.try_send(request("a", "('a')")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.statements(), vec!["INSERT INTO t VALUES ('a')"]);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_record_limit() {
        let store = MemoryStore::new();
        let writer = spawn(&store, Duration::from_secs(30), 200);

        for i in 0..200 {
            writer.try_send(request(&format!("r{i}"), &format!("({i})"))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let statements = store.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].matches('(').count(), 200);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_later_value_replaces_earlier() {
        let store = MemoryStore::new();
        let writer = spawn(&store, Duration::from_secs(30), 200);

        writer.try_send(request("a", "('a',1)")).unwrap();
        writer.try_send(request("b", "('b',1)")).unwrap();
        writer.try_send(request("a", "('a',2)")).unwrap();
        writer.shutdown().await;

        assert_eq!(
            store.statements(),
            vec!["INSERT INTO t VALUES ('a',2),('b',1)"]
        );
    }

    #[tokio::test]
    async fn test_immediate_request_bypasses_buffer() {
        let store = MemoryStore::new();
        let writer = spawn(&store, Duration::from_secs(30), 200);

        writer.try_send(request("a", "('a')")).unwrap();
        writer
            .try_send(WriteRequest::immediate("peerA", Category::Default, "DELETE FROM t"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.statements(), vec!["DELETE FROM t"]);

        writer.shutdown().await;
        assert_eq!(store.statements().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_value_flushes() {
        let store = MemoryStore::new();
        let writer = spawn(&store, Duration::from_secs(30), 200);

        writer.try_send(request("small", "('s')")).unwrap();
        let big = format!("('{}')", "x".repeat(MAX_VALUE_LEN + 1));
        writer.try_send(request("big", &big)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let statements = store.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with("INSERT INTO t VALUES ('s'),('xxx"));
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_depth_and_full_queue() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(500));
        let config = WriterConfig {
            batch_time: Duration::from_secs(30),
            batch_records: 200,
            retries: 1,
            reconnect_backoff: Duration::from_millis(1),
            deadlock_backoff: Duration::from_millis(1),
        };
        let writer = WriterWorker::spawn(7, StorageHandler::new(store.open()), config, 2);
        assert_eq!(writer.id(), 7);
        assert_eq!(writer.capacity(), 2);

        // first request keeps the worker busy in storage
        writer
            .try_send(WriteRequest::immediate("k", Category::Default, "SELECT 1"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        writer.try_send(request("a", "(1)")).unwrap();
        writer.try_send(request("b", "(2)")).unwrap();
        assert_eq!(writer.depth(), 2);
        assert!(writer.try_send(request("c", "(3)")).is_err());
        writer.shutdown().await;
    }
}
