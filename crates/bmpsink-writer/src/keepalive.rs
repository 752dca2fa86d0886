//! Keep-alive hook for long waits
//!
//! Draining a writer queue can take a while. The ingestion loop has paused
//! fetching by then, but the bus still needs to see it poll or the consumer
//! is evicted from its group.

use async_trait::async_trait;

#[async_trait]
pub trait KeepAlive: Send {
    async fn keep_alive(&mut self);
}

/// Keep-alive that does nothing, for callers without a bus
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeepAlive;

#[async_trait]
impl KeepAlive for NoKeepAlive {
    async fn keep_alive(&mut self) {}
}
