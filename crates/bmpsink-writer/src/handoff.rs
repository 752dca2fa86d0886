//! Hand-off queue
//!
//! Bounded FIFO between the ingestion loop and the writer pool. A full queue
//! is backpressure, never an error: the producer keeps the bus alive, drains
//! what it can into the pool and tries again.

use crate::keepalive::KeepAlive;
use crate::pool::{WorkerSlot, WriterPool};
use bmpsink_common::WriteRequest;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

const PUSH_RETRY: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct HandoffQueue {
    queue: VecDeque<WriteRequest>,
    capacity: usize,
}

impl HandoffQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a request, handing it back when the queue is full
    pub fn try_push(&mut self, req: WriteRequest) -> Result<(), WriteRequest> {
        if self.queue.len() >= self.capacity {
            return Err(req);
        }
        self.queue.push_back(req);
        Ok(())
    }

    /// Append a request, draining into `pool` until there is room
    pub async fn push<K: KeepAlive + ?Sized>(
        &mut self,
        mut req: WriteRequest,
        pool: &mut WriterPool,
        keepalive: &mut K,
    ) {
        loop {
            match self.try_push(req) {
                Ok(()) => return,
                Err(back) => req = back,
            }
            keepalive.keep_alive().await;
            self.drain_into(pool);
            tokio::time::sleep(PUSH_RETRY).await;
        }
    }

    /// One FIFO pass over the requests queued at the start of the call.
    ///
    /// A request whose worker queue is full goes to the back of this queue
    /// and the worker is skipped for the rest of the pass, so later requests
    /// for it cannot overtake the one that bounced. Returns the number of
    /// requests delivered.
    pub fn drain_into(&mut self, pool: &mut WriterPool) -> usize {
        let mut busy: HashSet<WorkerSlot> = HashSet::new();
        let mut delivered = 0;

        for _ in 0..self.queue.len() {
            let Some(req) = self.queue.pop_front() else {
                break;
            };

            let slot = pool.route(&req);
            if busy.contains(&slot) {
                self.queue.push_back(req);
                continue;
            }

            match pool.try_send(slot, req) {
                Ok(()) => delivered += 1,
                Err(req) => {
                    self.queue.push_back(req);
                    busy.insert(slot);
                }
            }
        }
        delivered
    }
}
