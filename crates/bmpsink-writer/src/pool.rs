//! Writer pool manager
//!
//! Each category owns an ordered list of writer workers. Requests are routed
//! stickily: once a routing key is assigned to a worker, every later request
//! for that key goes to the same worker until the worker is reset. New keys
//! go to the least loaded worker.
//!
//! The periodic health check grows a pool whose workers stay above the high
//! watermark, shrinks a pool whose workers all sit below the low watermark,
//! and resets individual hot workers so their keys get redistributed. The
//! pool is owned by one ingestion task and only mutated through `&mut self`,
//! so routing never interleaves with a pool change.

use crate::keepalive::KeepAlive;
use crate::worker::{WriterConfig, WriterHandle, WriterWorker};
use bmpsink_common::{Category, Config, WriteRequest};
use bmpsink_storage::{StorageConnector, StorageHandler};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Drain steps between keep-alive calls
const KEEPALIVE_EVERY: u32 = 5000;

const DRAIN_STEP: Duration = Duration::from_millis(1);

/// Pool sizing and rebalance policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub queue_size: usize,
    pub allowed_over_queue_times: u32,
    pub scale_back_cooldown: Duration,
    pub rebalance_cooldown: Duration,
    pub writer: WriterConfig,
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.base.writer_max_threads_per_type,
            queue_size: config.base.writer_queue_size,
            allowed_over_queue_times: config.base.writer_allowed_over_queue_times,
            scale_back_cooldown: config.base.scale_back_cooldown(),
            rebalance_cooldown: config.base.rebalance_cooldown(),
            writer: WriterConfig::from_config(config),
        }
    }
}

/// Routing and load bookkeeping for one worker
#[derive(Debug, Default, Clone)]
pub struct WorkerState {
    pub assigned: HashSet<String>,
    /// Consecutive health checks above the high watermark
    pub over_count: u32,
    /// Requests routed since the last reset
    pub running_count: u64,
}

impl WorkerState {
    fn reset(&mut self) {
        self.assigned.clear();
        self.over_count = 0;
        self.running_count = 0;
    }
}

struct PoolWorker {
    handle: WriterHandle,
    state: WorkerState,
}

/// Outcome of assessing one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HealthAction {
    /// Drain and reset these workers
    Rebalance(Vec<usize>),
    Grow,
    Shrink,
    Hold,
}

/// Decide what a category needs.
///
/// Updates the over-watermark counters in `states` as a side effect.
/// `depths[i]` is the queue depth of worker `i`.
pub(crate) fn assess(
    category: Category,
    states: &mut [WorkerState],
    depths: &[usize],
    capacity: usize,
    config: &PoolConfig,
    rebalance_due: bool,
    shrink_due: bool,
) -> HealthAction {
    let allowed = config.allowed_over_queue_times;

    if rebalance_due {
        let mut hot = Vec::new();
        for (i, state) in states.iter_mut().enumerate() {
            if state.over_count > allowed && state.assigned.len() > 1 {
                hot.push(i);
            } else {
                state.running_count = depths[i] as u64;
            }
        }
        if !hot.is_empty() {
            return HealthAction::Rebalance(hot);
        }
    }

    let mut below = 0;
    for (i, state) in states.iter_mut().enumerate() {
        let depth = depths[i];
        debug!(
            %category, writer = i, assigned = state.assigned.len(), depth,
            over_count = state.over_count, messages = state.running_count,
            "Writer load"
        );

        if depth * 4 > capacity * 3 {
            if state.over_count > allowed {
                if depths.len() < config.max_workers {
                    info!(
                        %category, writer = i, depth, workers = depths.len(),
                        "Writer over high watermark, adding writer"
                    );
                    state.over_count = 0;
                    return HealthAction::Grow;
                }
                info!(
                    %category, writer = i, depth, workers = depths.len(),
                    "Writer over high watermark, running max writers"
                );
            } else {
                state.over_count += 1;
                info!(
                    %category, writer = i, depth, over_count = state.over_count,
                    "Writer over high watermark"
                );
            }
        } else if depth * 5 < capacity {
            state.over_count = 0;
            below += 1;
        }
    }

    if below == depths.len() && depths.len() > 1 && shrink_due {
        return HealthAction::Shrink;
    }
    HealthAction::Hold
}

/// Workers of one category
pub struct CategoryPool {
    category: Category,
    workers: Vec<PoolWorker>,
    last_resize: Instant,
    last_rebalance: Instant,
}

impl CategoryPool {
    pub fn category(&self) -> Category {
        self.category
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn queue_depth(&self) -> usize {
        self.workers.iter().map(|w| w.handle.depth()).sum()
    }

    /// Id of the worker that currently owns `key`
    pub fn worker_for_key(&self, key: &str) -> Option<usize> {
        self.workers
            .iter()
            .find(|w| w.state.assigned.contains(key))
            .map(|w| w.handle.id())
    }

    pub fn worker_ids(&self) -> Vec<usize> {
        self.workers.iter().map(|w| w.handle.id()).collect()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state.clone()).collect()
    }

    /// Pick the worker for `key`, assigning it if the key is new
    fn route(&mut self, key: &str, queue_size: usize) -> usize {
        if let Some(i) = self
            .workers
            .iter()
            .position(|w| w.state.assigned.contains(key))
        {
            self.workers[i].state.running_count += 1;
            return i;
        }

        let mid = queue_size / 2;
        let mut best = 0;
        for i in 0..self.workers.len() {
            if self.workers[i].state.assigned.is_empty() {
                self.workers[i].state.running_count = 0;
            }
            if i == 0 {
                continue;
            }

            let cand = &self.workers[i];
            let cur = &self.workers[best];
            let (cand_keys, cur_keys) = (cand.state.assigned.len(), cur.state.assigned.len());
            let (cand_depth, cur_depth) = (cand.handle.depth(), cur.handle.depth());

            let better = if cand_keys != cur_keys {
                cand_keys < cur_keys
            } else if cand_depth < mid && cur_depth > mid {
                true
            } else if cur_depth < mid && cand_depth > mid {
                false
            } else {
                cand.state.running_count < cur.state.running_count
            };

            if better {
                best = i;
            }
        }

        let worker = &mut self.workers[best];
        worker.state.assigned.insert(key.to_string());
        worker.state.running_count += 1;
        best
    }
}

/// Writer pools for every category
pub struct WriterPool {
    pools: Vec<CategoryPool>,
    connector: Arc<dyn StorageConnector>,
    config: PoolConfig,
    next_id: usize,
}

impl std::fmt::Debug for WriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("WriterPool");
        for pool in &self.pools {
            s.field(pool.category.as_str(), &pool.len());
        }
        s.finish()
    }
}

/// Location of a worker within the pool, valid until the next pool change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerSlot {
    pub category: Category,
    pub index: usize,
}

impl WriterPool {
    /// Start `max_workers` writers for every category
    pub fn new(connector: Arc<dyn StorageConnector>, config: PoolConfig) -> Self {
        let now = Instant::now();
        let mut pool = Self {
            pools: Vec::with_capacity(Category::ALL.len()),
            connector,
            config,
            next_id: 0,
        };

        for category in Category::ALL {
            let mut workers = Vec::with_capacity(pool.config.max_workers);
            for _ in 0..pool.config.max_workers.max(1) {
                workers.push(pool.spawn_worker());
            }
            pool.pools.push(CategoryPool {
                category,
                workers,
                last_resize: now,
                last_rebalance: now,
            });
        }
        pool
    }

    fn spawn_worker(&mut self) -> PoolWorker {
        let id = self.next_id;
        self.next_id += 1;
        let db = StorageHandler::new(self.connector.open());
        PoolWorker {
            handle: WriterWorker::spawn(id, db, self.config.writer.clone(), self.config.queue_size),
            state: WorkerState::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn category(&self, category: Category) -> &CategoryPool {
        &self.pools[category_index(category)]
    }

    fn category_mut(&mut self, category: Category) -> &mut CategoryPool {
        &mut self.pools[category_index(category)]
    }

    /// Requests waiting across every worker queue
    pub fn queue_depth(&self) -> usize {
        self.pools.iter().map(CategoryPool::queue_depth).sum()
    }

    /// Sticky routing decision for a request
    pub fn route(&mut self, req: &WriteRequest) -> WorkerSlot {
        let queue_size = self.config.queue_size;
        let index = self.category_mut(req.category).route(&req.routing_key, queue_size);
        WorkerSlot {
            category: req.category,
            index,
        }
    }

    /// Offer a request to a routed worker; a full or dead queue hands it back
    pub fn try_send(&self, slot: WorkerSlot, req: WriteRequest) -> Result<(), WriteRequest> {
        match self.category(slot.category).workers.get(slot.index) {
            Some(worker) => worker.handle.try_send(req),
            None => Err(req),
        }
    }

    /// Periodic health check across every category
    pub async fn check_health<K: KeepAlive + ?Sized>(&mut self, keepalive: &mut K) {
        for category in Category::ALL {
            self.replace_dead_workers(category);

            let now = Instant::now();
            let config = self.config.clone();
            let pool = self.category_mut(category);

            let rebalance_due = now.duration_since(pool.last_rebalance) >= config.rebalance_cooldown;
            if rebalance_due {
                pool.last_rebalance = now;
            }
            let shrink_due = now.duration_since(pool.last_resize) >= config.scale_back_cooldown;

            let depths: Vec<usize> = pool.workers.iter().map(|w| w.handle.depth()).collect();
            let mut states: Vec<WorkerState> =
                pool.workers.iter_mut().map(|w| std::mem::take(&mut w.state)).collect();
            let action = assess(
                category,
                &mut states,
                &depths,
                config.queue_size,
                &config,
                rebalance_due,
                shrink_due,
            );
            for (worker, state) in pool.workers.iter_mut().zip(states) {
                worker.state = state;
            }

            match action {
                HealthAction::Rebalance(hot) => {
                    info!(%category, workers = hot.len(), "Rebalancing writers");
                    for i in hot {
                        self.drain_and_reset(category, i, keepalive).await;
                    }
                }
                HealthAction::Grow => self.grow(category, keepalive).await,
                HealthAction::Shrink => self.shrink(category, keepalive).await,
                HealthAction::Hold => {}
            }
        }
    }

    fn replace_dead_workers(&mut self, category: Category) {
        let dead: Vec<usize> = self
            .category(category)
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.handle.is_closed())
            .map(|(i, _)| i)
            .collect();

        for i in dead {
            let replacement = self.spawn_worker();
            let pool = self.category_mut(category);
            warn!(
                %category,
                writer = pool.workers[i].handle.id(),
                replacement = replacement.handle.id(),
                "Writer task exited, replacing"
            );
            pool.workers[i] = replacement;
        }
    }

    /// Wait until a worker's queue is empty, then clear its routing state
    async fn drain_and_reset<K: KeepAlive + ?Sized>(
        &mut self,
        category: Category,
        index: usize,
        keepalive: &mut K,
    ) {
        let Some(worker) = self.category(category).workers.get(index) else {
            return;
        };
        info!(%category, writer = worker.handle.id(), depth = worker.handle.depth(), "Resetting writer, draining queue");

        let mut steps = 0u32;
        loop {
            let Some(worker) = self.category(category).workers.get(index) else {
                return;
            };
            if worker.handle.depth() == 0 || worker.handle.is_closed() {
                break;
            }
            steps += 1;
            if steps >= KEEPALIVE_EVERY {
                steps = 0;
                keepalive.keep_alive().await;
                info!(%category, depth = worker.handle.depth(), "... draining writer queue");
            }
            tokio::time::sleep(DRAIN_STEP).await;
        }

        if let Some(worker) = self.category_mut(category).workers.get_mut(index) {
            worker.state.reset();
        }
    }

    async fn reset_all<K: KeepAlive + ?Sized>(&mut self, category: Category, keepalive: &mut K) {
        info!(%category, "Draining queues to reset writers");
        for i in 0..self.category(category).len() {
            self.drain_and_reset(category, i, keepalive).await;
        }
    }

    async fn grow<K: KeepAlive + ?Sized>(&mut self, category: Category, keepalive: &mut K) {
        if self.category(category).len() >= self.config.max_workers {
            return;
        }
        info!(%category, "Adding writer");
        self.reset_all(category, keepalive).await;

        let worker = self.spawn_worker();
        let pool = self.category_mut(category);
        pool.workers.push(worker);
        pool.last_resize = Instant::now();
        info!(%category, workers = pool.len(), "Added writer");
    }

    async fn shrink<K: KeepAlive + ?Sized>(&mut self, category: Category, keepalive: &mut K) {
        let len = self.category(category).len();
        if len <= 1 {
            return;
        }
        let victim = len - 1;
        info!(%category, "Removing writer");
        self.drain_and_reset(category, victim, keepalive).await;

        let pool = self.category_mut(category);
        pool.last_resize = Instant::now();
        if let Some(worker) = pool.workers.pop() {
            worker.handle.shutdown().await;
        }
        info!(%category, workers = self.category(category).len(), "Removed writer");
    }

    /// Drain every queue, then stop and join every worker
    pub async fn shutdown<K: KeepAlive + ?Sized>(&mut self, keepalive: &mut K) {
        for category in Category::ALL {
            self.reset_all(category, keepalive).await;
            info!(%category, "Shutting down writers");
            let workers = std::mem::take(&mut self.category_mut(category).workers);
            for worker in workers {
                worker.handle.shutdown().await;
            }
        }
    }
}

fn category_index(category: Category) -> usize {
    match category {
        Category::Default => 0,
        Category::HighVolumeAttribute => 1,
    }
}
