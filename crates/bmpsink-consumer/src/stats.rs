//! Per-instance counters
//!
//! Written by the ingestion loop, read by the supervisor for the periodic
//! stats log line.

use bmpsink_common::RecordKind;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct ConsumerStats {
    messages: AtomicU64,
    per_kind: [AtomicU64; RecordKind::ALL.len()],
    handoff_depth: AtomicUsize,
    writer_depth: AtomicUsize,
    /// Millis since the epoch, 0 when no collector record was seen
    last_collector_msg: AtomicI64,
    running: AtomicBool,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages: u64,
    pub per_kind: [u64; RecordKind::ALL.len()],
    pub handoff_depth: usize,
    pub writer_depth: usize,
    pub last_collector_msg: Option<DateTime<Utc>>,
    pub running: bool,
}

impl StatsSnapshot {
    pub fn kind_count(&self, kind: RecordKind) -> u64 {
        self.per_kind[kind.index()]
    }
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one bus message of `kind`, however many rows it carries
    pub fn record_kind(&self, kind: RecordKind) {
        self.per_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
        if kind == RecordKind::Collector {
            self.last_collector_msg
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    pub fn set_depths(&self, handoff: usize, writers: usize) {
        self.handoff_depth.store(handoff, Ordering::Relaxed);
        self.writer_depth.store(writers, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last = self.last_collector_msg.load(Ordering::Relaxed);
        StatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            per_kind: std::array::from_fn(|i| self.per_kind[i].load(Ordering::Relaxed)),
            handoff_depth: self.handoff_depth.load(Ordering::Relaxed),
            writer_depth: self.writer_depth.load(Ordering::Relaxed),
            last_collector_msg: (last > 0)
                .then(|| Utc.timestamp_millis_opt(last).single())
                .flatten(),
            running: self.is_running(),
        }
    }

    pub fn log_stats(&self, instance: usize) {
        let s = self.snapshot();
        info!(
            "-- STATS --   thread: {instance}  read: {:<10}  consumer_queue: {:<10} writer_queues: {:<10}",
            s.messages, s.handoff_depth, s.writer_depth
        );
        for kind in RecordKind::ALL {
            info!("        {:<16} : {}", kind.as_str(), s.kind_count(kind));
        }
        if let Some(last) = s.last_collector_msg {
            info!("        last collector message : {}", last.to_rfc3339());
        }
    }
}
