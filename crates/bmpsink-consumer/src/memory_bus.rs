//! In-memory bus
//!
//! Serves scripted batches of records and counts every flow-control call,
//! for tests of the ingestion loop. Records on topics outside the current
//! subscription stay queued until a later subscription matches them.

use crate::bus::{BusConsumer, BusRecord};
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Flow-control calls seen by a [`MemoryBus`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BusCounters {
    pub polls: usize,
    pub pauses: usize,
    pub resumes: usize,
    pub heartbeats: usize,
    pub commits: usize,
    pub subscriptions: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
struct BusState {
    batches: VecDeque<Vec<BusRecord>>,
    subscription: Option<Regex>,
    paused: bool,
    poll_failure: Option<BusError>,
    counters: BusCounters,
}

/// Shared scripted bus; clones observe the same state
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBus")
            .field("batches", &state.batches.len())
            .field("paused", &state.paused)
            .finish()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue records to be returned together by one poll
    pub fn push_batch(&self, records: Vec<BusRecord>) {
        self.state.lock().batches.push_back(records);
    }

    /// Make the next poll fail
    pub fn fail_next_poll(&self, err: BusError) {
        self.state.lock().poll_failure = Some(err);
    }

    pub fn counters(&self) -> BusCounters {
        self.state.lock().counters.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().batches.iter().map(Vec::len).sum()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn take_matching(state: &mut BusState) -> Vec<BusRecord> {
        let Some(pattern) = state.subscription.clone() else {
            return Vec::new();
        };
        let matches = |topic: &str| {
            pattern
                .find(topic)
                .is_some_and(|m| m.start() == 0 && m.end() == topic.len())
        };

        let mut i = 0;
        while i < state.batches.len() {
            let batch = std::mem::take(&mut state.batches[i]);
            let (matched, rest): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|r| matches(&r.topic));
            if rest.is_empty() {
                state.batches.remove(i);
            } else {
                state.batches[i] = rest;
                i += 1;
            }
            if !matched.is_empty() {
                return matched;
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl BusConsumer for MemoryBus {
    async fn subscribe(&mut self, pattern: &Regex) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.counters.closed {
            return Err(BusError::Closed);
        }
        state.counters.subscriptions.push(pattern.as_str().to_string());
        state.subscription = Some(pattern.clone());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        let records = {
            let mut state = self.state.lock();
            if state.counters.closed {
                return Err(BusError::Closed);
            }
            state.counters.polls += 1;
            if let Some(err) = state.poll_failure.take() {
                return Err(err);
            }
            if state.paused {
                Vec::new()
            } else {
                Self::take_matching(&mut state)
            }
        };

        if records.is_empty() && !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
        }
        Ok(records)
    }

    async fn pause(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.paused = true;
        state.counters.pauses += 1;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state.paused = false;
        state.counters.resumes += 1;
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), BusError> {
        self.state.lock().counters.heartbeats += 1;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BusError> {
        self.state.lock().counters.commits += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().counters.closed = true;
    }
}
