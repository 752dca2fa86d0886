//! Staged topic subscription
//!
//! Topic groups are added one at a time, with a delay in between, so that
//! records other groups depend on (collectors, then routers, then peers)
//! are consumed before the records that reference them. Each stage commits
//! and then replaces the subscription with the alternation of every group
//! so far.

use crate::bus::BusConsumer;
use crate::error::BusError;
use regex::Regex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug)]
pub struct TopicSubscriber {
    patterns: Vec<Regex>,
    subscribed: usize,
    combined: String,
    delay: Duration,
    last_subscribe: Option<Instant>,
}

impl TopicSubscriber {
    pub fn new(patterns: Vec<Regex>, delay: Duration) -> Self {
        Self {
            patterns,
            subscribed: 0,
            combined: String::new(),
            delay,
            last_subscribe: None,
        }
    }

    pub fn all_subscribed(&self) -> bool {
        self.subscribed >= self.patterns.len()
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed
    }

    /// Subscribe the next group if its delay has passed.
    ///
    /// Returns whether the subscription changed.
    pub async fn step(&mut self, bus: &mut dyn BusConsumer) -> Result<bool, BusError> {
        if self.all_subscribed() {
            return Ok(false);
        }
        if self
            .last_subscribe
            .is_some_and(|last| last.elapsed() < self.delay)
        {
            return Ok(false);
        }

        bus.commit().await?;

        let next = &self.patterns[self.subscribed];
        let mut combined = self.combined.clone();
        if self.subscribed > 0 {
            combined.push('|');
        }
        combined.push('(');
        combined.push_str(next.as_str());
        combined.push(')');

        let regex = Regex::new(&combined).map_err(|e| BusError::Subscribe(e.to_string()))?;
        bus.subscribe(&regex).await?;

        info!(topic = next.as_str(), "Subscribed to topic");
        debug!(pattern = %combined, "Topics regex pattern");

        self.combined = combined;
        self.subscribed += 1;
        self.last_subscribe = Some(Instant::now());
        Ok(true)
    }
}
