//! Router connection tracking
//!
//! Counts open connections per router so that a reconnect marks the
//! router's peers down only when no other connection is still live.

use crate::corrections::{ACTION_FIELD, HASH_FIELD, TIMESTAMP_FIELD};
use crate::generator::{Record, field_text, quote};
use bmpsink_storage::Row;
use std::collections::HashMap;
use tracing::{debug, info};

/// Query used to rebuild the tracker from storage
pub const REFRESH_QUERY: &str =
    "SELECT name, hash_id::text AS hash_id, state::text AS state FROM routers";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterEntry {
    pub connection_count: u32,
}

#[derive(Debug, Default)]
pub struct RouterTracker {
    routers: HashMap<String, RouterEntry>,
}

fn normalize(hash: &str) -> String {
    hash.replace('-', "")
}

impl RouterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn connection_count(&self, hash: &str) -> u32 {
        self.routers
            .get(&normalize(hash))
            .map_or(0, |r| r.connection_count)
    }

    /// Rebuild from `name, hash_id, state` rows. An empty result leaves the
    /// current state in place.
    pub fn refresh(&mut self, rows: &[Row]) {
        if rows.is_empty() {
            return;
        }

        self.routers.clear();
        for row in rows {
            let Some(hash) = row.get("hash_id") else {
                continue;
            };
            let state = row.get("state").map_or("", String::as_str);
            info!(
                router = row.get("name").map_or("", String::as_str),
                hash = %normalize(hash),
                state,
                "Updating router state"
            );
            let connection_count = u32::from(state == "up");
            self.routers
                .insert(normalize(hash), RouterEntry { connection_count });
        }
    }

    /// Apply router events, returning the corrective statements to run.
    ///
    /// An `init` or `first` event on a router without live connections marks
    /// its peers down as of the event time; `term` releases a connection.
    pub fn apply(&mut self, records: &[Record]) -> Vec<String> {
        let mut statements = Vec::new();

        for record in records {
            let Some(hash) = field_text(record, HASH_FIELD) else {
                continue;
            };
            let action = field_text(record, ACTION_FIELD).unwrap_or_default();
            let entry = self.routers.entry(normalize(&hash)).or_default();

            if action.eq_ignore_ascii_case("init") || action.eq_ignore_ascii_case("first") {
                if entry.connection_count == 0 {
                    let timestamp = field_text(record, TIMESTAMP_FIELD).unwrap_or_default();
                    statements.push(format!(
                        "UPDATE bgp_peers SET state = 'down' WHERE router_hash_id = {} AND timestamp < {}",
                        quote(&hash),
                        quote(&timestamp)
                    ));
                }
                entry.connection_count += 1;
            } else if action.eq_ignore_ascii_case("term") {
                entry.connection_count = entry.connection_count.saturating_sub(1);
            }
            debug!(router = %hash, action, connections = entry.connection_count, "Router event");
        }

        statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::decode_records;

    fn event(hash: &str, action: &str) -> Vec<Record> {
        decode_records(&format!(
            r#"[{{"hash_id": "{hash}", "action": "{action}", "timestamp": "2024-05-01 10:00:00"}}]"#
        ))
        .unwrap()
    }

    #[test]
    fn test_first_init_marks_peers_down_once() {
        let mut tracker = RouterTracker::new();

        let statements = tracker.apply(&event("r1", "init"));
        assert_eq!(
            statements,
            vec!["UPDATE bgp_peers SET state = 'down' WHERE router_hash_id = 'r1' AND timestamp < '2024-05-01 10:00:00'"]
        );
        assert_eq!(tracker.connection_count("r1"), 1);

        assert!(tracker.apply(&event("r1", "init")).is_empty());
        assert_eq!(tracker.connection_count("r1"), 2);
    }

    #[test]
    fn test_term_floors_at_zero() {
        let mut tracker = RouterTracker::new();
        tracker.apply(&event("r1", "first"));
        tracker.apply(&event("r1", "term"));
        tracker.apply(&event("r1", "term"));
        assert_eq!(tracker.connection_count("r1"), 0);

        // with no live connection the next init corrects again
        assert_eq!(tracker.apply(&event("r1", "init")).len(), 1);
    }

    #[test]
    fn test_refresh_from_rows() {
        let mut tracker = RouterTracker::new();
        tracker.apply(&event("stale", "init"));

        let row = |name: &str, hash: &str, state: &str| -> Row {
            [("name", name), ("hash_id", hash), ("state", state)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        tracker.refresh(&[
            row("edge1", "0a1b2c3d-0000-0000-0000-000000000001", "up"),
            row("edge2", "0a1b2c3d-0000-0000-0000-000000000002", "down"),
        ]);

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.connection_count("stale"), 0);
        assert_eq!(tracker.connection_count("0a1b2c3d000000000000000000000001"), 1);
        assert_eq!(tracker.connection_count("0a1b2c3d-0000-0000-0000-000000000002"), 0);

        // a router already up does not get its peers reset
        assert!(tracker.apply(&event("0a1b2c3d000000000000000000000001", "init")).is_empty());

        tracker.refresh(&[]);
        assert_eq!(tracker.len(), 2);
    }
}
