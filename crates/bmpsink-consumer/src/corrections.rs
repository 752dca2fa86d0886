//! Corrective statements for collector and peer events
//!
//! These run inline right after the event's own statement so that batched
//! data arriving later sees a consistent router and peer state.

use crate::generator::{Record, field_text, quote};

/// Field carrying the entity hash in collector, router and peer rows
pub const HASH_FIELD: &str = "hash_id";
pub const ACTION_FIELD: &str = "action";
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A collector that (re)started or stopped has no live routers
pub fn collector_updates(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter(|r| {
            field_text(r, ACTION_FIELD).is_some_and(|a| {
                a.eq_ignore_ascii_case("started") || a.eq_ignore_ascii_case("stopped")
            })
        })
        .filter_map(|r| field_text(r, HASH_FIELD))
        .map(|hash| {
            format!(
                "UPDATE routers SET state = 'down' WHERE collector_hash_id = {}",
                quote(&hash)
            )
        })
        .collect()
}

/// Drop RIB entries a peer learned before its latest state change
pub fn peer_rib_updates(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| Some((field_text(r, HASH_FIELD)?, field_text(r, TIMESTAMP_FIELD)?)))
        .map(|(hash, timestamp)| {
            format!(
                "DELETE FROM ip_rib WHERE peer_hash_id = {} AND timestamp < {}",
                quote(&hash),
                quote(&timestamp)
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::decode_records;

    #[test]
    fn test_collector_updates() {
        let records = decode_records(
            r#"[{"hash_id": "c1", "action": "started"},
                {"hash_id": "c2", "action": "heartbeat"},
                {"hash_id": "c3", "action": "STOPPED"}]"#,
        )
        .unwrap();
        assert_eq!(
            collector_updates(&records),
            vec![
                "UPDATE routers SET state = 'down' WHERE collector_hash_id = 'c1'",
                "UPDATE routers SET state = 'down' WHERE collector_hash_id = 'c3'",
            ]
        );
    }

    #[test]
    fn test_peer_rib_updates() {
        let records = decode_records(
            r#"[{"hash_id": "p1", "timestamp": "2024-01-01 00:00:00"}, {"hash_id": "p2"}]"#,
        )
        .unwrap();
        assert_eq!(
            peer_rib_updates(&records),
            vec!["DELETE FROM ip_rib WHERE peer_hash_id = 'p1' AND timestamp < '2024-01-01 00:00:00'"]
        );
    }
}
