//! Shared types for the ingestion pipeline
//!
//! Record kinds as they arrive on the bus, the work categories that own
//! independent writer pools, and the write request that flows from the
//! ingestion loop to a writer worker.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic prefix used by the parsed feed
pub const TOPIC_PREFIX: &str = "openbmp.parsed.";

/// Work class with its own independent writer pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Everything that is not attribute data
    Default,
    /// Path attributes, which dominate volume on a busy feed
    HighVolumeAttribute,
}

impl Category {
    /// All categories, in pool creation order
    pub const ALL: [Category; 2] = [Category::Default, Category::HighVolumeAttribute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Default => "default",
            Category::HighVolumeAttribute => "attribute",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a parsed record on the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Collector,
    Router,
    Peer,
    BaseAttribute,
    UnicastPrefix,
    #[serde(rename = "l3vpn")]
    L3Vpn,
    BmpStat,
    LsNode,
    LsLink,
    LsPrefix,
}

impl RecordKind {
    pub const ALL: [RecordKind; 10] = [
        RecordKind::Collector,
        RecordKind::Router,
        RecordKind::Peer,
        RecordKind::BaseAttribute,
        RecordKind::UnicastPrefix,
        RecordKind::L3Vpn,
        RecordKind::BmpStat,
        RecordKind::LsNode,
        RecordKind::LsLink,
        RecordKind::LsPrefix,
    ];

    /// Name used both as content-type tag and as topic suffix
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Collector => "collector",
            RecordKind::Router => "router",
            RecordKind::Peer => "peer",
            RecordKind::BaseAttribute => "base_attribute",
            RecordKind::UnicastPrefix => "unicast_prefix",
            RecordKind::L3Vpn => "l3vpn",
            RecordKind::BmpStat => "bmp_stat",
            RecordKind::LsNode => "ls_node",
            RecordKind::LsLink => "ls_link",
            RecordKind::LsPrefix => "ls_prefix",
        }
    }

    /// Position in [`RecordKind::ALL`], used to index per-kind counters
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Resolve a content-type tag, case-insensitive
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag))
    }

    /// Resolve an exact `openbmp.parsed.<kind>` topic name
    pub fn from_topic(topic: &str) -> Option<Self> {
        let name = topic.strip_prefix(TOPIC_PREFIX)?;
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Classify a record: the explicit tag wins, the topic is the fallback
    pub fn classify(content_type: Option<&str>, topic: &str) -> Option<Self> {
        content_type
            .and_then(Self::from_tag)
            .or_else(|| Self::from_topic(topic))
    }

    /// Writer pool category that receives batched records of this kind
    pub fn category(&self) -> Category {
        match self {
            RecordKind::BaseAttribute => Category::HighVolumeAttribute,
            _ => Category::Default,
        }
    }

    /// Kinds applied inline by the ingestion loop instead of being batched.
    ///
    /// Peer state and router-to-collector association must be in place before
    /// any batched prefix or attribute data that references them.
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self,
            RecordKind::Collector | RecordKind::Router | RecordKind::Peer
        )
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work handed from the ingestion loop to a writer.
///
/// `values` maps record identity to its value fragment. For a non-batchable
/// request the complete statement is carried in `statement_prefix` and
/// `values` is empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    /// Entity key used for sticky assignment
    pub routing_key: String,
    /// Pool that executes the request
    pub category: Category,
    /// Statement up to and including `VALUES`
    pub statement_prefix: String,
    /// Conflict clause or trailing text, may be empty
    pub statement_suffix: String,
    /// Record identity to value fragment, in arrival order
    pub values: IndexMap<String, String>,
    /// When false the worker runs the statement immediately
    pub batchable: bool,
}

impl WriteRequest {
    /// Create a batchable request
    pub fn new(
        routing_key: impl Into<String>,
        category: Category,
        statement_prefix: impl Into<String>,
        statement_suffix: impl Into<String>,
        values: IndexMap<String, String>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            category,
            statement_prefix: statement_prefix.into(),
            statement_suffix: statement_suffix.into(),
            values,
            batchable: true,
        }
    }

    /// Create a request that bypasses batching
    pub fn immediate(routing_key: impl Into<String>, category: Category, sql: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            category,
            statement_prefix: sql.into(),
            statement_suffix: String::new(),
            values: IndexMap::new(),
            batchable: false,
        }
    }

    /// Length of the largest single value fragment
    pub fn max_value_len(&self) -> usize {
        self.values.values().map(String::len).max().unwrap_or(0)
    }

    /// Render the request as one standalone statement
    pub fn to_sql(&self) -> String {
        let mut sql = String::with_capacity(
            self.statement_prefix.len()
                + self.statement_suffix.len()
                + self.values.values().map(|v| v.len() + 1).sum::<usize>(),
        );
        sql.push_str(&self.statement_prefix);
        for (i, value) in self.values.values().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(value);
        }
        sql.push_str(&self.statement_suffix);
        sql
    }
}
