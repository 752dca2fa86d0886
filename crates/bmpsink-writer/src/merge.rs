//! Merge buffer
//!
//! Groups buffered values by statement template and collapses repeated
//! updates to the same record into the latest value.

use bmpsink_common::WriteRequest;
use indexmap::IndexMap;

type GroupKey = (String, String);

#[derive(Debug, Default)]
pub struct MergeBuffer {
    groups: IndexMap<GroupKey, IndexMap<String, String>>,
    records: usize,
}

impl MergeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request's values, replacing earlier values for the same record
    pub fn merge(&mut self, req: WriteRequest) {
        let group = self
            .groups
            .entry((req.statement_prefix, req.statement_suffix))
            .or_default();

        for (identity, value) in req.values {
            if group.insert(identity, value).is_none() {
                self.records += 1;
            }
        }
    }

    /// Distinct records currently buffered across all groups
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Empty the buffer into one multi-row statement per group, in the order
    /// the groups were first seen
    pub fn take_statements(&mut self) -> Vec<String> {
        self.records = 0;
        self.groups
            .drain(..)
            .filter(|(_, values)| !values.is_empty())
            .map(|((prefix, suffix), values)| {
                let mut sql = prefix;
                for (i, value) in values.values().enumerate() {
                    if i > 0 {
                        sql.push(',');
                    }
                    sql.push_str(value);
                }
                sql.push_str(&suffix);
                sql
            })
            .collect()
    }
}
