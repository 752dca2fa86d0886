//! Statement generation
//!
//! [`StatementGenerator`] turns a decoded record batch into the pieces of a
//! multi-row insert: the statement text around the values list, and one
//! value fragment per record keyed by record identity.
//!
//! [`TableStatementGenerator`] is driven by the `[[tables]]` configuration.
//! Payloads are JSON, either an array of row objects or an object with a
//! `rows` array whose sibling scalar fields apply to every row.

use crate::error::GeneratorError;
use bmpsink_common::{ColumnSpec, RecordKind, TableConfig};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One decoded record, field name to value
pub type Record = Map<String, Value>;

pub trait StatementGenerator: Send + Sync {
    /// Decode a payload into records
    fn decode(&self, kind: RecordKind, payload: &str) -> Result<Vec<Record>, GeneratorError>;

    /// Statement text before and after the values list, `None` if the kind
    /// is not stored
    fn insert_statement(&self, kind: RecordKind) -> Option<(String, String)>;

    /// Value fragment per record identity, in record order. A later record
    /// with the same identity replaces the earlier one.
    fn values_statement(&self, kind: RecordKind, records: &[Record]) -> IndexMap<String, String>;
}

#[derive(Debug, Clone)]
struct TableMapping {
    prefix: String,
    suffix: String,
    columns: Vec<ColumnSpec>,
    identity: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TableStatementGenerator {
    tables: HashMap<RecordKind, TableMapping>,
}

impl TableStatementGenerator {
    pub fn new(tables: &[TableConfig]) -> Self {
        let tables = tables
            .iter()
            .map(|t| {
                (
                    t.kind,
                    TableMapping {
                        prefix: t.statement_prefix(),
                        suffix: t.suffix.clone(),
                        columns: t.column_specs(),
                        identity: t.identity.clone(),
                    },
                )
            })
            .collect();
        Self { tables }
    }
}

impl StatementGenerator for TableStatementGenerator {
    fn decode(&self, _kind: RecordKind, payload: &str) -> Result<Vec<Record>, GeneratorError> {
        decode_records(payload)
    }

    fn insert_statement(&self, kind: RecordKind) -> Option<(String, String)> {
        self.tables
            .get(&kind)
            .map(|t| (t.prefix.clone(), t.suffix.clone()))
    }

    fn values_statement(&self, kind: RecordKind, records: &[Record]) -> IndexMap<String, String> {
        let Some(table) = self.tables.get(&kind) else {
            return IndexMap::new();
        };

        let mut values = IndexMap::with_capacity(records.len());
        for record in records {
            let mut fragment = String::from("(");
            for (i, column) in table.columns.iter().enumerate() {
                if i > 0 {
                    fragment.push(',');
                }
                fragment.push_str(&sql_literal(record.get(&column.name)));
                if let Some(cast) = &column.cast {
                    fragment.push_str("::");
                    fragment.push_str(cast);
                }
            }
            fragment.push(')');

            let identity = if table.identity.is_empty() {
                fragment.clone()
            } else {
                table
                    .identity
                    .iter()
                    .map(|name| field_text(record, name).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("|")
            };
            values.insert(identity, fragment);
        }
        values
    }
}

/// Decode a JSON payload into records
pub fn decode_records(payload: &str) -> Result<Vec<Record>, GeneratorError> {
    match serde_json::from_str::<Value>(payload)? {
        Value::Array(items) => items.into_iter().map(into_record).collect(),
        Value::Object(mut object) => match object.remove("rows") {
            Some(Value::Array(items)) => {
                let inherited: Vec<(String, Value)> = object
                    .into_iter()
                    .filter(|(_, v)| !v.is_array() && !v.is_object())
                    .collect();
                items
                    .into_iter()
                    .map(|item| {
                        let mut record = into_record(item)?;
                        for (name, value) in &inherited {
                            if !record.contains_key(name) {
                                record.insert(name.clone(), value.clone());
                            }
                        }
                        Ok(record)
                    })
                    .collect()
            }
            Some(_) => Err(GeneratorError::Payload("'rows' is not an array".to_string())),
            None => Ok(vec![object]),
        },
        other => Err(GeneratorError::Payload(format!(
            "expected an array or object, got {other}"
        ))),
    }
}

fn into_record(value: Value) -> Result<Record, GeneratorError> {
    match value {
        Value::Object(record) => Ok(record),
        other => Err(GeneratorError::Payload(format!("row is not an object: {other}"))),
    }
}

/// Field value as plain text, without SQL quoting
pub fn field_text(record: &Record, name: &str) -> Option<String> {
    match record.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Quote text as a SQL string literal
pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn sql_literal(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => quote(s),
        Some(other) => quote(&other.to_string()),
    }
}
