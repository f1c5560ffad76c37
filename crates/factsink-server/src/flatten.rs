//! Shape inference: turn one fact into a candidate table and a flat row
//!
//! Implement [`ShapeInference`] to plug in custom flattening or typing rules.
//! [`JsonFlattener`] is the default: nested objects become `parent_child`
//! columns and each leaf value is tagged with a [`ColumnType`].

use factsink_common::Fact;
use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::schema::{ColumnType, Columns, Table};

/// Infers the destination shape of a fact
pub trait ShapeInference: Send + Sync {
    /// Returns the candidate table and the flattened fact to insert
    ///
    /// A candidate that does not exist means the fact has nothing to store.
    fn infer(&self, fact: &Fact) -> Result<(Table, Fact), SchemaError>;
}

/// How the destination table of a fact is named
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableNameSource {
    /// Every fact goes to one table
    Fixed(String),
    /// Use a top-level string field, or `fallback` when it is missing
    Field { field: String, fallback: String },
}

impl TableNameSource {
    fn resolve(&self, fact: &Fact) -> Result<String, SchemaError> {
        let raw = match self {
            TableNameSource::Fixed(name) => name.as_str(),
            TableNameSource::Field { field, fallback } => match fact.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => s.as_str(),
                _ => fallback.as_str(),
            },
        };

        let name = sanitize(raw);
        if name.trim_matches('_').is_empty() {
            return Err(SchemaError::TableName(format!(
                "'{}' does not contain any usable characters",
                raw
            )));
        }
        Ok(name)
    }
}

/// Default flattener for JSON facts
#[derive(Debug, Clone)]
pub struct JsonFlattener {
    table_name: TableNameSource,
}

impl JsonFlattener {
    pub fn new(table_name: TableNameSource) -> Self {
        Self { table_name }
    }

    /// Every fact lands in `name`
    pub fn fixed(name: impl Into<String>) -> Self {
        Self::new(TableNameSource::Fixed(name.into()))
    }

    fn flatten_into(
        &self,
        table: &str,
        prefix: &str,
        object: &Map<String, Value>,
        columns: &mut Columns,
        row: &mut Map<String, Value>,
    ) -> Result<(), SchemaError> {
        for (key, value) in object {
            let key = sanitize(key);
            let column = if prefix.is_empty() {
                key
            } else {
                format!("{}_{}", prefix, key)
            };

            if let Value::Object(nested) = value {
                self.flatten_into(table, &column, nested, columns, row)?;
                continue;
            }

            let Some(column_type) = infer_type(value) else {
                continue;
            };

            if columns.insert(column.clone(), column_type).is_some() {
                return Err(SchemaError::ColumnCollision {
                    table: table.to_string(),
                    column,
                });
            }
            row.insert(column, value.clone());
        }
        Ok(())
    }
}

impl ShapeInference for JsonFlattener {
    fn infer(&self, fact: &Fact) -> Result<(Table, Fact), SchemaError> {
        let name = self.table_name.resolve(fact)?;

        let mut columns = Columns::new();
        let mut row = Map::new();
        self.flatten_into(&name, "", fact.as_map(), &mut columns, &mut row)?;

        let table = if columns.is_empty() {
            Table::absent(name)
        } else {
            Table::new(name, columns)
        };
        Ok((table, Fact::from(row)))
    }
}

/// Type tag for a leaf value; `None` for nulls, which carry no shape
fn infer_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null | Value::Object(_) => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Number(n) if n.as_i64().is_some() => Some(ColumnType::Integer),
        Value::Number(_) => Some(ColumnType::Float),
        Value::String(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => {
            Some(ColumnType::Timestamp)
        },
        Value::String(_) => Some(ColumnType::Text),
        Value::Array(_) => Some(ColumnType::Json),
    }
}

/// Lowercase and replace anything outside `[a-z0-9_]` with `_`
fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
