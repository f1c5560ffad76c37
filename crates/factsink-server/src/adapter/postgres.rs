//! PostgreSQL destination
//!
//! Tables live in one database schema. Column tags map to native types as
//! follows:
//!
//! | tag       | PostgreSQL         |
//! |-----------|--------------------|
//! | text      | `text`             |
//! | integer   | `bigint`           |
//! | float     | `double precision` |
//! | boolean   | `boolean`          |
//! | timestamp | `timestamptz`      |
//! | json      | `jsonb`            |
//!
//! On insert each value is converted to its column's type. A value that
//! cannot be converted fails the insert, so the fact is retried later.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use factsink_common::Fact;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use super::SinkAdapter;
use crate::config::DatabaseConfig;
use crate::error::AdapterError;
use crate::schema::{ColumnType, Columns, SchemaDiff, Table};

/// [`SinkAdapter`] writing to PostgreSQL tables
#[derive(Clone)]
pub struct PostgresAdapter {
    pool: PgPool,
    schema: String,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Build a connection pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AdapterError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(schema = %config.schema, "Database connection pool established");
        Ok(Self::new(pool, config.schema.clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

#[async_trait]
impl SinkAdapter for PostgresAdapter {
    #[instrument(skip(self))]
    async fn get_schema(&self, table: &str) -> Result<Table, AdapterError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            let exists: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )
                "#,
            )
            .bind(&self.schema)
            .bind(table)
            .fetch_one(&self.pool)
            .await?;

            return Ok(if exists {
                Table::new(table, Columns::new())
            } else {
                Table::absent(table)
            });
        }

        let columns = rows
            .into_iter()
            .map(|(name, data_type)| (name, column_type_from_native(&data_type)))
            .collect();
        Ok(Table::new(table, columns))
    }

    async fn create_destination(&self) -> Result<(), AdapterError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, table), fields(table = %table.name()))]
    async fn create_table(&self, table: &Table) -> Result<(), AdapterError> {
        let sql = create_table_sql(&self.schema, table);
        debug!(sql = %sql, "Creating table");
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, diff), fields(table = %diff.table()))]
    async fn patch_table(&self, diff: &SchemaDiff) -> Result<(), AdapterError> {
        let mut tx = self.pool.begin().await?;
        for (column, column_type) in diff.columns() {
            let sql = add_column_sql(&self.schema, diff.table(), column, *column_type);
            debug!(sql = %sql, "Adding column");
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert(&self, table: &Table, fact: &Fact) -> Result<(), AdapterError> {
        let mut values = Vec::new();
        for (name, value) in fact.iter() {
            if value.is_null() {
                continue;
            }
            if let Some(column_type) = table.column(name) {
                values.push((name.as_str(), to_sql_value(name, column_type, value)?));
            }
        }
        if values.is_empty() {
            return Err(AdapterError::NothingToInsert(table.name().to_string()));
        }

        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (", self.qualified(table.name())));
        {
            let mut names = query.separated(", ");
            for (name, _) in &values {
                names.push(quote_ident(name));
            }
        }
        query.push(") VALUES (");
        {
            let mut binds = query.separated(", ");
            for (_, value) in values {
                value.bind(&mut binds);
            }
        }
        query.push(")");

        query.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.pool.close().await;
        Ok(())
    }
}

/// A fact value converted to its column's native type
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl SqlValue {
    fn bind(self, binds: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlValue::Text(v) => binds.push_bind(v),
            SqlValue::Integer(v) => binds.push_bind(v),
            SqlValue::Float(v) => binds.push_bind(v),
            SqlValue::Boolean(v) => binds.push_bind(v),
            SqlValue::Timestamp(v) => binds.push_bind(v),
            SqlValue::Json(v) => binds.push_bind(v),
        };
    }
}

fn to_sql_value(column: &str, column_type: ColumnType, value: &Value) -> Result<SqlValue, AdapterError> {
    let converted = match (column_type, value) {
        (ColumnType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (ColumnType::Text, other) => Some(SqlValue::Text(other.to_string())),

        (ColumnType::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64).map(|f| f as i64))
            .map(SqlValue::Integer),
        (ColumnType::Integer, Value::String(s)) => s.trim().parse().ok().map(SqlValue::Integer),

        (ColumnType::Float, Value::Number(n)) => n.as_f64().map(SqlValue::Float),
        (ColumnType::Float, Value::String(s)) => s.trim().parse().ok().map(SqlValue::Float),

        (ColumnType::Boolean, Value::Bool(b)) => Some(SqlValue::Boolean(*b)),
        (ColumnType::Boolean, Value::String(s)) => s.trim().parse().ok().map(SqlValue::Boolean),

        (ColumnType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| SqlValue::Timestamp(ts.with_timezone(&Utc))),

        (ColumnType::Json, other) => Some(SqlValue::Json(other.clone())),

        _ => None,
    };

    converted.ok_or_else(|| AdapterError::Conversion {
        column: column.to_string(),
        expected: native_type(column_type),
        value: value.to_string(),
    })
}

/// Double-quote an identifier, doubling embedded quotes
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn native_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "text",
        ColumnType::Integer => "bigint",
        ColumnType::Float => "double precision",
        ColumnType::Boolean => "boolean",
        ColumnType::Timestamp => "timestamptz",
        ColumnType::Json => "jsonb",
    }
}

/// Map an `information_schema.columns.data_type` back to a tag
pub(crate) fn column_type_from_native(data_type: &str) -> ColumnType {
    match data_type.to_ascii_lowercase().as_str() {
        "bigint" | "integer" | "smallint" => ColumnType::Integer,
        "double precision" | "real" | "numeric" => ColumnType::Float,
        "boolean" => ColumnType::Boolean,
        "json" | "jsonb" => ColumnType::Json,
        t if t.starts_with("timestamp") => ColumnType::Timestamp,
        _ => ColumnType::Text,
    }
}

pub(crate) fn create_table_sql(schema: &str, table: &Table) -> String {
    let columns: Vec<String> = table
        .columns()
        .iter()
        .map(|(name, column_type)| format!("{} {}", quote_ident(name), native_type(*column_type)))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quote_ident(schema),
        quote_ident(table.name()),
        columns.join(", ")
    )
}

pub(crate) fn add_column_sql(schema: &str, table: &str, column: &str, column_type: ColumnType) -> String {
    format!(
        "ALTER TABLE {}.{} ADD COLUMN IF NOT EXISTS {} {}",
        quote_ident(schema),
        quote_ident(table),
        quote_ident(column),
        native_type(column_type)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("events"), "\"events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_table_sql() {
        let table = Table::new("events", Columns::new())
            .with_column("user_id", ColumnType::Text)
            .with_column("ts", ColumnType::Timestamp);

        assert_eq!(
            create_table_sql("public", &table),
            r#"CREATE TABLE IF NOT EXISTS "public"."events" ("ts" timestamptz, "user_id" text)"#
        );
    }

    #[test]
    fn test_add_column_sql() {
        assert_eq!(
            add_column_sql("analytics", "events", "referrer", ColumnType::Text),
            r#"ALTER TABLE "analytics"."events" ADD COLUMN IF NOT EXISTS "referrer" text"#
        );
    }

    #[test]
    fn test_native_types_roundtrip() {
        for column_type in [
            ColumnType::Text,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Boolean,
            ColumnType::Json,
        ] {
            assert_eq!(column_type_from_native(native_type(column_type)), column_type);
        }
        assert_eq!(
            column_type_from_native("timestamp with time zone"),
            ColumnType::Timestamp
        );
        assert_eq!(column_type_from_native("character varying"), ColumnType::Text);
        assert_eq!(column_type_from_native("uuid"), ColumnType::Text);
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(
            to_sql_value("n", ColumnType::Integer, &json!(42)).unwrap(),
            SqlValue::Integer(42)
        );
        assert_eq!(
            to_sql_value("n", ColumnType::Integer, &json!(3.0)).unwrap(),
            SqlValue::Integer(3)
        );
        assert_eq!(
            to_sql_value("n", ColumnType::Float, &json!("2.5")).unwrap(),
            SqlValue::Float(2.5)
        );
        assert_eq!(
            to_sql_value("s", ColumnType::Text, &json!(17)).unwrap(),
            SqlValue::Text("17".into())
        );
        assert_eq!(
            to_sql_value("j", ColumnType::Json, &json!([1, 2])).unwrap(),
            SqlValue::Json(json!([1, 2]))
        );

        let ts = to_sql_value("ts", ColumnType::Timestamp, &json!("2024-01-01T02:00:00+02:00")).unwrap();
        assert_eq!(
            ts,
            SqlValue::Timestamp("2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn test_incompatible_value_is_an_error() {
        let err = to_sql_value("n", ColumnType::Integer, &json!("ads")).unwrap_err();
        match err {
            AdapterError::Conversion { column, expected, .. } => {
                assert_eq!(column, "n");
                assert_eq!(expected, "bigint");
            },
            other => panic!("unexpected error: {other}"),
        }

        assert!(to_sql_value("n", ColumnType::Integer, &json!(1.5)).is_err());
        assert!(to_sql_value("b", ColumnType::Boolean, &json!(1)).is_err());
        assert!(to_sql_value("ts", ColumnType::Timestamp, &json!(1_700_000_000)).is_err());
    }
}
