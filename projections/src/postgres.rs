//! `PostgreSQL` storage for projections.
//!
//! # Overview
//!
//! [`PostgresProjectionStorage`] implements both storage traits of
//! `projector-core`:
//!
//! - [`ProjectionStorage`]: table provisioning, transactional batch apply with
//!   checkpoint compare-and-set, the writer lease, and reset for rebuilds
//! - [`ProjectionReader`]: single-column lookups used by reducers
//!
//! # Bookkeeping tables
//!
//! ```sql
//! CREATE TABLE projections.current_sequences (
//!     projection_name TEXT NOT NULL,
//!     instance_id TEXT NOT NULL,
//!     sequence BIGINT NOT NULL,
//!     event_date TIMESTAMPTZ NOT NULL,
//!     last_updated TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (projection_name, instance_id)
//! );
//!
//! CREATE TABLE projections.locks (
//!     projection_name TEXT PRIMARY KEY,
//!     locker_id TEXT NOT NULL,
//!     locked_until TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! # Separate databases
//!
//! Projections usually live in a different database than the event store:
//!
//! ```ignore
//! let events = PostgresEventStore::new("postgres://localhost/eventstore").await?;
//! let storage = PostgresProjectionStorage::connect("postgres://localhost/projections").await?;
//! ```

use projector_core::projection::{
    Batch, Checkpoint, ProjectionError, ProjectionReader, ProjectionStorage, Result,
    StorageFuture,
};
use projector_core::schema::{ColumnType, Table};
use projector_core::statement::{Column, Condition, Operation, Value};
use projector_core::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;

const BOOKKEEPING_DDL: [&str; 3] = [
    "CREATE SCHEMA IF NOT EXISTS projections",
    "CREATE TABLE IF NOT EXISTS projections.current_sequences (
        projection_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        event_date TIMESTAMPTZ NOT NULL,
        last_updated TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (projection_name, instance_id)
    )",
    "CREATE TABLE IF NOT EXISTS projections.locks (
        projection_name TEXT PRIMARY KEY,
        locker_id TEXT NOT NULL,
        locked_until TIMESTAMPTZ NOT NULL
    )",
];

/// PostgreSQL-backed projection storage.
#[derive(Clone, Debug)]
pub struct PostgresProjectionStorage {
    pool: PgPool,
}

impl PostgresProjectionStorage {
    /// Use an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the projection database.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the checkpoint and lease tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if provisioning fails.
    pub async fn ensure_bookkeeping(&self) -> Result<()> {
        for ddl in BOOKKEEPING_DDL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to provision: {e}")))?;
        }
        Ok(())
    }

    async fn advance_checkpoint(
        tx: &mut Transaction<'_, Postgres>,
        batch: &Batch,
        next: Checkpoint,
    ) -> Result<()> {
        let sequence = to_bigint(next.sequence);
        let written = match batch.previous {
            None => sqlx::query(
                "INSERT INTO projections.current_sequences
                    (projection_name, instance_id, sequence, event_date, last_updated)
                 VALUES ($1, $2, $3, $4, now())
                 ON CONFLICT (projection_name, instance_id) DO NOTHING",
            )
            .bind(batch.projection)
            .bind(&batch.instance_id)
            .bind(sequence)
            .bind(next.timestamp)
            .execute(&mut **tx)
            .await,
            Some(previous) => sqlx::query(
                "UPDATE projections.current_sequences
                 SET sequence = $3, event_date = $4, last_updated = now()
                 WHERE projection_name = $1 AND instance_id = $2 AND sequence = $5",
            )
            .bind(batch.projection)
            .bind(&batch.instance_id)
            .bind(sequence)
            .bind(next.timestamp)
            .bind(to_bigint(previous.sequence))
            .execute(&mut **tx)
            .await,
        }
        .map_err(|e| ProjectionError::Checkpoint(format!("Failed to save checkpoint: {e}")))?;

        if written.rows_affected() == 1 {
            return Ok(());
        }

        let actual = load_checkpoint_in(&mut **tx, batch.projection, &batch.instance_id).await?;
        Err(ProjectionError::CheckpointConflict {
            projection: batch.projection.to_string(),
            instance_id: batch.instance_id.clone(),
            expected: batch.previous.map(|checkpoint| checkpoint.sequence),
            actual: actual.map(|checkpoint| checkpoint.sequence),
        })
    }
}

async fn load_checkpoint_in<'e, E>(
    executor: E,
    projection: &str,
    instance_id: &str,
) -> Result<Option<Checkpoint>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT sequence, event_date
         FROM projections.current_sequences
         WHERE projection_name = $1 AND instance_id = $2",
    )
    .bind(projection)
    .bind(instance_id)
    .fetch_optional(executor)
    .await
    .map_err(|e| ProjectionError::Checkpoint(format!("Failed to load checkpoint: {e}")))?;

    row.map(|(sequence, timestamp)| {
        u64::try_from(sequence)
            .map(|sequence| Checkpoint::new(sequence, timestamp))
            .map_err(|_| ProjectionError::Checkpoint(format!("Negative sequence {sequence}")))
    })
    .transpose()
}

fn to_bigint(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

const fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::TextArray => "TEXT[]",
        ColumnType::Bool => "BOOLEAN",
        ColumnType::Int64 => "BIGINT",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Jsonb => "JSONB",
    }
}

/// SQL text plus the values bound to its placeholders, in order.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Rendered {
    pub(crate) sql: String,
    pub(crate) binds: Vec<Value>,
}

impl Rendered {
    /// `NULL` is inlined so its type is inferred from the column.
    fn push_value(&mut self, value: &Value) {
        if *value == Value::Null {
            self.sql.push_str("NULL");
        } else {
            self.binds.push(value.clone());
            self.sql.push_str(&format!("${}", self.binds.len()));
        }
    }

    fn push_assignments(&mut self, values: &[Column]) {
        for (i, column) in values.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.sql.push_str(column.name);
            self.sql.push_str(" = ");
            self.push_value(&column.value);
        }
    }

    fn push_conditions(&mut self, conditions: &[Condition]) {
        self.sql.push_str(" WHERE ");
        for (i, condition) in conditions.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(" AND ");
            }
            if condition.value == Value::Null {
                self.sql.push_str(condition.column);
                self.sql.push_str(" IS NULL");
            } else {
                self.sql.push_str(condition.column);
                self.sql.push_str(" = ");
                self.push_value(&condition.value);
            }
        }
    }

    fn bind(&self) -> Query<'_, Postgres, PgArguments> {
        self.binds
            .iter()
            .fold(sqlx::query(&self.sql), |query, value| match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(flag) => query.bind(*flag),
                Value::Int(number) => query.bind(*number),
                Value::Text(text) => query.bind(text.as_str()),
                Value::TextArray(items) => query.bind(items.as_slice()),
                Value::Timestamp(at) => query.bind(*at),
                Value::Json(document) => query.bind(sqlx::types::Json(document)),
            })
    }
}

/// `CREATE TABLE IF NOT EXISTS` for a table definition.
pub(crate) fn create_table_sql(table: &Table) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (", table.name);
    for column in &table.columns {
        sql.push_str(&format!("{} {}", column.name, sql_type(column.column_type)));
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            sql.push_str(&format!(" DEFAULT {}", literal(default)));
        }
        sql.push_str(", ");
    }
    sql.push_str(&format!("PRIMARY KEY ({}))", table.primary_key.join(", ")));
    sql
}

/// `CREATE INDEX IF NOT EXISTS` for every secondary index.
pub(crate) fn create_index_sql(table: &Table) -> Vec<String> {
    table
        .indexes
        .iter()
        .map(|index| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                table.index_name(index),
                table.name,
                index.columns.join(", ")
            )
        })
        .collect()
}

/// Literal for column defaults.
fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(flag) => flag.to_string().to_uppercase(),
        Value::Int(number) => number.to_string(),
        Value::Text(text) => quote(text),
        Value::TextArray(items) => format!(
            "ARRAY[{}]::TEXT[]",
            items.iter().map(|item| quote(item)).collect::<Vec<_>>().join(", ")
        ),
        Value::Timestamp(at) => format!("{}::TIMESTAMPTZ", quote(&at.to_rfc3339())),
        Value::Json(document) => format!("{}::JSONB", quote(&document.to_string())),
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Render one operation.
pub(crate) fn render(operation: &Operation) -> Rendered {
    let mut rendered = Rendered::default();
    match operation {
        Operation::Upsert {
            table,
            values,
            conflict_columns,
        } => {
            let names: Vec<&'static str> = values.iter().map(|column| column.name).collect();
            rendered.sql = format!("INSERT INTO {table} ({}) VALUES (", names.join(", "));
            for (i, column) in values.iter().enumerate() {
                if i > 0 {
                    rendered.sql.push_str(", ");
                }
                rendered.push_value(&column.value);
            }
            rendered.sql.push_str(&format!(
                ") ON CONFLICT ({}) DO ",
                conflict_columns.join(", ")
            ));

            let updates: Vec<String> = names
                .iter()
                .copied()
                .filter(|name| !conflict_columns.contains(name))
                .map(|name| format!("{name} = EXCLUDED.{name}"))
                .collect();
            if updates.is_empty() {
                rendered.sql.push_str("NOTHING");
            } else {
                rendered.sql.push_str("UPDATE SET ");
                rendered.sql.push_str(&updates.join(", "));
            }
        }
        Operation::Update {
            table,
            values,
            conditions,
        } => {
            rendered.sql = format!("UPDATE {table} SET ");
            rendered.push_assignments(values);
            rendered.push_conditions(conditions);
        }
        Operation::Delete { table, conditions } => {
            rendered.sql = format!("DELETE FROM {table}");
            rendered.push_conditions(conditions);
        }
    }
    rendered
}

impl ProjectionStorage for PostgresProjectionStorage {
    fn ensure_table<'a>(&'a self, table: &'a Table) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            table.validate()?;
            self.ensure_bookkeeping().await?;

            if let Some(schema) = table.schema() {
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| ProjectionError::Storage(format!("Failed to create schema: {e}")))?;
            }

            let ddl = std::iter::once(create_table_sql(table)).chain(create_index_sql(table));
            for statement in ddl {
                sqlx::query(&statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        ProjectionError::Storage(format!("Failed to provision {}: {e}", table.name))
                    })?;
            }

            tracing::debug!(table = table.name, "Table provisioned");
            Ok(())
        })
    }

    fn load_checkpoint<'a>(
        &'a self,
        projection: &'a str,
        instance_id: &'a str,
    ) -> StorageFuture<'a, Option<Checkpoint>> {
        Box::pin(load_checkpoint_in(&self.pool, projection, instance_id))
    }

    fn apply<'a>(&'a self, batch: &'a Batch) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let Some(next) = batch.next_checkpoint() else {
                return Ok(());
            };

            let operations: Vec<&Operation> = batch
                .statements
                .iter()
                .flat_map(|statement| &statement.operations)
                .collect();
            for operation in &operations {
                operation.validate()?;
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to begin: {e}")))?;

            // Taking the checkpoint row first serializes concurrent writers.
            Self::advance_checkpoint(&mut tx, batch, next).await?;

            for operation in operations {
                let rendered = render(operation);
                rendered.bind().execute(&mut *tx).await.map_err(|e| {
                    ProjectionError::Storage(format!(
                        "Failed to {} {}: {e}",
                        operation.kind(),
                        operation.table()
                    ))
                })?;
            }

            tx.commit()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to commit: {e}")))?;
            Ok(())
        })
    }

    fn try_lock<'a>(
        &'a self,
        projection: &'a str,
        worker_id: &'a str,
        ttl: Duration,
    ) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO projections.locks (projection_name, locker_id, locked_until)
                 VALUES ($1, $2, now() + make_interval(secs => $3))
                 ON CONFLICT (projection_name) DO UPDATE
                 SET locker_id = EXCLUDED.locker_id, locked_until = EXCLUDED.locked_until
                 WHERE projections.locks.locker_id = EXCLUDED.locker_id
                    OR projections.locks.locked_until < now()",
            )
            .bind(projection)
            .bind(worker_id)
            .bind(ttl.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to lock: {e}")))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn unlock<'a>(&'a self, projection: &'a str, worker_id: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM projections.locks WHERE projection_name = $1 AND locker_id = $2")
                .bind(projection)
                .bind(worker_id)
                .execute(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to unlock: {e}")))?;
            Ok(())
        })
    }

    fn reset<'a>(&'a self, projection: &'a str, table: &'a Table) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            table.validate()?;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to begin: {e}")))?;

            sqlx::query(&format!("TRUNCATE {}", table.name))
                .execute(&mut *tx)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to truncate: {e}")))?;
            sqlx::query("DELETE FROM projections.current_sequences WHERE projection_name = $1")
                .bind(projection)
                .execute(&mut *tx)
                .await
                .map_err(|e| ProjectionError::Checkpoint(format!("Failed to reset: {e}")))?;

            tx.commit()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to commit: {e}")))?;
            Ok(())
        })
    }
}

impl ProjectionReader for PostgresProjectionStorage {
    fn select_text<'a>(
        &'a self,
        table: &'static str,
        column: &'static str,
        conditions: &'a [Condition],
    ) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut rendered = Rendered {
                sql: format!("SELECT {column} FROM {table}"),
                binds: Vec::new(),
            };
            if !conditions.is_empty() {
                rendered.push_conditions(conditions);
            }
            rendered.sql.push_str(" LIMIT 1");

            let value: Option<Option<String>> = rendered
                .bind()
                .try_map(|row: PgRow| row.try_get(0))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to read {table}: {e}")))?;

            Ok(value.flatten())
        })
    }

    fn read_checkpoint<'a>(
        &'a self,
        projection: &'a str,
        instance_id: &'a str,
    ) -> StorageFuture<'a, Option<Checkpoint>> {
        Box::pin(load_checkpoint_in(&self.pool, projection, instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use projector_core::schema::{ColumnDef, Index};

    fn members() -> Table {
        Table::new(
            "projections.members",
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("user_id", ColumnType::Text),
                ColumnDef::new("roles", ColumnType::TextArray).nullable(),
                ColumnDef::new("owner_removed", ColumnType::Bool).default(Value::Bool(false)),
            ],
            vec!["instance_id", "user_id"],
        )
        .with_index(Index::new("owner_removed", vec!["owner_removed"]))
    }

    #[test]
    fn table_ddl_declares_types_defaults_and_key() {
        assert_eq!(
            create_table_sql(&members()),
            "CREATE TABLE IF NOT EXISTS projections.members (\
             instance_id TEXT NOT NULL, \
             user_id TEXT NOT NULL, \
             roles TEXT[], \
             owner_removed BOOLEAN NOT NULL DEFAULT FALSE, \
             PRIMARY KEY (instance_id, user_id))"
        );
        assert_eq!(
            create_index_sql(&members()),
            vec![
                "CREATE INDEX IF NOT EXISTS members_owner_removed_idx \
                 ON projections.members (owner_removed)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn upsert_overwrites_only_non_key_columns() {
        let rendered = render(&Operation::upsert(
            "projections.members",
            vec![
                Column::new("instance_id", "i"),
                Column::new("user_id", "u"),
                Column::new("roles", vec!["viewer".to_string()]),
            ],
            vec!["instance_id", "user_id"],
        ));

        assert_eq!(
            rendered.sql,
            "INSERT INTO projections.members (instance_id, user_id, roles) VALUES ($1, $2, $3) \
             ON CONFLICT (instance_id, user_id) DO UPDATE SET roles = EXCLUDED.roles"
        );
        assert_eq!(rendered.binds.len(), 3);
    }

    #[test]
    fn update_numbers_assignments_before_conditions() {
        let rendered = render(&Operation::update(
            "projections.members",
            vec![Column::new("owner_removed", true), Column::new("roles", Value::Null)],
            vec![
                Condition::new("instance_id", "i"),
                Condition::new("resource_owner", "org"),
            ],
        ));

        assert_eq!(
            rendered.sql,
            "UPDATE projections.members SET owner_removed = $1, roles = NULL \
             WHERE instance_id = $2 AND resource_owner = $3"
        );
        assert_eq!(
            rendered.binds,
            vec![Value::Bool(true), Value::from("i"), Value::from("org")]
        );
    }

    #[test]
    fn null_conditions_render_as_is_null() {
        let rendered = render(&Operation::delete(
            "projections.members",
            vec![Condition::new("instance_id", "i"), Condition::new("roles", Value::Null)],
        ));
        assert_eq!(
            rendered.sql,
            "DELETE FROM projections.members WHERE instance_id = $1 AND roles IS NULL"
        );
    }

    #[test]
    fn text_literals_are_escaped() {
        assert_eq!(literal(&Value::from("it's")), "'it''s'");
        assert_eq!(
            literal(&Value::TextArray(vec!["a".into(), "b".into()])),
            "ARRAY['a', 'b']::TEXT[]"
        );
    }
}
