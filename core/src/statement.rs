//! Storage statements produced by reducers.
//!
//! A [`Statement`] is the in-memory description of what one event does to a
//! projection: zero or more [`Operation`]s that must commit together, plus the
//! position of the event that produced them so the runner can advance the
//! checkpoint in the same transaction.
//!
//! Operations never carry SQL. Storage backends render them:
//!
//! - [`Operation::Upsert`] inserts a row or overwrites the listed columns when a
//!   row with the same conflict key exists.
//! - [`Operation::Update`] sets columns on every row matching all conditions.
//! - [`Operation::Delete`] removes every row matching all conditions.
//!
//! Conditions are plain equality matches. Cascading removals use them on
//! denormalized reference columns (`granted_org = $org`) so a single
//! operation fans out to every dependent row without the engine enumerating
//! those rows.

use crate::aggregate::AggregateType;
use crate::event::Event;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Errors raised when an operation is structurally unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    /// An update or delete without conditions would touch the whole table.
    #[error("{kind} on {table} has no conditions")]
    NoConditions {
        /// Operation kind.
        kind: &'static str,
        /// Target table.
        table: &'static str,
    },

    /// An upsert or update without values.
    #[error("{kind} on {table} has no values")]
    NoValues {
        /// Operation kind.
        kind: &'static str,
        /// Target table.
        table: &'static str,
    },

    /// An upsert without conflict columns cannot be matched to an existing row.
    #[error("upsert on {table} has no conflict columns")]
    NoConflictColumns {
        /// Target table.
        table: &'static str,
    },
}

/// A typed column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Text.
    Text(String),
    /// Array of text.
    TextArray(Vec<String>),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
    /// JSON document.
    Json(serde_json::Value),
}

impl Value {
    /// Text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(flag) => Some(*flag),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        // Sequences beyond i64::MAX are not representable in BIGINT columns.
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// A column assignment.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: &'static str,
    /// Assigned value.
    pub value: Value,
}

impl Column {
    /// Assign `value` to column `name`.
    #[must_use]
    pub fn new(name: &'static str, value: impl Into<Value>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// An equality match on one column.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    /// Column name.
    pub column: &'static str,
    /// Value the column must equal.
    pub value: Value,
}

impl Condition {
    /// Match rows where `column = value`.
    #[must_use]
    pub fn new(column: &'static str, value: impl Into<Value>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

/// One storage mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Insert, or overwrite `values` on the row with the same conflict key.
    Upsert {
        /// Target table.
        table: &'static str,
        /// Columns written on insert and on conflict.
        values: Vec<Column>,
        /// Columns identifying the row (usually the primary key).
        conflict_columns: Vec<&'static str>,
    },
    /// Set `values` on every row matching all `conditions`.
    Update {
        /// Target table.
        table: &'static str,
        /// Columns to set.
        values: Vec<Column>,
        /// Conditions combined with `AND`.
        conditions: Vec<Condition>,
    },
    /// Remove every row matching all `conditions`.
    Delete {
        /// Target table.
        table: &'static str,
        /// Conditions combined with `AND`.
        conditions: Vec<Condition>,
    },
}

impl Operation {
    /// Build an upsert.
    #[must_use]
    pub const fn upsert(
        table: &'static str,
        values: Vec<Column>,
        conflict_columns: Vec<&'static str>,
    ) -> Self {
        Self::Upsert {
            table,
            values,
            conflict_columns,
        }
    }

    /// Build a conditional update.
    #[must_use]
    pub const fn update(table: &'static str, values: Vec<Column>, conditions: Vec<Condition>) -> Self {
        Self::Update {
            table,
            values,
            conditions,
        }
    }

    /// Build a conditional delete.
    #[must_use]
    pub const fn delete(table: &'static str, conditions: Vec<Condition>) -> Self {
        Self::Delete { table, conditions }
    }

    /// Target table.
    #[must_use]
    pub const fn table(&self) -> &'static str {
        match self {
            Self::Upsert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                *table
            }
        }
    }

    /// Short name of the operation kind, for logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// Reject operations that cannot be executed safely.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError`] for upserts without values or conflict
    /// columns, and for updates or deletes without conditions.
    pub fn validate(&self) -> Result<(), StatementError> {
        let kind = self.kind();
        let table = self.table();
        match self {
            Self::Upsert {
                values,
                conflict_columns,
                ..
            } => {
                if values.is_empty() {
                    return Err(StatementError::NoValues { kind, table });
                }
                if conflict_columns.is_empty() {
                    return Err(StatementError::NoConflictColumns { table });
                }
            }
            Self::Update {
                values, conditions, ..
            } => {
                if values.is_empty() {
                    return Err(StatementError::NoValues { kind, table });
                }
                if conditions.is_empty() {
                    return Err(StatementError::NoConditions { kind, table });
                }
            }
            Self::Delete { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(StatementError::NoConditions { kind, table });
                }
            }
        }
        Ok(())
    }
}

/// Everything one event does to a projection.
///
/// An empty operation list is a no-op statement: nothing is written, but the
/// event still counts as applied and moves the checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// Tenant of the originating event.
    pub instance_id: String,
    /// Aggregate kind of the originating event.
    pub aggregate_type: AggregateType,
    /// Sequence of the originating event.
    pub sequence: u64,
    /// Creation date of the originating event.
    pub created_at: DateTime<Utc>,
    /// Operations, applied in order inside one transaction.
    pub operations: Vec<Operation>,
}

impl Statement {
    /// Statement for `event` with the given operations.
    #[must_use]
    pub fn multi(event: &Event, operations: Vec<Operation>) -> Self {
        Self {
            instance_id: event.instance_id.clone(),
            aggregate_type: event.aggregate_type(),
            sequence: event.sequence,
            created_at: event.created_at,
            operations,
        }
    }

    /// Statement that writes nothing.
    #[must_use]
    pub fn no_op(event: &Event) -> Self {
        Self::multi(event, Vec::new())
    }

    /// Single upsert.
    #[must_use]
    pub fn upsert(
        event: &Event,
        table: &'static str,
        values: Vec<Column>,
        conflict_columns: Vec<&'static str>,
    ) -> Self {
        Self::multi(event, vec![Operation::upsert(table, values, conflict_columns)])
    }

    /// Single conditional update.
    #[must_use]
    pub fn update(
        event: &Event,
        table: &'static str,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Self {
        Self::multi(event, vec![Operation::update(table, values, conditions)])
    }

    /// Single conditional delete.
    #[must_use]
    pub fn delete(event: &Event, table: &'static str, conditions: Vec<Condition>) -> Self {
        Self::multi(event, vec![Operation::delete(table, conditions)])
    }

    /// Whether the statement writes nothing.
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        self.operations.is_empty()
    }

    /// Validate every operation.
    ///
    /// # Errors
    ///
    /// Returns the first [`StatementError`] found.
    pub fn validate(&self) -> Result<(), StatementError> {
        self.operations.iter().try_for_each(Operation::validate)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Statement {{ instance: {}, seq: {}, ops: {} }}",
            self.instance_id,
            self.sequence,
            self.operations.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::OrgEventType;

    fn org_removed() -> Event {
        Event::builder("instance-1", OrgEventType::Removed, "org-1")
            .sequence(12)
            .build()
    }

    #[test]
    fn multi_statement_carries_event_position() {
        let event = org_removed();
        let statement = Statement::multi(
            &event,
            vec![
                Operation::update(
                    "members",
                    vec![Column::new("owner_removed", true)],
                    vec![Condition::new("resource_owner", "org-1")],
                ),
                Operation::delete("members", vec![Condition::new("user_id", "u")]),
            ],
        );

        assert_eq!(statement.instance_id, "instance-1");
        assert_eq!(statement.aggregate_type, AggregateType::Org);
        assert_eq!(statement.sequence, 12);
        assert_eq!(statement.operations.len(), 2);
        assert_eq!(statement.validate(), Ok(()));
    }

    #[test]
    fn no_op_statement_has_no_operations() {
        assert!(Statement::no_op(&org_removed()).is_no_op());
    }

    #[test]
    fn unconditional_delete_is_rejected() {
        let statement = Statement::delete(&org_removed(), "members", vec![]);
        assert_eq!(
            statement.validate(),
            Err(StatementError::NoConditions {
                kind: "delete",
                table: "members"
            })
        );
    }

    #[test]
    fn upsert_requires_conflict_columns() {
        let statement = Statement::upsert(
            &org_removed(),
            "members",
            vec![Column::new("user_id", "u")],
            vec![],
        );
        assert_eq!(
            statement.validate(),
            Err(StatementError::NoConflictColumns { table: "members" })
        );
    }

    #[test]
    fn sequences_saturate_into_bigint() {
        assert_eq!(Value::from(u64::MAX), Value::Int(i64::MAX));
        assert_eq!(Value::from(7_u64), Value::Int(7));
    }
}
