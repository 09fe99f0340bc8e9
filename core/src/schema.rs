//! Declarative table definitions for projections.
//!
//! A projection declares its table once; the storage backend provisions it at
//! startup with "create if not exists" semantics, so applying the same
//! definition on every start is safe and never drops data.
//!
//! # Example
//!
//! ```
//! use projector_core::schema::{ColumnDef, ColumnType, Index, Table};
//! use projector_core::statement::Value;
//!
//! let table = Table::new(
//!     "projections.users",
//!     vec![
//!         ColumnDef::new("instance_id", ColumnType::Text),
//!         ColumnDef::new("id", ColumnType::Text),
//!         ColumnDef::new("resource_owner", ColumnType::Text),
//!         ColumnDef::new("owner_removed", ColumnType::Bool).default(Value::Bool(false)),
//!     ],
//!     vec!["instance_id", "id"],
//! )
//! .with_index(Index::new("resource_owner", vec!["resource_owner"]));
//!
//! assert!(table.validate().is_ok());
//! assert_eq!(table.schema(), Some("projections"));
//! ```

use crate::statement::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Structural problems in a table definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Identifier contains characters outside `[a-z0-9_]`.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The table declares no columns.
    #[error("Table {0} has no columns")]
    NoColumns(String),

    /// The table declares no primary key.
    #[error("Table {0} has no primary key")]
    NoPrimaryKey(String),

    /// A column is declared twice.
    #[error("Table {table} declares column {column} twice")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A key or index refers to a column that is not declared.
    #[error("Table {table}: {context} refers to unknown column {column}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Where the reference occurs (`primary key` or the index name).
        context: String,
        /// Column name.
        column: String,
    },
}

/// Semantic column type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Text.
    Text,
    /// Array of text.
    TextArray,
    /// Boolean.
    Bool,
    /// 64-bit integer.
    Int64,
    /// Timestamp with time zone.
    Timestamp,
    /// JSON document.
    Jsonb,
}

/// One column of a table.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDef {
    /// Column name.
    pub name: &'static str,
    /// Column type.
    pub column_type: ColumnType,
    /// Whether `NULL` is allowed.
    pub nullable: bool,
    /// Value used when an insert does not set the column.
    pub default: Option<Value>,
}

impl ColumnDef {
    /// A non-nullable column without default.
    #[must_use]
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            default: None,
        }
    }

    /// Allow `NULL`.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A named secondary index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    /// Index name, unique within the table.
    pub name: &'static str,
    /// Indexed columns, in order.
    pub columns: Vec<&'static str>,
}

impl Index {
    /// Index `columns` under `name`.
    #[must_use]
    pub const fn new(name: &'static str, columns: Vec<&'static str>) -> Self {
        Self { name, columns }
    }
}

/// A projection table definition.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    /// Table name, optionally qualified with a schema (`projections.users`).
    pub name: &'static str,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Composite primary key.
    pub primary_key: Vec<&'static str>,
    /// Secondary indexes.
    pub indexes: Vec<Index>,
}

impl Table {
    /// Define a table.
    #[must_use]
    pub const fn new(
        name: &'static str,
        columns: Vec<ColumnDef>,
        primary_key: Vec<&'static str>,
    ) -> Self {
        Self {
            name,
            columns,
            primary_key,
            indexes: Vec::new(),
        }
    }

    /// Add a secondary index.
    #[must_use]
    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    /// Schema qualifier, if the name has one.
    #[must_use]
    pub fn schema(&self) -> Option<&'static str> {
        self.name.split_once('.').map(|(schema, _)| schema)
    }

    /// Name without the schema qualifier.
    #[must_use]
    pub fn unqualified_name(&self) -> &'static str {
        self.name
            .split_once('.')
            .map_or(self.name, |(_, table)| table)
    }

    /// Look up a column definition.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Physical name of an index: `<table>_<index>_idx`.
    #[must_use]
    pub fn index_name(&self, index: &Index) -> String {
        format!("{}_{}_idx", self.unqualified_name(), index.name)
    }

    /// Check the definition before it is provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for invalid identifiers, empty column lists,
    /// missing primary keys, duplicate columns, and keys or indexes that
    /// refer to undeclared columns.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let table = self.name.to_string();

        if let Some(schema) = self.schema() {
            check_identifier(schema)?;
        }
        check_identifier(self.unqualified_name())?;

        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(table));
        }
        if self.primary_key.is_empty() {
            return Err(SchemaError::NoPrimaryKey(table));
        }

        let mut declared = HashSet::new();
        for column in &self.columns {
            check_identifier(column.name)?;
            if !declared.insert(column.name) {
                return Err(SchemaError::DuplicateColumn {
                    table,
                    column: column.name.to_string(),
                });
            }
        }

        let references = std::iter::once(("primary key", &self.primary_key))
            .chain(self.indexes.iter().map(|index| (index.name, &index.columns)));
        for (context, columns) in references {
            check_identifier(context.replace(' ', "_").as_str())?;
            for column in columns {
                if !declared.contains(column) {
                    return Err(SchemaError::UnknownColumn {
                        table,
                        context: context.to_string(),
                        column: (*column).to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn check_identifier(identifier: &str) -> Result<(), SchemaError> {
    let valid = !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !identifier.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(identifier.to_string()))
    }
}
