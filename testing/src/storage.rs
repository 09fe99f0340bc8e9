//! In-memory projection storage that evaluates statements against rows.
//!
//! Statements are executed the way the relational backend executes them:
//! upserts match on their conflict columns, updates and deletes on equality
//! conditions, inserts fill unset columns with declared defaults. A batch is
//! applied to a copy of the tables and swapped in only if every operation
//! and the checkpoint compare-and-set succeed.

use projector_core::projection::{
    Batch, Checkpoint, ProjectionError, ProjectionReader, ProjectionStorage, Result, StorageFuture,
};
use projector_core::schema::Table;
use projector_core::statement::{Column, Condition, Operation, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// One stored row, keyed by column name.
pub type Row = BTreeMap<&'static str, Value>;

#[derive(Debug, Clone)]
struct TableState {
    definition: Table,
    rows: Vec<Row>,
}

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    until: Instant,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<&'static str, TableState>,
    checkpoints: HashMap<(String, String), Checkpoint>,
    leases: HashMap<String, Lease>,
    apply_failures: usize,
    applied_batches: usize,
}

/// In-memory [`ProjectionStorage`] and [`ProjectionReader`].
///
/// # Example
///
/// ```
/// use projector_core::projection::ProjectionStorage;
/// use projector_core::schema::{ColumnDef, ColumnType, Table};
/// use projector_testing::InMemoryProjectionStorage;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = InMemoryProjectionStorage::new();
/// let table = Table::new(
///     "projections.users",
///     vec![ColumnDef::new("id", ColumnType::Text)],
///     vec!["id"],
/// );
/// storage.ensure_table(&table).await?;
/// assert!(storage.rows("projections.users").is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStorage {
    state: Arc<RwLock<State>>,
}

impl InMemoryProjectionStorage {
    /// Create empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| ProjectionError::Storage(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| ProjectionError::Storage(e.to_string()))
    }

    /// Every row of `table`, in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.read()
            .unwrap()
            .tables
            .get(table)
            .map(|state| state.rows.clone())
            .unwrap_or_default()
    }

    /// Rows of `table` whose columns equal all given values.
    #[must_use]
    pub fn find(&self, table: &str, filter: &[(&'static str, Value)]) -> Vec<Row> {
        self.rows(table)
            .into_iter()
            .filter(|row| {
                filter
                    .iter()
                    .all(|(column, value)| row.get(column) == Some(value))
            })
            .collect()
    }

    /// Insert a row directly, bypassing reducers and checkpoints.
    ///
    /// # Panics
    ///
    /// Panics if the table was not provisioned or the lock is poisoned.
    #[allow(clippy::unwrap_used)]
    pub fn seed(&self, table: &str, columns: Vec<Column>) {
        let mut state = self.write().unwrap();
        let table = state.tables.get_mut(table).unwrap();
        let row = new_row(&table.definition, &columns).unwrap();
        table.rows.push(row);
    }

    /// Stored checkpoint of `projection` for `instance_id`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn checkpoint(&self, projection: &str, instance_id: &str) -> Option<Checkpoint> {
        self.read()
            .unwrap()
            .checkpoints
            .get(&(projection.to_string(), instance_id.to_string()))
            .copied()
    }

    /// Worker currently holding the lease of `projection`, if unexpired.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn lease_holder(&self, projection: &str) -> Option<String> {
        self.read()
            .unwrap()
            .leases
            .get(projection)
            .filter(|lease| lease.until > Instant::now())
            .map(|lease| lease.worker_id.clone())
    }

    /// Make the next `count` batch applications fail with a storage error.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[allow(clippy::unwrap_used)]
    pub fn fail_next_applies(&self, count: usize) {
        self.write().unwrap().apply_failures = count;
    }

    /// Number of committed non-empty batches.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn applied_batches(&self) -> usize {
        self.read().unwrap().applied_batches
    }

    fn apply_batch(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.write()?;
        if state.apply_failures > 0 {
            state.apply_failures -= 1;
            return Err(ProjectionError::Storage(
                "injected apply failure".to_string(),
            ));
        }

        let key = (batch.projection.to_string(), batch.instance_id.clone());
        let stored = state.checkpoints.get(&key).map(|c| c.sequence);
        let expected = batch.previous.map(|c| c.sequence);
        if stored != expected {
            return Err(ProjectionError::CheckpointConflict {
                projection: batch.projection.to_string(),
                instance_id: batch.instance_id.clone(),
                expected,
                actual: stored,
            });
        }

        let mut tables = state.tables.clone();
        for statement in &batch.statements {
            for operation in &statement.operations {
                operation.validate()?;
                let table = tables.get_mut(operation.table()).ok_or_else(|| {
                    ProjectionError::Storage(format!(
                        "relation {} does not exist",
                        operation.table()
                    ))
                })?;
                execute(table, operation)?;
            }
        }

        state.tables = tables;
        if let Some(checkpoint) = batch.next_checkpoint() {
            state.checkpoints.insert(key, checkpoint);
        }
        state.applied_batches += 1;
        Ok(())
    }
}

fn matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|condition| row.get(condition.column) == Some(&condition.value))
}

fn check_columns<'a>(
    definition: &Table,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    for column in columns {
        if definition.column(column).is_none() {
            return Err(ProjectionError::Storage(format!(
                "column {column} of relation {} does not exist",
                definition.name
            )));
        }
    }
    Ok(())
}

fn new_row(definition: &Table, values: &[Column]) -> Result<Row> {
    check_columns(definition, values.iter().map(|column| column.name))?;

    let mut row = Row::new();
    for column in &definition.columns {
        let value = values
            .iter()
            .find(|assigned| assigned.name == column.name)
            .map(|assigned| assigned.value.clone())
            .or_else(|| column.default.clone());

        match value {
            Some(Value::Null) | None if !column.nullable => {
                return Err(ProjectionError::Storage(format!(
                    "null value in column {} of relation {} violates not-null constraint",
                    column.name, definition.name
                )));
            }
            Some(value) => {
                row.insert(column.name, value);
            }
            None => {
                row.insert(column.name, Value::Null);
            }
        }
    }
    Ok(row)
}

fn assign(row: &mut Row, values: &[Column]) {
    for column in values {
        row.insert(column.name, column.value.clone());
    }
}

fn execute(table: &mut TableState, operation: &Operation) -> Result<()> {
    match operation {
        Operation::Upsert {
            values,
            conflict_columns,
            ..
        } => {
            let key: Vec<Condition> = conflict_columns
                .iter()
                .map(|&name| {
                    values
                        .iter()
                        .find(|column| column.name == name)
                        .map(|column| Condition::new(name, column.value.clone()))
                        .ok_or_else(|| {
                            ProjectionError::Storage(format!(
                                "conflict column {name} has no value"
                            ))
                        })
                })
                .collect::<Result<_>>()?;

            if let Some(row) = table.rows.iter_mut().find(|row| matches(row, &key)) {
                check_columns(&table.definition, values.iter().map(|column| column.name))?;
                assign(row, values);
            } else {
                let row = new_row(&table.definition, values)?;
                table.rows.push(row);
            }
        }
        Operation::Update {
            values, conditions, ..
        } => {
            check_columns(&table.definition, values.iter().map(|column| column.name))?;
            check_columns(
                &table.definition,
                conditions.iter().map(|condition| condition.column),
            )?;
            for row in table.rows.iter_mut().filter(|row| matches(row, conditions)) {
                assign(row, values);
            }
        }
        Operation::Delete { conditions, .. } => {
            check_columns(
                &table.definition,
                conditions.iter().map(|condition| condition.column),
            )?;
            table.rows.retain(|row| !matches(row, conditions));
        }
    }
    Ok(())
}

impl ProjectionStorage for InMemoryProjectionStorage {
    fn ensure_table<'a>(&'a self, table: &'a Table) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            table.validate()?;
            self.write()?
                .tables
                .entry(table.name)
                .or_insert_with(|| TableState {
                    definition: table.clone(),
                    rows: Vec::new(),
                });
            Ok(())
        })
    }

    fn load_checkpoint<'a>(
        &'a self,
        projection: &'a str,
        instance_id: &'a str,
    ) -> StorageFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            Ok(self
                .read()?
                .checkpoints
                .get(&(projection.to_string(), instance_id.to_string()))
                .copied())
        })
    }

    fn apply<'a>(&'a self, batch: &'a Batch) -> StorageFuture<'a, ()> {
        Box::pin(async move { self.apply_batch(batch) })
    }

    fn try_lock<'a>(
        &'a self,
        projection: &'a str,
        worker_id: &'a str,
        ttl: Duration,
    ) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.write()?;
            let now = Instant::now();
            if let Some(lease) = state.leases.get(projection) {
                if lease.worker_id != worker_id && lease.until > now {
                    return Ok(false);
                }
            }
            state.leases.insert(
                projection.to_string(),
                Lease {
                    worker_id: worker_id.to_string(),
                    until: now + ttl,
                },
            );
            Ok(true)
        })
    }

    fn unlock<'a>(&'a self, projection: &'a str, worker_id: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.write()?;
            if state
                .leases
                .get(projection)
                .is_some_and(|lease| lease.worker_id == worker_id)
            {
                state.leases.remove(projection);
            }
            Ok(())
        })
    }

    fn reset<'a>(&'a self, projection: &'a str, table: &'a Table) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.write()?;
            if let Some(stored) = state.tables.get_mut(table.name) {
                stored.rows.clear();
            }
            state
                .checkpoints
                .retain(|(name, _), _| name.as_str() != projection);
            Ok(())
        })
    }
}

impl ProjectionReader for InMemoryProjectionStorage {
    fn select_text<'a>(
        &'a self,
        table: &'static str,
        column: &'static str,
        conditions: &'a [Condition],
    ) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move {
            let state = self.read()?;
            let stored = state.tables.get(table).ok_or_else(|| {
                ProjectionError::Storage(format!("relation {table} does not exist"))
            })?;
            Ok(stored
                .rows
                .iter()
                .find(|row| matches(row, conditions))
                .and_then(|row| row.get(column))
                .and_then(Value::as_text)
                .map(str::to_string))
        })
    }

    fn read_checkpoint<'a>(
        &'a self,
        projection: &'a str,
        instance_id: &'a str,
    ) -> StorageFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            let state = self.read()?;
            Ok(state
                .checkpoints
                .get(&(projection.to_string(), instance_id.to_string()))
                .copied())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use projector_core::aggregate::ProjectEventType;
    use projector_core::event::Event;
    use projector_core::schema::{ColumnDef, ColumnType};
    use projector_core::statement::Statement;

    const TABLE: &str = "projections.grants";

    fn table() -> Table {
        Table::new(
            TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("grant_id", ColumnType::Text),
                ColumnDef::new("granted_org", ColumnType::Text),
                ColumnDef::new("removed", ColumnType::Bool).default(Value::Bool(false)),
            ],
            vec!["instance_id", "grant_id"],
        )
    }

    fn event(sequence: u64) -> Event {
        Event::builder("i", ProjectEventType::GrantAdded, "p")
            .sequence(sequence)
            .build()
    }

    fn upsert(sequence: u64, grant: &str, org: &str) -> Statement {
        Statement::upsert(
            &event(sequence),
            TABLE,
            vec![
                Column::new("instance_id", "i"),
                Column::new("grant_id", grant),
                Column::new("granted_org", org),
            ],
            vec!["instance_id", "grant_id"],
        )
    }

    async fn storage() -> InMemoryProjectionStorage {
        let storage = InMemoryProjectionStorage::new();
        storage.ensure_table(&table()).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn upsert_inserts_with_defaults_then_overwrites() {
        let storage = storage().await;
        let mut batch = Batch::new("grants", "i", None);
        batch.push(upsert(1, "g", "org-a"));
        batch.push(upsert(2, "g", "org-b"));
        storage.apply(&batch).await.unwrap();

        let rows = storage.rows(TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["granted_org"], Value::from("org-b"));
        assert_eq!(rows[0]["removed"], Value::Bool(false));
        assert_eq!(storage.checkpoint("grants", "i").map(|c| c.sequence), Some(2));
    }

    #[tokio::test]
    async fn failing_operation_rolls_back_whole_batch() {
        let storage = storage().await;
        let mut batch = Batch::new("grants", "i", None);
        batch.push(upsert(1, "g", "org-a"));
        batch.push(Statement::update(
            &event(2),
            TABLE,
            vec![Column::new("no_such_column", true)],
            vec![Condition::new("grant_id", "g")],
        ));

        assert!(storage.apply(&batch).await.is_err());
        assert!(storage.rows(TABLE).is_empty());
        assert_eq!(storage.checkpoint("grants", "i"), None);
    }

    #[tokio::test]
    async fn stale_checkpoint_is_a_conflict() {
        let storage = storage().await;
        let mut first = Batch::new("grants", "i", None);
        first.push(upsert(1, "g", "org-a"));
        storage.apply(&first).await.unwrap();

        let mut stale = Batch::new("grants", "i", None);
        stale.push(upsert(2, "g", "org-b"));
        let err = storage.apply(&stale).await.unwrap_err();

        assert!(matches!(
            err,
            ProjectionError::CheckpointConflict {
                expected: None,
                actual: Some(1),
                ..
            }
        ));
        assert_eq!(storage.rows(TABLE)[0]["granted_org"], Value::from("org-a"));
    }

    #[tokio::test]
    async fn missing_not_null_value_is_rejected() {
        let storage = storage().await;
        let mut batch = Batch::new("grants", "i", None);
        batch.push(Statement::upsert(
            &event(1),
            TABLE,
            vec![Column::new("instance_id", "i"), Column::new("grant_id", "g")],
            vec!["instance_id", "grant_id"],
        ));
        assert!(storage.apply(&batch).await.is_err());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let storage = storage().await;
        let ttl = Duration::from_secs(30);

        assert!(storage.try_lock("grants", "a", ttl).await.unwrap());
        assert!(!storage.try_lock("grants", "b", ttl).await.unwrap());
        assert!(storage.try_lock("grants", "a", ttl).await.unwrap());

        storage.unlock("grants", "b").await.unwrap();
        assert_eq!(storage.lease_holder("grants").as_deref(), Some("a"));

        storage.unlock("grants", "a").await.unwrap();
        assert!(storage.try_lock("grants", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let storage = storage().await;
        assert!(storage.try_lock("grants", "a", Duration::ZERO).await.unwrap());
        assert!(storage.try_lock("grants", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn reader_selects_text_column() {
        let storage = storage().await;
        storage.seed(
            TABLE,
            vec![
                Column::new("instance_id", "i"),
                Column::new("grant_id", "g"),
                Column::new("granted_org", "org-a"),
            ],
        );

        let conditions = [Condition::new("grant_id", "g")];
        let org = storage
            .select_text(TABLE, "granted_org", &conditions)
            .await
            .unwrap();
        assert_eq!(org.as_deref(), Some("org-a"));

        let missing = [Condition::new("grant_id", "other")];
        assert_eq!(
            storage
                .select_text(TABLE, "granted_org", &missing)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn reset_clears_rows_and_checkpoints() {
        let storage = storage().await;
        let mut batch = Batch::new("grants", "i", None);
        batch.push(upsert(1, "g", "org-a"));
        storage.apply(&batch).await.unwrap();

        storage.reset("grants", &table()).await.unwrap();
        assert!(storage.rows(TABLE).is_empty());
        assert_eq!(storage.checkpoint("grants", "i"), None);
    }
}
