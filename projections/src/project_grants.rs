//! `projections.project_grants`: which organization each project grant targets.
//!
//! Grant memberships read `granted_org` from here. Removing a grant or its
//! project only sets `removed`, so the granted organization stays readable for
//! membership events that precede the removal.

use crate::shared;
use projector_core::aggregate::{AggregateType, OrgEventType, ProjectEventType};
use projector_core::event::Event;
use projector_core::projection::Projection;
use projector_core::reducer::{
    AggregateReducer, EventReducer, ReduceResult, ReducerRegistry, RegistryError,
};
use projector_core::schema::{ColumnDef, ColumnType, Index, Table};
use projector_core::statement::{Column, Condition, Operation, Statement, Value};
use serde::Deserialize;

/// Table of the project grant projection.
pub const PROJECT_GRANTS_TABLE: &str = "projections.project_grants";

/// Column names of [`PROJECT_GRANTS_TABLE`].
pub mod grant_columns {
    /// Tenant.
    pub const INSTANCE_ID: &str = "instance_id";
    /// Granting project.
    pub const PROJECT_ID: &str = "project_id";
    /// Grant id.
    pub const GRANT_ID: &str = "grant_id";
    /// Organization that received the grant.
    pub const GRANTED_ORG: &str = "granted_org";
    /// Organization owning the project.
    pub const RESOURCE_OWNER: &str = "resource_owner";
    /// Set when the project's organization is removed.
    pub const OWNER_REMOVED: &str = "owner_removed";
    /// Set when the granted organization is removed.
    pub const GRANTED_ORG_REMOVED: &str = "granted_org_removed";
    /// Set when the grant or its project is removed.
    pub const REMOVED: &str = "removed";
    /// Creation date of the grant.
    pub const CREATION_DATE: &str = "creation_date";
    /// Date of the last applied event.
    pub const CHANGE_DATE: &str = "change_date";
    /// Sequence of the last applied event.
    pub const SEQUENCE: &str = "sequence";
}

use grant_columns as col;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantAdded {
    grant_id: String,
    granted_org_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantRef {
    grant_id: String,
}

/// Projects project grants.
pub struct ProjectGrantProjection {
    table: Table,
    registry: ReducerRegistry<Self>,
}

impl ProjectGrantProjection {
    /// Build the projection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the reducer wiring is inconsistent.
    pub fn new() -> Result<Self, RegistryError> {
        let registry = ReducerRegistry::new(vec![
            AggregateReducer::new(
                AggregateType::Project,
                vec![
                    EventReducer::pure(ProjectEventType::GrantAdded, Self::reduce_added),
                    EventReducer::pure(ProjectEventType::GrantChanged, Self::reduce_changed),
                    EventReducer::pure(ProjectEventType::GrantRemoved, Self::reduce_removed),
                    EventReducer::pure(ProjectEventType::Removed, Self::reduce_project_removed),
                ],
            ),
            AggregateReducer::new(
                AggregateType::Org,
                vec![EventReducer::pure(OrgEventType::Removed, Self::reduce_org_removed)],
            ),
            shared::instance_removed(PROJECT_GRANTS_TABLE, col::INSTANCE_ID),
        ])?;

        Ok(Self {
            table: table(),
            registry,
        })
    }

    fn reduce_added(&self, event: &Event) -> ReduceResult {
        let payload: GrantAdded = event.decode()?;
        Ok(Statement::upsert(
            event,
            PROJECT_GRANTS_TABLE,
            vec![
                Column::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Column::new(col::PROJECT_ID, event.aggregate_id.as_str()),
                Column::new(col::GRANT_ID, payload.grant_id),
                Column::new(col::GRANTED_ORG, payload.granted_org_id),
                Column::new(col::RESOURCE_OWNER, event.resource_owner.as_str()),
                Column::new(col::OWNER_REMOVED, false),
                Column::new(col::GRANTED_ORG_REMOVED, false),
                Column::new(col::REMOVED, false),
                Column::new(col::CREATION_DATE, event.created_at),
                Column::new(col::CHANGE_DATE, event.created_at),
                Column::new(col::SEQUENCE, event.sequence),
            ],
            vec![col::INSTANCE_ID, col::PROJECT_ID, col::GRANT_ID],
        ))
    }

    /// Role changes do not touch this table; the event only moves the checkpoint.
    fn reduce_changed(&self, event: &Event) -> ReduceResult {
        let _: GrantRef = event.decode()?;
        Ok(Statement::no_op(event))
    }

    fn reduce_removed(&self, event: &Event) -> ReduceResult {
        let payload: GrantRef = event.decode()?;
        Ok(Statement::update(
            event,
            PROJECT_GRANTS_TABLE,
            tombstone(event),
            vec![
                Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Condition::new(col::PROJECT_ID, event.aggregate_id.as_str()),
                Condition::new(col::GRANT_ID, payload.grant_id),
            ],
        ))
    }

    fn reduce_project_removed(&self, event: &Event) -> ReduceResult {
        Ok(Statement::update(
            event,
            PROJECT_GRANTS_TABLE,
            tombstone(event),
            vec![
                Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Condition::new(col::PROJECT_ID, event.aggregate_id.as_str()),
            ],
        ))
    }

    fn reduce_org_removed(&self, event: &Event) -> ReduceResult {
        let mark = |flag: &'static str, reference: &'static str| {
            Operation::update(
                PROJECT_GRANTS_TABLE,
                vec![
                    Column::new(flag, true),
                    Column::new(col::CHANGE_DATE, event.created_at),
                    Column::new(col::SEQUENCE, event.sequence),
                ],
                vec![
                    Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                    Condition::new(reference, event.aggregate_id.as_str()),
                ],
            )
        };

        Ok(Statement::multi(
            event,
            vec![
                mark(col::OWNER_REMOVED, col::RESOURCE_OWNER),
                mark(col::GRANTED_ORG_REMOVED, col::GRANTED_ORG),
            ],
        ))
    }
}

impl Projection for ProjectGrantProjection {
    fn name(&self) -> &'static str {
        PROJECT_GRANTS_TABLE
    }

    fn table(&self) -> &Table {
        &self.table
    }

    fn registry(&self) -> &ReducerRegistry<Self> {
        &self.registry
    }
}

fn tombstone(event: &Event) -> Vec<Column> {
    vec![
        Column::new(col::REMOVED, true),
        Column::new(col::CHANGE_DATE, event.created_at),
        Column::new(col::SEQUENCE, event.sequence),
    ]
}

fn table() -> Table {
    Table::new(
        PROJECT_GRANTS_TABLE,
        vec![
            ColumnDef::new(col::INSTANCE_ID, ColumnType::Text),
            ColumnDef::new(col::PROJECT_ID, ColumnType::Text),
            ColumnDef::new(col::GRANT_ID, ColumnType::Text),
            ColumnDef::new(col::GRANTED_ORG, ColumnType::Text),
            ColumnDef::new(col::RESOURCE_OWNER, ColumnType::Text),
            ColumnDef::new(col::OWNER_REMOVED, ColumnType::Bool).default(Value::Bool(false)),
            ColumnDef::new(col::GRANTED_ORG_REMOVED, ColumnType::Bool)
                .default(Value::Bool(false)),
            ColumnDef::new(col::REMOVED, ColumnType::Bool).default(Value::Bool(false)),
            ColumnDef::new(col::CREATION_DATE, ColumnType::Timestamp),
            ColumnDef::new(col::CHANGE_DATE, ColumnType::Timestamp),
            ColumnDef::new(col::SEQUENCE, ColumnType::Int64),
        ],
        vec![col::INSTANCE_ID, col::PROJECT_ID, col::GRANT_ID],
    )
    .with_index(Index::new(col::GRANTED_ORG, vec![col::GRANTED_ORG]))
    .with_index(Index::new(col::RESOURCE_OWNER, vec![col::RESOURCE_OWNER]))
}
