//! `projections.project_grant_members3`: members of project grants.
//!
//! One row per (instance, project, grant, user). Besides the member's roles
//! the row carries three denormalized parents so authorization queries never
//! join:
//!
//! | column | parent | filled from |
//! |---|---|---|
//! | `resource_owner` | organization owning the project | the event |
//! | `user_resource_owner` | organization owning the user | `projections.users` |
//! | `granted_org` | organization the grant targets | `projections.project_grants` |
//!
//! Removing a project, grant, user or instance deletes the affected rows.
//! Removing an organization keeps them and sets the removal flag of every
//! column that referenced it.

use crate::lookup::Lookups;
use crate::member;
use crate::shared;
use futures::FutureExt;
use futures::future::BoxFuture;
use projector_core::aggregate::{AggregateType, OrgEventType, ProjectEventType, UserEventType};
use projector_core::event::Event;
use projector_core::projection::{Projection, ProjectionReader};
use projector_core::reducer::{
    AggregateReducer, EventReducer, ReduceResult, ReducerRegistry, RegistryError,
};
use projector_core::schema::{ColumnDef, ColumnType, Index, Table};
use projector_core::statement::{Column, Condition, Statement, Value};
use serde::Deserialize;
use std::sync::Arc;

/// Table of the project grant member projection.
pub const PROJECT_GRANT_MEMBERS_TABLE: &str = "projections.project_grant_members3";

/// Column names of [`PROJECT_GRANT_MEMBERS_TABLE`] beyond the shared member columns.
pub mod grant_member_columns {
    pub use crate::member::member_columns::*;

    /// Project the grant belongs to.
    pub const PROJECT_ID: &str = "project_id";
    /// Grant the user is member of.
    pub const GRANT_ID: &str = "grant_id";
    /// Organization the grant targets.
    pub const GRANTED_ORG: &str = "granted_org";
    /// Set when the granted organization is removed.
    pub const GRANTED_ORG_REMOVED: &str = "granted_org_removed";
}

use grant_member_columns as col;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberPayload {
    user_id: String,
    grant_id: String,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRef {
    user_id: String,
    grant_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantRef {
    grant_id: String,
}

/// Projects project grant memberships.
pub struct ProjectGrantMemberProjection {
    table: Table,
    lookups: Lookups,
    registry: ReducerRegistry<Self>,
}

impl ProjectGrantMemberProjection {
    /// Build the projection; `reader` serves the user and grant lookups.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the reducer wiring is inconsistent.
    pub fn new(reader: Arc<dyn ProjectionReader>) -> Result<Self, RegistryError> {
        let registry = ReducerRegistry::new(vec![
            AggregateReducer::new(
                AggregateType::Project,
                vec![
                    EventReducer::lookup(ProjectEventType::GrantMemberAdded, Self::reduce_added),
                    EventReducer::pure(ProjectEventType::GrantMemberChanged, Self::reduce_changed),
                    EventReducer::pure(ProjectEventType::GrantMemberRemoved, Self::reduce_removed),
                    EventReducer::pure(
                        ProjectEventType::GrantMemberCascadeRemoved,
                        Self::reduce_removed,
                    ),
                    EventReducer::pure(ProjectEventType::Removed, Self::reduce_project_removed),
                    EventReducer::pure(ProjectEventType::GrantRemoved, Self::reduce_grant_removed),
                ],
            ),
            AggregateReducer::new(
                AggregateType::User,
                vec![EventReducer::pure(UserEventType::Removed, Self::reduce_user_removed)],
            ),
            AggregateReducer::new(
                AggregateType::Org,
                vec![EventReducer::pure(OrgEventType::Removed, Self::reduce_org_removed)],
            ),
            shared::instance_removed(PROJECT_GRANT_MEMBERS_TABLE, col::INSTANCE_ID),
        ])?;

        Ok(Self {
            table: table(),
            lookups: Lookups::new(reader),
            registry,
        })
    }

    fn reduce_added<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, ReduceResult> {
        async move {
            let payload: MemberPayload = event.decode()?;
            let user_owner = self
                .lookups
                .user_resource_owner(event, &payload.user_id)
                .await?;
            let granted_org = self
                .lookups
                .granted_org(event, &event.aggregate_id, &payload.grant_id)
                .await?;
            let (Some(user_owner), Some(granted_org)) = (user_owner, granted_org) else {
                tracing::debug!(
                    instance_id = %event.instance_id,
                    sequence = event.sequence,
                    user_id = %payload.user_id,
                    grant_id = %payload.grant_id,
                    "Member of a removed instance, nothing to project"
                );
                return Ok(Statement::no_op(event));
            };

            let mut values =
                member::added_values(event, &payload.user_id, user_owner, payload.roles);
            values.extend([
                Column::new(col::PROJECT_ID, event.aggregate_id.as_str()),
                Column::new(col::GRANT_ID, payload.grant_id),
                Column::new(col::GRANTED_ORG, granted_org),
                Column::new(col::GRANTED_ORG_REMOVED, false),
            ]);

            Ok(Statement::upsert(
                event,
                PROJECT_GRANT_MEMBERS_TABLE,
                values,
                primary_key(),
            ))
        }
        .boxed()
    }

    fn reduce_changed(&self, event: &Event) -> ReduceResult {
        let payload: MemberPayload = event.decode()?;
        Ok(Statement::update(
            event,
            PROJECT_GRANT_MEMBERS_TABLE,
            member::changed_values(event, payload.roles),
            member_key(event, &payload.grant_id, &payload.user_id),
        ))
    }

    fn reduce_removed(&self, event: &Event) -> ReduceResult {
        let payload: MemberRef = event.decode()?;
        Ok(Statement::delete(
            event,
            PROJECT_GRANT_MEMBERS_TABLE,
            member_key(event, &payload.grant_id, &payload.user_id),
        ))
    }

    fn reduce_user_removed(&self, event: &Event) -> ReduceResult {
        Ok(Statement::delete(
            event,
            PROJECT_GRANT_MEMBERS_TABLE,
            member::user_conditions(event),
        ))
    }

    fn reduce_project_removed(&self, event: &Event) -> ReduceResult {
        Ok(Statement::delete(
            event,
            PROJECT_GRANT_MEMBERS_TABLE,
            vec![
                Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Condition::new(col::PROJECT_ID, event.aggregate_id.as_str()),
            ],
        ))
    }

    fn reduce_grant_removed(&self, event: &Event) -> ReduceResult {
        let payload: GrantRef = event.decode()?;
        Ok(Statement::delete(
            event,
            PROJECT_GRANT_MEMBERS_TABLE,
            vec![
                Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Condition::new(col::PROJECT_ID, event.aggregate_id.as_str()),
                Condition::new(col::GRANT_ID, payload.grant_id),
            ],
        ))
    }

    fn reduce_org_removed(&self, event: &Event) -> ReduceResult {
        let mut operations = member::org_removed_operations(PROJECT_GRANT_MEMBERS_TABLE, event);
        operations.push(member::mark_org_removed(
            PROJECT_GRANT_MEMBERS_TABLE,
            event,
            col::GRANTED_ORG_REMOVED,
            col::GRANTED_ORG,
        ));
        Ok(Statement::multi(event, operations))
    }
}

impl Projection for ProjectGrantMemberProjection {
    fn name(&self) -> &'static str {
        PROJECT_GRANT_MEMBERS_TABLE
    }

    fn table(&self) -> &Table {
        &self.table
    }

    fn registry(&self) -> &ReducerRegistry<Self> {
        &self.registry
    }
}

fn primary_key() -> Vec<&'static str> {
    vec![col::INSTANCE_ID, col::PROJECT_ID, col::GRANT_ID, col::USER_ID]
}

fn member_key(event: &Event, grant_id: &str, user_id: &str) -> Vec<Condition> {
    vec![
        Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
        Condition::new(col::PROJECT_ID, event.aggregate_id.as_str()),
        Condition::new(col::GRANT_ID, grant_id),
        Condition::new(col::USER_ID, user_id),
    ]
}

fn table() -> Table {
    let mut columns = vec![
        ColumnDef::new(col::PROJECT_ID, ColumnType::Text),
        ColumnDef::new(col::GRANT_ID, ColumnType::Text),
        ColumnDef::new(col::GRANTED_ORG, ColumnType::Text),
        ColumnDef::new(col::GRANTED_ORG_REMOVED, ColumnType::Bool).default(Value::Bool(false)),
    ];
    columns.extend(member::columns());

    member::indexes().into_iter().fold(
        Table::new(PROJECT_GRANT_MEMBERS_TABLE, columns, primary_key()),
        Table::with_index,
    )
    .with_index(Index::new(col::GRANTED_ORG_REMOVED, vec![col::GRANTED_ORG_REMOVED]))
}
