//! `projections.users`: which organization owns each user.
//!
//! Only the columns other projections look up are kept. Grant memberships
//! read `resource_owner` from here to fill `user_resource_owner`.
//!
//! Removed users stay as tombstones (`removed = true`) so membership events
//! replayed behind the removal still resolve the owner.

use crate::shared;
use projector_core::aggregate::{AggregateType, OrgEventType, UserEventType};
use projector_core::event::Event;
use projector_core::projection::Projection;
use projector_core::reducer::{
    AggregateReducer, EventReducer, ReduceResult, ReducerRegistry, RegistryError,
};
use projector_core::schema::{ColumnDef, ColumnType, Index, Table};
use projector_core::statement::{Column, Condition, Statement, Value};

/// Table of the user owner projection.
pub const USERS_TABLE: &str = "projections.users";

/// Column names of [`USERS_TABLE`].
pub mod user_columns {
    /// Tenant.
    pub const INSTANCE_ID: &str = "instance_id";
    /// User id.
    pub const ID: &str = "id";
    /// Owning organization.
    pub const RESOURCE_OWNER: &str = "resource_owner";
    /// Set when the owning organization is removed.
    pub const OWNER_REMOVED: &str = "owner_removed";
    /// Set when the user is removed.
    pub const REMOVED: &str = "removed";
    /// Creation date of the user.
    pub const CREATION_DATE: &str = "creation_date";
    /// Date of the last applied event.
    pub const CHANGE_DATE: &str = "change_date";
    /// Sequence of the last applied event.
    pub const SEQUENCE: &str = "sequence";
}

use user_columns as col;

/// Projects user ownership.
pub struct UserProjection {
    table: Table,
    registry: ReducerRegistry<Self>,
}

impl UserProjection {
    /// Build the projection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the reducer wiring is inconsistent.
    pub fn new() -> Result<Self, RegistryError> {
        let registry = ReducerRegistry::new(vec![
            AggregateReducer::new(
                AggregateType::User,
                vec![
                    EventReducer::pure(UserEventType::HumanAdded, Self::reduce_added),
                    EventReducer::pure(UserEventType::MachineAdded, Self::reduce_added),
                    EventReducer::pure(UserEventType::Removed, Self::reduce_removed),
                ],
            ),
            AggregateReducer::new(
                AggregateType::Org,
                vec![EventReducer::pure(OrgEventType::Removed, Self::reduce_owner_removed)],
            ),
            shared::instance_removed(USERS_TABLE, col::INSTANCE_ID),
        ])?;

        Ok(Self {
            table: table(),
            registry,
        })
    }

    fn reduce_added(&self, event: &Event) -> ReduceResult {
        Ok(Statement::upsert(
            event,
            USERS_TABLE,
            vec![
                Column::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Column::new(col::ID, event.aggregate_id.as_str()),
                Column::new(col::RESOURCE_OWNER, event.resource_owner.as_str()),
                Column::new(col::OWNER_REMOVED, false),
                Column::new(col::REMOVED, false),
                Column::new(col::CREATION_DATE, event.created_at),
                Column::new(col::CHANGE_DATE, event.created_at),
                Column::new(col::SEQUENCE, event.sequence),
            ],
            vec![col::INSTANCE_ID, col::ID],
        ))
    }

    fn reduce_removed(&self, event: &Event) -> ReduceResult {
        Ok(Statement::update(
            event,
            USERS_TABLE,
            vec![
                Column::new(col::REMOVED, true),
                Column::new(col::CHANGE_DATE, event.created_at),
                Column::new(col::SEQUENCE, event.sequence),
            ],
            vec![
                Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Condition::new(col::ID, event.aggregate_id.as_str()),
            ],
        ))
    }

    fn reduce_owner_removed(&self, event: &Event) -> ReduceResult {
        Ok(Statement::update(
            event,
            USERS_TABLE,
            vec![
                Column::new(col::OWNER_REMOVED, true),
                Column::new(col::CHANGE_DATE, event.created_at),
                Column::new(col::SEQUENCE, event.sequence),
            ],
            vec![
                Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
                Condition::new(col::RESOURCE_OWNER, event.aggregate_id.as_str()),
            ],
        ))
    }
}

impl Projection for UserProjection {
    fn name(&self) -> &'static str {
        USERS_TABLE
    }

    fn table(&self) -> &Table {
        &self.table
    }

    fn registry(&self) -> &ReducerRegistry<Self> {
        &self.registry
    }
}

fn table() -> Table {
    Table::new(
        USERS_TABLE,
        vec![
            ColumnDef::new(col::INSTANCE_ID, ColumnType::Text),
            ColumnDef::new(col::ID, ColumnType::Text),
            ColumnDef::new(col::RESOURCE_OWNER, ColumnType::Text),
            ColumnDef::new(col::OWNER_REMOVED, ColumnType::Bool).default(Value::Bool(false)),
            ColumnDef::new(col::REMOVED, ColumnType::Bool).default(Value::Bool(false)),
            ColumnDef::new(col::CREATION_DATE, ColumnType::Timestamp),
            ColumnDef::new(col::CHANGE_DATE, ColumnType::Timestamp),
            ColumnDef::new(col::SEQUENCE, ColumnType::Int64),
        ],
        vec![col::INSTANCE_ID, col::ID],
    )
    .with_index(Index::new(col::RESOURCE_OWNER, vec![col::RESOURCE_OWNER]))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use projector_core::reducer::Reduction;
    use projector_core::statement::Operation;
    use projector_testing::fixtures;

    #[test]
    fn table_is_valid() {
        assert_eq!(UserProjection::new().unwrap().table().validate(), Ok(()));
    }

    #[tokio::test]
    async fn machine_users_are_projected_like_humans() {
        let projection = UserProjection::new().unwrap();
        let human = projection.reduce(&fixtures::human_added("i", "org", "u")).await;
        let machine = projection.reduce(&fixtures::machine_added("i", "org", "u")).await;
        assert_eq!(human, machine);
    }

    #[tokio::test]
    async fn org_removal_marks_owned_users() {
        let projection = UserProjection::new().unwrap();
        let reduction = projection.reduce(&fixtures::org_removed("i", "org-a")).await;
        let Reduction::Applied(statement) = reduction else {
            unreachable!("org removal always produces a statement");
        };
        assert!(matches!(
            &statement.operations[..],
            [Operation::Update { conditions, .. }]
                if conditions.contains(&Condition::new(col::RESOURCE_OWNER, "org-a"))
        ));
    }

    #[tokio::test]
    async fn user_removal_keeps_a_tombstone() {
        let projection = UserProjection::new().unwrap();
        let reduction = projection
            .reduce(&fixtures::user_removed("i", "org-a", "u"))
            .await;
        let Reduction::Applied(statement) = reduction else {
            unreachable!("user removal always produces a statement");
        };
        assert!(matches!(
            &statement.operations[..],
            [Operation::Update { values, conditions, .. }]
                if values.contains(&Column::new(col::REMOVED, true))
                    && conditions.contains(&Condition::new(col::ID, "u"))
        ));
    }

    #[tokio::test]
    async fn project_events_are_not_handled() {
        let projection = UserProjection::new().unwrap();
        let reduction = projection
            .reduce(&fixtures::grant_removed("i", "org", "p", "g"))
            .await;
        assert_eq!(reduction, Reduction::Ignored);
    }
}
