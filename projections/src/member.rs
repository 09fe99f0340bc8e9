//! Columns and statement builders shared by membership tables.
//!
//! A membership row describes one user's roles on one resource. The resource
//! specific key columns (project, grant, ...) are added by each membership
//! projection; everything here is common to all of them.

use projector_core::event::Event;
use projector_core::schema::{ColumnDef, ColumnType, Index};
use projector_core::statement::{Column, Condition, Operation, Value};

/// Column names shared by membership tables.
pub mod member_columns {
    /// Tenant.
    pub const INSTANCE_ID: &str = "instance_id";
    /// Member user.
    pub const USER_ID: &str = "user_id";
    /// Organization owning the member user.
    pub const USER_RESOURCE_OWNER: &str = "user_resource_owner";
    /// Set when the user's organization is removed.
    pub const USER_OWNER_REMOVED: &str = "user_owner_removed";
    /// Roles of the member.
    pub const ROLES: &str = "roles";
    /// Organization owning the resource.
    pub const RESOURCE_OWNER: &str = "resource_owner";
    /// Set when the resource's organization is removed.
    pub const OWNER_REMOVED: &str = "owner_removed";
    /// Creation date of the membership.
    pub const CREATION_DATE: &str = "creation_date";
    /// Date of the last applied event.
    pub const CHANGE_DATE: &str = "change_date";
    /// Sequence of the last applied event.
    pub const SEQUENCE: &str = "sequence";
}

use member_columns as col;

/// Column definitions every membership table starts with.
pub(crate) fn columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new(col::CREATION_DATE, ColumnType::Timestamp),
        ColumnDef::new(col::CHANGE_DATE, ColumnType::Timestamp),
        ColumnDef::new(col::USER_ID, ColumnType::Text),
        ColumnDef::new(col::USER_RESOURCE_OWNER, ColumnType::Text),
        ColumnDef::new(col::USER_OWNER_REMOVED, ColumnType::Bool).default(Value::Bool(false)),
        ColumnDef::new(col::ROLES, ColumnType::TextArray).nullable(),
        ColumnDef::new(col::SEQUENCE, ColumnType::Int64),
        ColumnDef::new(col::RESOURCE_OWNER, ColumnType::Text),
        ColumnDef::new(col::INSTANCE_ID, ColumnType::Text),
        ColumnDef::new(col::OWNER_REMOVED, ColumnType::Bool).default(Value::Bool(false)),
    ]
}

/// Secondary indexes every membership table carries.
pub(crate) fn indexes() -> Vec<Index> {
    vec![
        Index::new(col::USER_ID, vec![col::USER_ID]),
        Index::new(col::OWNER_REMOVED, vec![col::OWNER_REMOVED]),
        Index::new(col::USER_OWNER_REMOVED, vec![col::USER_OWNER_REMOVED]),
    ]
}

/// Values of a new membership row, before the resource specific columns.
pub(crate) fn added_values(
    event: &Event,
    user_id: &str,
    user_resource_owner: String,
    roles: Vec<String>,
) -> Vec<Column> {
    vec![
        Column::new(col::INSTANCE_ID, event.instance_id.as_str()),
        Column::new(col::USER_ID, user_id),
        Column::new(col::USER_RESOURCE_OWNER, user_resource_owner),
        Column::new(col::USER_OWNER_REMOVED, false),
        Column::new(col::ROLES, roles),
        Column::new(col::RESOURCE_OWNER, event.resource_owner.as_str()),
        Column::new(col::OWNER_REMOVED, false),
        Column::new(col::CREATION_DATE, event.created_at),
        Column::new(col::CHANGE_DATE, event.created_at),
        Column::new(col::SEQUENCE, event.sequence),
    ]
}

/// Values written when a member's roles change.
pub(crate) fn changed_values(event: &Event, roles: Vec<String>) -> Vec<Column> {
    vec![
        Column::new(col::ROLES, roles),
        Column::new(col::CHANGE_DATE, event.created_at),
        Column::new(col::SEQUENCE, event.sequence),
    ]
}

/// Sets `flag` on every row of the event's instance whose `reference`
/// column names the removed organization.
pub(crate) fn mark_org_removed(
    table: &'static str,
    event: &Event,
    flag: &'static str,
    reference: &'static str,
) -> Operation {
    Operation::update(
        table,
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
}

/// Operations for `org.removed` on the columns every membership table has.
pub(crate) fn org_removed_operations(table: &'static str, event: &Event) -> Vec<Operation> {
    vec![
        mark_org_removed(table, event, col::OWNER_REMOVED, col::RESOURCE_OWNER),
        mark_org_removed(table, event, col::USER_OWNER_REMOVED, col::USER_RESOURCE_OWNER),
    ]
}

/// Conditions matching every membership of a user in the event's instance.
pub(crate) fn user_conditions(event: &Event) -> Vec<Condition> {
    vec![
        Condition::new(col::INSTANCE_ID, event.instance_id.as_str()),
        Condition::new(col::USER_ID, event.aggregate_id.as_str()),
    ]
}
