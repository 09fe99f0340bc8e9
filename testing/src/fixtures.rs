//! Event builders for membership scenarios.
//!
//! Every builder returns an event with sequence `0`; append it to an
//! [`InMemoryEventStore`](crate::InMemoryEventStore) to get a real sequence.
//! Payloads use the field names of the production event log (`userId`,
//! `grantId`, `grantedOrgId`, `roles`).

use chrono::{DateTime, Utc};
use projector_core::aggregate::{
    InstanceEventType, OrgEventType, ProjectEventType, UserEventType,
};
use projector_core::event::Event;
use serde_json::json;

/// Fixed creation date used by every fixture (2025-01-01 00:00:00 UTC).
#[must_use]
pub fn test_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

fn event(
    instance_id: &str,
    event_type: impl Into<projector_core::aggregate::EventType>,
    aggregate_id: &str,
    resource_owner: &str,
    payload: serde_json::Value,
) -> Event {
    Event::builder(instance_id, event_type, aggregate_id)
        .resource_owner(resource_owner)
        .created_at(test_time())
        .payload(payload)
        .build()
}

/// `user.human.added` for `user_id` owned by `org`.
#[must_use]
pub fn human_added(instance_id: &str, org: &str, user_id: &str) -> Event {
    event(
        instance_id,
        UserEventType::HumanAdded,
        user_id,
        org,
        json!({ "userName": user_id }),
    )
}

/// `user.machine.added` for `user_id` owned by `org`.
#[must_use]
pub fn machine_added(instance_id: &str, org: &str, user_id: &str) -> Event {
    event(
        instance_id,
        UserEventType::MachineAdded,
        user_id,
        org,
        json!({ "userName": user_id, "name": user_id }),
    )
}

/// `user.removed`.
#[must_use]
pub fn user_removed(instance_id: &str, org: &str, user_id: &str) -> Event {
    event(
        instance_id,
        UserEventType::Removed,
        user_id,
        org,
        json!({ "userName": user_id }),
    )
}

/// `project.grant.added`: `granted_org` gains access to `project` owned by `org`.
#[must_use]
pub fn grant_added(
    instance_id: &str,
    org: &str,
    project: &str,
    grant: &str,
    granted_org: &str,
) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantAdded,
        project,
        org,
        json!({ "grantId": grant, "grantedOrgId": granted_org, "roleKeys": ["viewer"] }),
    )
}

/// `project.grant.changed`.
#[must_use]
pub fn grant_changed(
    instance_id: &str,
    org: &str,
    project: &str,
    grant: &str,
    roles: &[&str],
) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantChanged,
        project,
        org,
        json!({ "grantId": grant, "roleKeys": roles }),
    )
}

/// `project.grant.removed`.
#[must_use]
pub fn grant_removed(instance_id: &str, org: &str, project: &str, grant: &str) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantRemoved,
        project,
        org,
        json!({ "grantId": grant }),
    )
}

/// `project.removed`.
#[must_use]
pub fn project_removed(instance_id: &str, org: &str, project: &str) -> Event {
    event(
        instance_id,
        ProjectEventType::Removed,
        project,
        org,
        json!({ "name": project }),
    )
}

/// `project.grant.member.added`.
#[must_use]
pub fn member_added(
    instance_id: &str,
    org: &str,
    project: &str,
    grant: &str,
    user_id: &str,
    roles: &[&str],
) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantMemberAdded,
        project,
        org,
        json!({ "userId": user_id, "grantId": grant, "roles": roles }),
    )
}

/// `project.grant.member.changed`.
#[must_use]
pub fn member_changed(
    instance_id: &str,
    org: &str,
    project: &str,
    grant: &str,
    user_id: &str,
    roles: &[&str],
) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantMemberChanged,
        project,
        org,
        json!({ "userId": user_id, "grantId": grant, "roles": roles }),
    )
}

/// `project.grant.member.removed`.
#[must_use]
pub fn member_removed(
    instance_id: &str,
    org: &str,
    project: &str,
    grant: &str,
    user_id: &str,
) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantMemberRemoved,
        project,
        org,
        json!({ "userId": user_id, "grantId": grant }),
    )
}

/// `project.grant.member.cascade.removed`.
#[must_use]
pub fn member_cascade_removed(
    instance_id: &str,
    org: &str,
    project: &str,
    grant: &str,
    user_id: &str,
) -> Event {
    event(
        instance_id,
        ProjectEventType::GrantMemberCascadeRemoved,
        project,
        org,
        json!({ "userId": user_id, "grantId": grant }),
    )
}

/// `org.removed`.
#[must_use]
pub fn org_removed(instance_id: &str, org: &str) -> Event {
    event(
        instance_id,
        OrgEventType::Removed,
        org,
        org,
        json!({ "name": org }),
    )
}

/// `instance.removed`.
#[must_use]
pub fn instance_removed(instance_id: &str) -> Event {
    event(
        instance_id,
        InstanceEventType::Removed,
        instance_id,
        instance_id,
        json!({}),
    )
}
