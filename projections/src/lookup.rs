//! Reads of other projections' current state, used to fill denormalized columns.
//!
//! Lookups see whatever the owning projection has committed so far. A missing
//! row is read against the owning projection's checkpoint:
//!
//! - checkpoint before the event: that projection has not caught up yet,
//!   reported as [`ReduceError::Unresolved`] so the runner defers and retries;
//! - checkpoint at or past the event: the row is gone for good (its instance
//!   was removed), reported as `None`.
//!
//! Users, grants and projects removed on their own keep a tombstone row, so
//! their values stay readable.

use crate::project_grants::{PROJECT_GRANTS_TABLE, grant_columns};
use crate::users::{USERS_TABLE, user_columns};
use projector_core::event::Event;
use projector_core::projection::ProjectionReader;
use projector_core::reducer::ReduceError;
use projector_core::statement::Condition;
use std::sync::Arc;

/// Cross-projection lookups for reducers.
#[derive(Clone)]
pub struct Lookups {
    reader: Arc<dyn ProjectionReader>,
}

impl Lookups {
    /// Read through `reader`.
    #[must_use]
    pub fn new(reader: Arc<dyn ProjectionReader>) -> Self {
        Self { reader }
    }

    /// Organization owning `user_id`, as of `event`.
    ///
    /// Returns `None` if the users projection already passed `event` and has
    /// no row for the user.
    ///
    /// # Errors
    ///
    /// [`ReduceError::Unresolved`] if the user is not projected yet,
    /// [`ReduceError::Lookup`] if the read fails.
    pub async fn user_resource_owner(
        &self,
        event: &Event,
        user_id: &str,
    ) -> Result<Option<String>, ReduceError> {
        let conditions = [
            Condition::new(user_columns::INSTANCE_ID, event.instance_id.as_str()),
            Condition::new(user_columns::ID, user_id),
        ];
        self.select(
            event,
            USERS_TABLE,
            user_columns::RESOURCE_OWNER,
            &conditions,
            "user resource owner",
            user_id,
        )
        .await
    }

    /// Organization granted access by `grant_id` of `project_id`, as of `event`.
    ///
    /// Returns `None` if the grant projection already passed `event` and has
    /// no row for the grant.
    ///
    /// # Errors
    ///
    /// [`ReduceError::Unresolved`] if the grant is not projected yet,
    /// [`ReduceError::Lookup`] if the read fails.
    pub async fn granted_org(
        &self,
        event: &Event,
        project_id: &str,
        grant_id: &str,
    ) -> Result<Option<String>, ReduceError> {
        let conditions = [
            Condition::new(grant_columns::INSTANCE_ID, event.instance_id.as_str()),
            Condition::new(grant_columns::PROJECT_ID, project_id),
            Condition::new(grant_columns::GRANT_ID, grant_id),
        ];
        self.select(
            event,
            PROJECT_GRANTS_TABLE,
            grant_columns::GRANTED_ORG,
            &conditions,
            "granted org",
            grant_id,
        )
        .await
    }

    /// `table` doubles as the name of the projection owning it.
    async fn select(
        &self,
        event: &Event,
        table: &'static str,
        column: &'static str,
        conditions: &[Condition],
        dependency: &'static str,
        key: &str,
    ) -> Result<Option<String>, ReduceError> {
        let value = self
            .reader
            .select_text(table, column, conditions)
            .await
            .map_err(|e| ReduceError::Lookup(e.to_string()))?;
        if value.is_some() {
            return Ok(value);
        }

        let passed = self
            .reader
            .read_checkpoint(table, &event.instance_id)
            .await
            .map_err(|e| ReduceError::Lookup(e.to_string()))?
            .is_some_and(|checkpoint| checkpoint.sequence >= event.sequence);
        if passed {
            return Ok(None);
        }

        Err(ReduceError::Unresolved {
            dependency,
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::project_grants::ProjectGrantProjection;
    use crate::users::UserProjection;
    use projector_core::projection::{Batch, Projection, ProjectionStorage};
    use projector_core::statement::{Column, Statement};
    use projector_testing::{InMemoryProjectionStorage, fixtures};

    async fn storage() -> InMemoryProjectionStorage {
        let storage = InMemoryProjectionStorage::new();
        storage
            .ensure_table(UserProjection::new().unwrap().table())
            .await
            .unwrap();
        storage
            .ensure_table(ProjectGrantProjection::new().unwrap().table())
            .await
            .unwrap();
        storage
    }

    fn member_added(instance_id: &str, sequence: u64) -> Event {
        let mut event = fixtures::member_added(instance_id, "org-p", "p", "g", "u", &["viewer"]);
        event.sequence = sequence;
        event
    }

    #[tokio::test]
    async fn resolves_projected_user_owner() {
        let storage = storage().await;
        storage.seed(
            USERS_TABLE,
            vec![
                Column::new("instance_id", "i"),
                Column::new("id", "u"),
                Column::new("resource_owner", "org-a"),
                Column::new("creation_date", projector_testing::test_time()),
                Column::new("change_date", projector_testing::test_time()),
                Column::new("sequence", 1_i64),
            ],
        );
        let lookups = Lookups::new(Arc::new(storage));

        assert_eq!(
            lookups.user_resource_owner(&member_added("i", 3), "u").await.unwrap(),
            Some("org-a".to_string())
        );
        assert!(matches!(
            lookups.user_resource_owner(&member_added("other", 3), "u").await,
            Err(ReduceError::Unresolved { dependency: "user resource owner", .. })
        ));
    }

    #[tokio::test]
    async fn tombstoned_user_still_resolves() {
        let storage = storage().await;
        storage.seed(
            USERS_TABLE,
            vec![
                Column::new("instance_id", "i"),
                Column::new("id", "u"),
                Column::new("resource_owner", "org-a"),
                Column::new("removed", true),
                Column::new("creation_date", projector_testing::test_time()),
                Column::new("change_date", projector_testing::test_time()),
                Column::new("sequence", 9_i64),
            ],
        );
        let lookups = Lookups::new(Arc::new(storage));

        assert_eq!(
            lookups.user_resource_owner(&member_added("i", 3), "u").await.unwrap(),
            Some("org-a".to_string())
        );
    }

    #[tokio::test]
    async fn missing_grant_is_unresolved_and_retryable() {
        let lookups = Lookups::new(Arc::new(storage().await));
        let err = lookups
            .granted_org(&member_added("i", 3), "p", "g")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            err,
            ReduceError::Unresolved {
                dependency: "granted org",
                key: "g".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_row_behind_the_owning_checkpoint_is_gone() {
        let storage = storage().await;
        let mut removed = fixtures::instance_removed("i");
        removed.sequence = 5;
        let mut batch = Batch::new(PROJECT_GRANTS_TABLE, "i", None);
        batch.push(Statement::no_op(&removed));
        storage.apply(&batch).await.unwrap();
        let lookups = Lookups::new(Arc::new(storage));

        assert_eq!(
            lookups.granted_org(&member_added("i", 3), "p", "g").await.unwrap(),
            None
        );
        assert!(matches!(
            lookups.granted_org(&member_added("i", 6), "p", "g").await,
            Err(ReduceError::Unresolved { .. })
        ));
    }

    #[tokio::test]
    async fn unprovisioned_tables_are_lookup_failures() {
        let lookups = Lookups::new(Arc::new(InMemoryProjectionStorage::new()));
        let err = lookups
            .granted_org(&member_added("i", 3), "p", "g")
            .await
            .unwrap_err();
        assert!(matches!(err, ReduceError::Lookup(_)));
        assert!(err.is_retryable());
    }
}
