//! Typed read path over `projections.project_grant_members3`.
//!
//! Rows whose project organization, user organization or granted organization
//! was removed are never returned.

use crate::project_grant_member::PROJECT_GRANT_MEMBERS_TABLE;
use projector_core::projection::{ProjectionError, Result};
use projector_core::{DateTime, Utc};
use sqlx::postgres::PgPool;

/// One live grant membership.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GrantMember {
    /// Project the grant belongs to.
    pub project_id: String,
    /// Grant id.
    pub grant_id: String,
    /// Member user.
    pub user_id: String,
    /// Organization owning the user.
    pub user_resource_owner: String,
    /// Organization the grant targets.
    pub granted_org: String,
    /// Roles of the member.
    pub roles: Vec<String>,
    /// Organization owning the project.
    pub resource_owner: String,
    /// When the membership was created.
    pub creation_date: DateTime<Utc>,
    /// When it last changed.
    pub change_date: DateTime<Utc>,
    /// Sequence of the last applied event.
    pub sequence: i64,
}

/// Membership queries served from the projection database.
#[derive(Clone, Debug)]
pub struct MembershipQueries {
    pool: PgPool,
}

fn select(filter: &str) -> String {
    format!(
        "SELECT project_id, grant_id, user_id, user_resource_owner, granted_org,
                COALESCE(roles, '{{}}') AS roles, resource_owner,
                creation_date, change_date, sequence
         FROM {PROJECT_GRANT_MEMBERS_TABLE}
         WHERE instance_id = $1 AND {filter}
           AND NOT owner_removed AND NOT user_owner_removed AND NOT granted_org_removed
         ORDER BY user_id, project_id, grant_id"
    )
}

impl MembershipQueries {
    /// Query through `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Members of one project grant.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the query fails.
    pub async fn members_of_grant(
        &self,
        instance_id: &str,
        project_id: &str,
        grant_id: &str,
    ) -> Result<Vec<GrantMember>> {
        sqlx::query_as(&select("project_id = $2 AND grant_id = $3"))
            .bind(instance_id)
            .bind(project_id)
            .bind(grant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to list grant members: {e}")))
    }

    /// Every grant membership of one user.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the query fails.
    pub async fn memberships_of_user(
        &self,
        instance_id: &str,
        user_id: &str,
    ) -> Result<Vec<GrantMember>> {
        sqlx::query_as(&select("user_id = $2"))
            .bind(instance_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to list memberships: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_hide_removed_parents() {
        let sql = select("user_id = $2");
        assert!(sql.contains("FROM projections.project_grant_members3"));
        assert!(sql.contains("NOT granted_org_removed"));
        assert!(sql.contains("COALESCE(roles, '{}')"));
    }
}
