//! Membership projections for the projector engine.
//!
//! # Overview
//!
//! - [`ProjectGrantMemberProjection`]: members of project grants with their
//!   denormalized owner, user owner and granted organization
//! - [`UserProjection`] and [`ProjectGrantProjection`]: the projections the
//!   membership lookups read from
//! - [`PostgresProjectionStorage`]: `PostgreSQL` tables, checkpoints and leases
//! - [`MembershipQueries`]: the typed read path
//!
//! # Wiring
//!
//! ```ignore
//! use projector_projections::{register_membership, PostgresProjectionStorage};
//! use projector_runtime::{ProjectionHost, RunnerConfig};
//!
//! let storage = Arc::new(PostgresProjectionStorage::connect(&projections_url).await?);
//! let mut host = ProjectionHost::new(events, storage.clone(), RunnerConfig::from_env()?);
//! register_membership(&mut host, storage)?;
//! ```

pub mod config;
pub mod lookup;
pub mod member;
pub mod postgres;
pub mod project_grant_member;
pub mod project_grants;
pub mod queries;
pub mod shared;
pub mod users;

pub use config::ServiceConfig;
pub use lookup::Lookups;
pub use postgres::PostgresProjectionStorage;
pub use project_grant_member::{PROJECT_GRANT_MEMBERS_TABLE, ProjectGrantMemberProjection};
pub use project_grants::{PROJECT_GRANTS_TABLE, ProjectGrantProjection};
pub use queries::{GrantMember, MembershipQueries};
pub use users::{USERS_TABLE, UserProjection};

use projector_core::projection::ProjectionReader;
use projector_core::reducer::RegistryError;
use projector_runtime::{HostError, ProjectionHost};
use std::sync::Arc;
use thiserror::Error;

/// Errors while assembling the projections.
#[derive(Error, Debug)]
pub enum SetupError {
    /// A projection's reducers are wired inconsistently.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The host rejected a projection.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Register the user, project grant and project grant member projections.
///
/// `reader` must see the tables the first two projections write.
///
/// # Errors
///
/// Returns [`SetupError`] if a projection cannot be built or registered.
pub fn register_membership(
    host: &mut ProjectionHost,
    reader: Arc<dyn ProjectionReader>,
) -> Result<(), SetupError> {
    host.register(UserProjection::new()?)?;
    host.register(ProjectGrantProjection::new()?)?;
    host.register(ProjectGrantMemberProjection::new(reader)?)?;
    Ok(())
}
