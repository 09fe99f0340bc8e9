//! End-to-end membership scenarios against the in-memory backends.
//!
//! Every test appends events to an [`InMemoryEventStore`] and lets the user,
//! project grant and project grant member runners catch up, in that order,
//! until none of them makes progress.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use projector_core::event::Event;
use projector_core::projection::{Batch, Projection, ProjectionStorage};
use projector_core::reducer::Reduction;
use projector_core::statement::{Column, Value};
use projector_projections::{
    PROJECT_GRANT_MEMBERS_TABLE, ProjectGrantMemberProjection, ProjectGrantProjection,
    UserProjection, register_membership,
};
use projector_runtime::{ProjectionHost, ProjectionRunner, RunnerConfig};
use projector_testing::properties::{MemberStep, arb_batch_size, arb_member_history};
use projector_testing::{InMemoryEventStore, InMemoryProjectionStorage, Row, fixtures};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    events: InMemoryEventStore,
    storage: InMemoryProjectionStorage,
    users: ProjectionRunner<UserProjection>,
    grants: ProjectionRunner<ProjectGrantProjection>,
    members: ProjectionRunner<ProjectGrantMemberProjection>,
}

fn config(batch_size: usize) -> RunnerConfig {
    RunnerConfig::builder()
        .batch_size(batch_size)
        .worker_id("membership-tests")
        .build()
        .unwrap()
}

fn runner<P: Projection>(
    projection: P,
    events: &InMemoryEventStore,
    storage: &InMemoryProjectionStorage,
    batch_size: usize,
) -> ProjectionRunner<P> {
    ProjectionRunner::new(
        Arc::new(projection),
        Arc::new(events.clone()),
        Arc::new(storage.clone()),
        config(batch_size),
    )
}

impl Harness {
    async fn new(batch_size: usize) -> Self {
        let events = InMemoryEventStore::new();
        let storage = InMemoryProjectionStorage::new();

        let users = UserProjection::new().unwrap();
        let grants = ProjectGrantProjection::new().unwrap();
        let members = ProjectGrantMemberProjection::new(Arc::new(storage.clone())).unwrap();
        for table in [users.table(), grants.table(), members.table()] {
            storage.ensure_table(table).await.unwrap();
        }

        Self {
            users: runner(users, &events, &storage, batch_size),
            grants: runner(grants, &events, &storage, batch_size),
            members: runner(members, &events, &storage, batch_size),
            events,
            storage,
        }
    }

    fn append(&self, events: impl IntoIterator<Item = Event>) {
        self.events.append_all(events);
    }

    /// Run all three projections until none of them applies anything.
    async fn catch_up(&self) -> usize {
        loop {
            let users = self.users.run_once().await.unwrap();
            let grants = self.grants.run_once().await.unwrap();
            let members = self.members.run_once().await.unwrap();

            let progressed = [users, grants, members]
                .iter()
                .any(|pass| pass.applied > 0 || pass.has_more);
            if !progressed {
                return members.deferred;
            }
        }
    }

    fn members(&self) -> Vec<Row> {
        self.storage.rows(PROJECT_GRANT_MEMBERS_TABLE)
    }

    fn member(&self, instance: &str, project: &str, grant: &str, user: &str) -> Option<Row> {
        self.storage
            .find(
                PROJECT_GRANT_MEMBERS_TABLE,
                &[
                    ("instance_id", Value::from(instance)),
                    ("project_id", Value::from(project)),
                    ("grant_id", Value::from(grant)),
                    ("user_id", Value::from(user)),
                ],
            )
            .pop()
    }
}

fn roles(roles: &[&str]) -> Value {
    Value::TextArray(roles.iter().map(ToString::to_string).collect())
}

/// User `u` owned by `org-a`, project `p` owned by `org-p`, grant `g` to `org-b`.
fn base_events(instance: &str) -> Vec<Event> {
    vec![
        fixtures::human_added(instance, "org-a", "u"),
        fixtures::grant_added(instance, "org-p", "p", "g", "org-b"),
    ]
}

#[tokio::test]
async fn member_added_resolves_user_owner_and_granted_org() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"])]);
    assert_eq!(h.catch_up().await, 0);

    let row = h.member("t", "p", "g", "u").expect("member row");
    assert_eq!(row["user_resource_owner"], Value::from("org-a"));
    assert_eq!(row["granted_org"], Value::from("org-b"));
    assert_eq!(row["resource_owner"], Value::from("org-p"));
    assert_eq!(row["roles"], roles(&["viewer"]));
    assert_eq!(row["granted_org_removed"], Value::Bool(false));
    assert_eq!(row["owner_removed"], Value::Bool(false));
    assert_eq!(row["user_owner_removed"], Value::Bool(false));
    assert_eq!(row["sequence"], Value::Int(3));
    assert_eq!(row["creation_date"], Value::Timestamp(fixtures::test_time()));
}

#[tokio::test]
async fn member_changed_rewrites_roles_and_keeps_the_key() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_changed("t", "org-p", "p", "g", "u", &["viewer", "editor"]),
    ]);
    h.catch_up().await;

    assert_eq!(h.members().len(), 1);
    let row = h.member("t", "p", "g", "u").unwrap();
    assert_eq!(row["roles"], roles(&["viewer", "editor"]));
    assert_eq!(row["sequence"], Value::Int(4));
}

#[tokio::test]
async fn member_changed_after_removal_matches_nothing() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_removed("t", "org-p", "p", "g", "u"),
        fixtures::member_changed("t", "org-p", "p", "g", "u", &["owner"]),
    ]);
    h.catch_up().await;

    assert!(h.members().is_empty());
    assert_eq!(
        h.storage
            .checkpoint(PROJECT_GRANT_MEMBERS_TABLE, "t")
            .unwrap()
            .sequence,
        5
    );
}

#[tokio::test]
async fn grant_removed_deletes_only_that_grant() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::grant_added("t", "org-p", "p", "g2", "org-c"),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g2", "u", &["viewer"]),
    ]);
    h.catch_up().await;
    assert_eq!(h.members().len(), 2);

    h.append([fixtures::grant_removed("t", "org-p", "p", "g")]);
    h.catch_up().await;

    assert!(h.member("t", "p", "g", "u").is_none());
    assert!(h.member("t", "p", "g2", "u").is_some());
}

#[tokio::test]
async fn project_and_cascade_removals_delete_their_rows() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::human_added("t", "org-a", "u2"),
        fixtures::grant_added("t", "org-q", "q", "h", "org-b"),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g", "u2", &["viewer"]),
        fixtures::member_added("t", "org-q", "q", "h", "u", &["viewer"]),
    ]);
    h.catch_up().await;
    assert_eq!(h.members().len(), 3);

    h.append([fixtures::member_cascade_removed("t", "org-p", "p", "g", "u2")]);
    h.catch_up().await;
    assert!(h.member("t", "p", "g", "u2").is_none());
    assert_eq!(h.members().len(), 2);

    h.append([fixtures::project_removed("t", "org-p", "p")]);
    h.catch_up().await;
    assert!(h.member("t", "p", "g", "u").is_none());
    assert!(h.member("t", "q", "h", "u").is_some());
}

#[tokio::test]
async fn user_removed_deletes_every_membership_of_the_user() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::human_added("t", "org-a", "other"),
        fixtures::grant_added("t", "org-p", "p", "g2", "org-c"),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g2", "u", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g", "other", &["viewer"]),
    ]);
    h.catch_up().await;

    h.append([fixtures::user_removed("t", "org-a", "u")]);
    h.catch_up().await;

    let remaining: Vec<Value> = h.members().into_iter().map(|row| row["user_id"].clone()).collect();
    assert_eq!(remaining, vec![Value::from("other")]);
}

#[tokio::test]
async fn org_removal_flags_granted_rows_without_deleting_them() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::grant_added("t", "org-p", "p", "g2", "org-c"),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g2", "u", &["viewer"]),
    ]);
    h.catch_up().await;

    h.append([fixtures::org_removed("t", "org-b")]);
    h.catch_up().await;

    assert_eq!(h.members().len(), 2);
    let flagged = h.member("t", "p", "g", "u").unwrap();
    assert_eq!(flagged["granted_org_removed"], Value::Bool(true));
    assert_eq!(flagged["owner_removed"], Value::Bool(false));
    assert_eq!(flagged["user_owner_removed"], Value::Bool(false));
    assert_eq!(flagged["sequence"], Value::Int(6));

    let untouched = h.member("t", "p", "g2", "u").unwrap();
    assert_eq!(untouched["granted_org_removed"], Value::Bool(false));
    assert_eq!(untouched["sequence"], Value::Int(5));
}

#[tokio::test]
async fn org_removal_cascades_to_every_referencing_column() {
    let h = Harness::new(100).await;
    // org-x owns the project, the user and is the granted org of g.
    h.append([
        fixtures::human_added("t", "org-x", "u"),
        fixtures::human_added("t", "org-y", "v"),
        fixtures::grant_added("t", "org-x", "p", "g", "org-x"),
        fixtures::grant_added("t", "org-z", "q", "h", "org-y"),
        fixtures::member_added("t", "org-x", "p", "g", "u", &["viewer"]),
        fixtures::member_added("t", "org-z", "q", "h", "v", &["viewer"]),
        fixtures::member_added("t", "org-z", "q", "h", "u", &["viewer"]),
        fixtures::human_added("other", "org-x", "u"),
        fixtures::grant_added("other", "org-x", "p", "g", "org-x"),
        fixtures::member_added("other", "org-x", "p", "g", "u", &["viewer"]),
    ]);
    h.catch_up().await;

    h.append([fixtures::org_removed("t", "org-x")]);
    h.catch_up().await;

    let flags = |row: &Row| {
        (
            row["owner_removed"].as_bool().unwrap(),
            row["user_owner_removed"].as_bool().unwrap(),
            row["granted_org_removed"].as_bool().unwrap(),
        )
    };
    assert_eq!(flags(&h.member("t", "p", "g", "u").unwrap()), (true, true, true));
    assert_eq!(flags(&h.member("t", "q", "h", "u").unwrap()), (false, true, false));
    assert_eq!(flags(&h.member("t", "q", "h", "v").unwrap()), (false, false, false));
    assert_eq!(
        flags(&h.member("other", "p", "g", "u").unwrap()),
        (false, false, false)
    );
}

#[tokio::test]
async fn instance_removed_deletes_every_row_of_the_instance() {
    let h = Harness::new(100).await;
    for instance in ["t", "t2"] {
        h.append(base_events(instance));
        h.append([fixtures::member_added(instance, "org-p", "p", "g", "u", &["viewer"])]);
    }
    h.catch_up().await;
    assert_eq!(h.members().len(), 2);

    h.append([fixtures::instance_removed("t")]);
    h.catch_up().await;

    assert!(h.member("t", "p", "g", "u").is_none());
    assert!(h.member("t2", "p", "g", "u").is_some());
    assert!(
        h.storage
            .find("projections.users", &[("instance_id", Value::from("t"))])
            .is_empty()
    );
}

#[tokio::test]
async fn member_added_before_user_is_deferred_until_the_user_is_projected() {
    let h = Harness::new(100).await;
    h.append([
        fixtures::grant_added("t", "org-p", "p", "g", "org-b"),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
    ]);

    assert_eq!(h.catch_up().await, 1);
    assert!(h.members().is_empty());
    assert_eq!(h.storage.checkpoint(PROJECT_GRANT_MEMBERS_TABLE, "t"), None);

    h.append([fixtures::human_added("t", "org-a", "u")]);
    assert_eq!(h.catch_up().await, 0);

    let row = h.member("t", "p", "g", "u").unwrap();
    assert_eq!(row["user_resource_owner"], Value::from("org-a"));
    assert_eq!(
        h.storage
            .checkpoint(PROJECT_GRANT_MEMBERS_TABLE, "t")
            .unwrap()
            .sequence,
        2
    );
}

#[tokio::test]
async fn deferral_blocks_later_events_of_the_same_instance() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "missing", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
    ]);

    assert_eq!(h.catch_up().await, 1);
    assert!(h.members().is_empty());
}

#[tokio::test]
async fn removals_apply_without_lookups() {
    let h = Harness::new(100).await;
    for user in ["u", "v"] {
        h.storage.seed(
            PROJECT_GRANT_MEMBERS_TABLE,
            vec![
                Column::new("instance_id", "t"),
                Column::new("project_id", "p"),
                Column::new("grant_id", "g"),
                Column::new("user_id", user),
                Column::new("user_resource_owner", "org-a"),
                Column::new("granted_org", "org-b"),
                Column::new("resource_owner", "org-p"),
                Column::new("creation_date", fixtures::test_time()),
                Column::new("change_date", fixtures::test_time()),
                Column::new("sequence", 0_i64),
            ],
        );
    }
    // Neither the users nor the grants table has a row for these members.
    h.append([
        fixtures::org_removed("t", "org-b"),
        fixtures::user_removed("t", "org-a", "u"),
    ]);

    let pass = h.members.run_once().await.unwrap();
    assert_eq!(pass.applied, 2);
    assert_eq!(pass.deferred, 0);

    assert!(h.member("t", "p", "g", "u").is_none());
    let v = h.member("t", "p", "g", "v").unwrap();
    assert_eq!(v["granted_org_removed"], Value::Bool(true));
}

#[tokio::test]
async fn reapplying_a_statement_gives_the_same_rows() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    let added = h
        .events
        .append(fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]));
    h.catch_up().await;
    let once = h.members();

    let Reduction::Applied(statement) = h.members.projection().reduce(&added).await else {
        unreachable!("user and grant are projected");
    };
    let previous = h.storage.checkpoint(PROJECT_GRANT_MEMBERS_TABLE, "t");
    let mut batch = Batch::new(PROJECT_GRANT_MEMBERS_TABLE, "t", previous);
    batch.push(statement);
    h.storage.apply(&batch).await.unwrap();

    assert_eq!(h.members(), once);
}

#[tokio::test]
async fn rebuild_replays_to_the_same_rows() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_changed("t", "org-p", "p", "g", "u", &["editor"]),
        fixtures::org_removed("t", "org-b"),
    ]);
    h.catch_up().await;
    let before = h.members();

    h.members.rebuild().await.unwrap();
    assert!(h.members().is_empty());
    h.catch_up().await;

    assert_eq!(h.members(), before);
}

#[tokio::test]
async fn removed_user_does_not_block_later_members() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::user_removed("t", "org-a", "u"),
        fixtures::human_added("t", "org-a", "v"),
        fixtures::member_added("t", "org-p", "p", "g", "v", &["viewer"]),
    ]);

    // The users runner applies the removal before the members runner sees
    // the membership that precedes it.
    assert_eq!(h.catch_up().await, 0);

    assert!(h.member("t", "p", "g", "u").is_none());
    assert!(h.member("t", "p", "g", "v").is_some());
    assert_eq!(
        h.storage
            .checkpoint(PROJECT_GRANT_MEMBERS_TABLE, "t")
            .unwrap()
            .sequence,
        6
    );
}

#[tokio::test]
async fn rebuild_after_dependency_removals_replays_to_the_same_rows() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::human_added("t", "org-a", "v"),
        fixtures::grant_added("t", "org-p", "p", "g2", "org-c"),
        fixtures::grant_added("t", "org-q", "q", "h", "org-c"),
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g", "v", &["viewer"]),
        fixtures::member_added("t", "org-p", "p", "g2", "v", &["viewer"]),
        fixtures::member_added("t", "org-q", "q", "h", "v", &["viewer"]),
    ]);
    h.catch_up().await;
    assert_eq!(h.members().len(), 4);

    h.append([
        fixtures::user_removed("t", "org-a", "u"),
        fixtures::grant_removed("t", "org-p", "p", "g2"),
        fixtures::project_removed("t", "org-q", "q"),
    ]);
    h.catch_up().await;
    let before = h.members();
    assert_eq!(before.len(), 1);

    h.members.rebuild().await.unwrap();
    assert_eq!(h.catch_up().await, 0);

    assert_eq!(h.members(), before);
}

#[tokio::test]
async fn removed_grant_does_not_block_members() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::grant_removed("t", "org-p", "p", "g"),
    ]);

    assert_eq!(h.catch_up().await, 0);
    assert!(h.members().is_empty());
    assert_eq!(
        h.storage
            .checkpoint(PROJECT_GRANT_MEMBERS_TABLE, "t")
            .unwrap()
            .sequence,
        4
    );
}

#[tokio::test]
async fn removed_project_does_not_block_members() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::project_removed("t", "org-p", "p"),
    ]);

    assert_eq!(h.catch_up().await, 0);
    assert!(h.members().is_empty());
}

#[tokio::test]
async fn members_lagging_behind_an_instance_removal_catch_up() {
    let h = Harness::new(100).await;
    h.append(base_events("t"));
    h.append([
        fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]),
        fixtures::instance_removed("t"),
    ]);

    h.users.run_once().await.unwrap();
    h.grants.run_once().await.unwrap();
    assert!(
        h.storage
            .find("projections.users", &[("instance_id", Value::from("t"))])
            .is_empty()
    );

    let pass = h.members.run_once().await.unwrap();
    assert_eq!(pass.deferred, 0);
    assert_eq!(pass.applied, 2);
    assert!(h.members().is_empty());
}

#[tokio::test]
async fn host_runs_all_membership_projections() {
    let events = InMemoryEventStore::new();
    let storage = InMemoryProjectionStorage::new();
    events.append_all(base_events("t"));
    events.append(fixtures::member_added("t", "org-p", "p", "g", "u", &["viewer"]));

    let mut host = ProjectionHost::new(
        Arc::new(events.clone()),
        Arc::new(storage.clone()),
        RunnerConfig::builder()
            .poll_interval(Duration::from_millis(5))
            .worker_id("host-test")
            .build()
            .unwrap(),
    );
    register_membership(&mut host, Arc::new(storage.clone())).unwrap();
    assert_eq!(
        host.projections(),
        vec![
            "projections.users",
            "projections.project_grants",
            "projections.project_grant_members3"
        ]
    );

    let (tx, rx) = watch::channel(false);
    let running = host.start(rx).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while storage.rows(PROJECT_GRANT_MEMBERS_TABLE).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("member row should be projected");

    tx.send(true).unwrap();
    running.wait().await.unwrap();
}

async fn project(history: &[MemberStep], batch_size: usize) -> (Vec<Row>, usize) {
    let h = Harness::new(batch_size).await;
    h.append(base_events("t"));
    for step in history {
        match step {
            MemberStep::Add(roles) => {
                let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
                h.append([fixtures::member_added("t", "org-p", "p", "g", "u", &roles)]);
            }
            MemberStep::Change(roles) => {
                let roles: Vec<&str> = roles.iter().map(String::as_str).collect();
                h.append([fixtures::member_changed("t", "org-p", "p", "g", "u", &roles)]);
            }
            MemberStep::Remove => {
                h.append([fixtures::member_removed("t", "org-p", "p", "g", "u")]);
            }
            MemberStep::RecreateUser => h.append([
                fixtures::user_removed("t", "org-a", "u"),
                fixtures::human_added("t", "org-a", "u"),
            ]),
            MemberStep::RecreateGrant => h.append([
                fixtures::grant_removed("t", "org-p", "p", "g"),
                fixtures::grant_added("t", "org-p", "p", "g", "org-b"),
            ]),
            MemberStep::RecreateProject => h.append([
                fixtures::project_removed("t", "org-p", "p"),
                fixtures::grant_added("t", "org-p", "p", "g", "org-b"),
            ]),
        }
    }
    let deferred = h.catch_up().await;
    (h.members(), deferred)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn final_rows_do_not_depend_on_batch_size(
        history in arb_member_history(12),
        batch_size in arb_batch_size(),
    ) {
        let (expected, _) = tokio_test::block_on(project(&history, 500));
        let (actual, deferred) = tokio_test::block_on(project(&history, batch_size));
        prop_assert_eq!(deferred, 0);
        prop_assert_eq!(actual, expected);
    }
}
