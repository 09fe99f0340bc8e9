//! proptest strategies for projection tests.

use proptest::prelude::*;

/// A role set of zero to three distinct roles.
pub fn arb_roles() -> impl Strategy<Value = Vec<String>> {
    prop::sample::subsequence(vec!["viewer", "editor", "owner", "auditor"], 0..=3)
        .prop_map(|roles| roles.into_iter().map(String::from).collect())
}

/// A runner batch size between 1 and 16.
pub fn arb_batch_size() -> impl Strategy<Value = usize> {
    1_usize..=16
}

/// One step of a grant member's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberStep {
    /// Add the member with roles.
    Add(Vec<String>),
    /// Change the member's roles.
    Change(Vec<String>),
    /// Remove the member.
    Remove,
    /// Remove the member's user and create it again.
    RecreateUser,
    /// Remove the grant and create it again.
    RecreateGrant,
    /// Remove the grant's project and create the grant again.
    RecreateProject,
}

/// A history of up to `max_len` member steps.
pub fn arb_member_history(max_len: usize) -> impl Strategy<Value = Vec<MemberStep>> {
    let step = prop_oneof![
        arb_roles().prop_map(MemberStep::Add),
        arb_roles().prop_map(MemberStep::Change),
        Just(MemberStep::Remove),
        Just(MemberStep::RecreateUser),
        Just(MemberStep::RecreateGrant),
        Just(MemberStep::RecreateProject),
    ];
    prop::collection::vec(step, 1..=max_len)
}
