//! Aggregate kinds and event kinds.
//!
//! Both sets are closed: every event the engine can see belongs to one of the
//! aggregate kinds below, and every event kind belongs to exactly one aggregate
//! kind. Registry lookups match on these enums, so adding a kind is a
//! compile-time change rather than a runtime string comparison.
//!
//! The string forms (`"project.grant.member.added"`, ...) are the names stored
//! in the event log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a stored kind name is not part of the closed set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseKindError {
    /// Unknown aggregate kind.
    #[error("Unknown aggregate type: {0}")]
    AggregateType(String),

    /// Unknown event kind.
    #[error("Unknown event type: {0}")]
    EventType(String),
}

/// The kind of aggregate an event belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AggregateType {
    /// A tenant of the platform.
    Instance,
    /// An organization inside an instance.
    Org,
    /// A project, including its grants and grant members.
    Project,
    /// A human or machine user.
    User,
}

impl AggregateType {
    /// All aggregate kinds.
    pub const ALL: [Self; 4] = [Self::Instance, Self::Org, Self::Project, Self::User];

    /// Name used in the event log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Org => "org",
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseKindError::AggregateType(s.to_string()))
    }
}

impl TryFrom<String> for AggregateType {
    type Error = ParseKindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AggregateType> for String {
    fn from(value: AggregateType) -> Self {
        value.as_str().to_string()
    }
}

/// Declares one closed event-kind enum per aggregate kind.
macro_rules! event_kinds {
    (
        $(#[$meta:meta])*
        $name:ident => $aggregate:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// All event kinds of this aggregate.
            pub const ALL: &'static [Self] = &[ $( Self::$variant ),+ ];

            /// Name used in the event log.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $wire ),+
                }
            }

            fn parse(s: &str) -> Option<Self> {
                match s {
                    $( $wire => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for EventType {
            fn from(value: $name) -> Self {
                Self::$aggregate(value)
            }
        }
    };
}

event_kinds! {
    /// Events emitted by project aggregates.
    ProjectEventType => Project {
        /// A project was removed together with everything below it.
        Removed => "project.removed",
        /// An organization was granted access to the project.
        GrantAdded => "project.grant.added",
        /// The roles of a project grant changed.
        GrantChanged => "project.grant.changed",
        /// A project grant was removed.
        GrantRemoved => "project.grant.removed",
        /// A user became member of a project grant.
        GrantMemberAdded => "project.grant.member.added",
        /// The roles of a project grant member changed.
        GrantMemberChanged => "project.grant.member.changed",
        /// A project grant member was removed explicitly.
        GrantMemberRemoved => "project.grant.member.removed",
        /// A project grant member was removed because its user was removed by policy.
        GrantMemberCascadeRemoved => "project.grant.member.cascade.removed",
    }
}

event_kinds! {
    /// Events emitted by user aggregates.
    UserEventType => User {
        /// A human user was added.
        HumanAdded => "user.human.added",
        /// A machine user was added.
        MachineAdded => "user.machine.added",
        /// A user was removed.
        Removed => "user.removed",
    }
}

event_kinds! {
    /// Events emitted by organization aggregates.
    OrgEventType => Org {
        /// An organization was removed.
        Removed => "org.removed",
    }
}

event_kinds! {
    /// Events emitted by instance aggregates.
    InstanceEventType => Instance {
        /// An instance (tenant) was removed.
        Removed => "instance.removed",
    }
}

/// The kind of an event, grouped by the aggregate kind that emits it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventType {
    /// Project events.
    Project(ProjectEventType),
    /// User events.
    User(UserEventType),
    /// Organization events.
    Org(OrgEventType),
    /// Instance events.
    Instance(InstanceEventType),
}

impl EventType {
    /// The aggregate kind that emits this event kind.
    #[must_use]
    pub const fn aggregate_type(self) -> AggregateType {
        match self {
            Self::Project(_) => AggregateType::Project,
            Self::User(_) => AggregateType::User,
            Self::Org(_) => AggregateType::Org,
            Self::Instance(_) => AggregateType::Instance,
        }
    }

    /// Name used in the event log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project(kind) => kind.as_str(),
            Self::User(kind) => kind.as_str(),
            Self::Org(kind) => kind.as_str(),
            Self::Instance(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectEventType::parse(s)
            .map(Self::Project)
            .or_else(|| UserEventType::parse(s).map(Self::User))
            .or_else(|| OrgEventType::parse(s).map(Self::Org))
            .or_else(|| InstanceEventType::parse(s).map(Self::Instance))
            .ok_or_else(|| ParseKindError::EventType(s.to_string()))
    }
}

impl TryFrom<String> for EventType {
    type Error = ParseKindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_round_trip_through_from_str() {
        let all = ProjectEventType::ALL
            .iter()
            .copied()
            .map(EventType::from)
            .chain(UserEventType::ALL.iter().copied().map(EventType::from))
            .chain(OrgEventType::ALL.iter().copied().map(EventType::from))
            .chain(InstanceEventType::ALL.iter().copied().map(EventType::from));

        for kind in all {
            assert_eq!(kind.as_str().parse::<EventType>(), Ok(kind));
        }
    }

    #[test]
    fn event_type_knows_its_aggregate() {
        assert_eq!(
            EventType::from(ProjectEventType::GrantMemberAdded).aggregate_type(),
            AggregateType::Project
        );
        assert_eq!(
            EventType::from(OrgEventType::Removed).aggregate_type(),
            AggregateType::Org
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(
            "project.exploded".parse::<EventType>(),
            Err(ParseKindError::EventType("project.exploded".to_string()))
        );
        assert!("tenant".parse::<AggregateType>().is_err());
    }
}
