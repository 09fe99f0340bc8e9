//! Reducers every projection registers the same way.

use projector_core::aggregate::{AggregateType, InstanceEventType};
use projector_core::event::Event;
use projector_core::reducer::{AggregateReducer, EventReducer};
use projector_core::statement::{Condition, Statement};

/// `instance.removed` handling: delete every row of the removed instance.
///
/// Registered exactly once per projection, under [`AggregateType::Instance`].
#[must_use]
pub fn instance_removed<P: 'static>(
    table: &'static str,
    instance_column: &'static str,
) -> AggregateReducer<P> {
    AggregateReducer::new(
        AggregateType::Instance,
        vec![EventReducer::pure(
            InstanceEventType::Removed,
            move |_: &P, event: &Event| {
                Ok(Statement::delete(
                    event,
                    table,
                    vec![Condition::new(instance_column, event.aggregate_id.as_str())],
                ))
            },
        )],
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use projector_core::reducer::{ReducerRegistry, Reduction};
    use projector_core::statement::Operation;
    use projector_testing::fixtures;

    #[tokio::test]
    async fn deletes_by_the_removed_instance() {
        let registry: ReducerRegistry<()> =
            ReducerRegistry::new(vec![instance_removed("projections.t", "instance_id")]).unwrap();

        let Reduction::Applied(statement) =
            registry.reduce(&(), &fixtures::instance_removed("tenant")).await
        else {
            panic!("expected a statement");
        };
        assert_eq!(
            statement.operations,
            vec![Operation::delete(
                "projections.t",
                vec![Condition::new("instance_id", "tenant")]
            )]
        );
    }
}
