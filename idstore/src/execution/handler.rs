use super::{DispatchRequest, EnqueueOptions, ExecutionCondition, TargetQuerier};
use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::Event;
use crate::mapper::EventMapper;
use crate::matcher::{namespaced_event_type_groups, EVENT_NAMESPACE};
use crate::projection::{Mutation, Projection, Statement};
use crate::types::{AggregateType, ProjectionName};
use std::collections::HashSet;
use tracing::debug;

/// Queue the dispatch requests go to unless configured otherwise.
pub const DEFAULT_QUEUE: &str = "execution";

/// Supplies request, response and function conditions an event satisfies.
pub type ConditionResolver = Box<dyn Fn(&Event) -> Vec<ExecutionCondition> + Send + Sync>;

/// Projection enqueueing one [`DispatchRequest`] per event with targets.
pub struct ExecutionHandler<Q> {
    name: ProjectionName,
    mapper: EventMapper<()>,
    querier: Q,
    queue: String,
    resolver: Option<ConditionResolver>,
}

impl<Q: TargetQuerier> ExecutionHandler<Q> {
    /// Handles every event of `aggregate_types`.
    pub fn new(
        name: ProjectionName,
        aggregate_types: impl IntoIterator<Item = AggregateType>,
        querier: Q,
    ) -> EventstoreResult<Self> {
        let mapper = aggregate_types
            .into_iter()
            .fold(EventMapper::builder(), |builder, aggregate_type| {
                builder.on_any(aggregate_type, |_| Ok(()))
            })
            .build()?;
        if mapper.aggregate_types().is_empty() {
            return Err(EventstoreError::validation(
                "EXECU-Aggr1",
                "execution handler needs at least one aggregate type",
            ));
        }
        Ok(Self {
            name,
            mapper,
            querier,
            queue: DEFAULT_QUEUE.to_string(),
            resolver: None,
        })
    }

    /// Overrides the queue name.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Adds request, response and function conditions per event.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ConditionResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Candidate condition ids of `event`, most specific first.
    pub fn condition_ids(&self, event: &Event) -> Vec<String> {
        let mut ids = namespaced_event_type_groups(EVENT_NAMESPACE, event.event_type.as_ref());
        if let Some(resolver) = &self.resolver {
            ids.extend(resolver(event).iter().map(ExecutionCondition::id));
        }
        ids
    }
}

impl<Q: TargetQuerier> Projection for ExecutionHandler<Q> {
    type Event = ();

    fn name(&self) -> &ProjectionName {
        &self.name
    }

    fn mapper(&self) -> &EventMapper<()> {
        &self.mapper
    }

    async fn reduce(&self, (): (), event: &Event) -> EventstoreResult<Statement> {
        let ids = self.condition_ids(event);
        let by_condition = self
            .querier
            .targets_by_conditions(&event.aggregate.instance_id, &ids)
            .await?;

        let mut seen = HashSet::new();
        let targets: Vec<_> = ids
            .iter()
            .filter_map(|id| by_condition.get(id))
            .flatten()
            .filter(|target| seen.insert(target.id.clone()))
            .cloned()
            .collect();

        if targets.is_empty() {
            return Ok(Statement::noop(event));
        }
        debug!(
            event_id = %event.id,
            targets = targets.len(),
            "[execution.reduce] enqueueing dispatch request"
        );
        Ok(Statement::new(
            event,
            vec![Mutation::Enqueue {
                request: DispatchRequest::new(event, targets),
                options: EnqueueOptions {
                    queue: self.queue.clone(),
                },
            }],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::event;
    use crate::execution::{ConditionScope, ExecutionTarget, TargetType};
    use crate::types::InstanceId;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct Targets(HashMap<String, Vec<ExecutionTarget>>);

    impl Targets {
        fn with(mut self, condition: &str, ids: &[&str]) -> Self {
            self.0
                .entry(condition.to_string())
                .or_default()
                .extend(ids.iter().map(|id| target(id)));
            self
        }
    }

    impl TargetQuerier for Targets {
        async fn targets_by_conditions(
            &self,
            _instance: &InstanceId,
            condition_ids: &[String],
        ) -> EventstoreResult<HashMap<String, Vec<ExecutionTarget>>> {
            Ok(condition_ids
                .iter()
                .filter_map(|id| self.0.get(id).map(|t| (id.clone(), t.clone())))
                .collect())
        }
    }

    struct Failing;

    impl TargetQuerier for Failing {
        async fn targets_by_conditions(
            &self,
            _instance: &InstanceId,
            _condition_ids: &[String],
        ) -> EventstoreResult<HashMap<String, Vec<ExecutionTarget>>> {
            Err(EventstoreError::internal(
                "TEST-Targ1",
                crate::errors::Operation::LookupTargets,
                "connection refused",
            ))
        }
    }

    fn target(id: &str) -> ExecutionTarget {
        ExecutionTarget {
            id: id.to_string(),
            target_type: TargetType::Webhook,
            endpoint: format!("https://example.com/{id}"),
            timeout: Duration::from_secs(5),
            interrupt_on_error: false,
            signing_key: "key".to_string(),
        }
    }

    fn handler<Q: TargetQuerier>(querier: Q) -> ExecutionHandler<Q> {
        ExecutionHandler::new(
            ProjectionName::try_new("projections.execution_handler").unwrap(),
            [AggregateType::try_new("user").unwrap()],
            querier,
        )
        .unwrap()
    }

    fn enqueued_target_ids(statement: &Statement) -> Vec<String> {
        match statement.mutations() {
            [Mutation::Enqueue { request, .. }] => {
                request.targets.iter().map(|t| t.id.clone()).collect()
            }
            other => panic!("expected a single enqueue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_targets_is_a_noop() {
        let statement = handler(Targets::default())
            .reduce((), &event("session.added", 1, 1))
            .await
            .unwrap();
        assert!(statement.execute.is_none());
    }

    #[tokio::test]
    async fn wildcard_target_is_dispatched() {
        let statement = handler(Targets::default().with("event/session.*", &["t1"]))
            .reduce((), &event("session.added", 1, 1))
            .await
            .unwrap();
        assert_eq!(enqueued_target_ids(&statement), vec!["t1"]);
    }

    #[tokio::test]
    async fn targets_are_unioned_across_specificity_levels() {
        let querier = Targets::default()
            .with("event/session.added", &["exact"])
            .with("event/session.*", &["group-a", "group-b"]);
        let statement = handler(querier)
            .reduce((), &event("session.added", 1, 1))
            .await
            .unwrap();
        assert_eq!(
            enqueued_target_ids(&statement),
            vec!["exact", "group-a", "group-b"]
        );
    }

    #[tokio::test]
    async fn duplicate_targets_keep_most_specific_occurrence() {
        let querier = Targets::default()
            .with("event/session.added", &["shared"])
            .with("event", &["shared", "root"]);
        let statement = handler(querier)
            .reduce((), &event("session.added", 1, 1))
            .await
            .unwrap();
        assert_eq!(enqueued_target_ids(&statement), vec!["shared", "root"]);
    }

    #[tokio::test]
    async fn resolver_conditions_are_looked_up() {
        let querier = Targets::default().with("function/preaccesstoken", &["fn"]);
        let statement = handler(querier)
            .with_resolver(Box::new(|_| {
                vec![
                    ExecutionCondition::Function("preaccesstoken".into()),
                    ExecutionCondition::Request(ConditionScope::All),
                ]
            }))
            .reduce((), &event("session.added", 1, 1))
            .await
            .unwrap();
        assert_eq!(enqueued_target_ids(&statement), vec!["fn"]);
    }

    #[tokio::test]
    async fn dispatch_request_uses_configured_queue() {
        let e = event("session.added", 1, 1);
        let statement = handler(Targets::default().with("event", &["t1"]))
            .with_queue("webhooks")
            .reduce((), &e)
            .await
            .unwrap();
        match statement.mutations() {
            [Mutation::Enqueue { request, options }] => {
                assert_eq!(options.queue, "webhooks");
                assert_eq!(request.event_id, e.id);
                assert_eq!(request.event_type, e.event_type);
            }
            other => panic!("expected a single enqueue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lookup_failure_propagates() {
        let err = handler(Failing)
            .reduce((), &event("session.added", 1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TEST-Targ1");
    }

    #[test]
    fn handler_requires_aggregate_types() {
        let result = ExecutionHandler::new(
            ProjectionName::try_new("projections.execution_handler").unwrap(),
            Vec::new(),
            Targets::default(),
        );
        assert!(result.is_err());
    }
}
