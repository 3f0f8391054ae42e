//! Execution dispatch through the projection handler.

mod common;

use common::{eventstore, instance, new_event, user};
use idstore::execution::{ExecutionCondition, ExecutionHandler, ExecutionTarget, TargetType};
use idstore::projection::{Handler, HandlerConfig};
use idstore::{AggregateType, ExpectedSequence, ProjectionName};
use idstore_memory::{InMemoryProjectionStore, InMemoryTargetQuerier};
use serde_json::json;
use std::time::Duration;

fn target(id: &str) -> ExecutionTarget {
    ExecutionTarget {
        id: id.to_string(),
        target_type: TargetType::Webhook,
        endpoint: format!("https://example.com/{id}"),
        timeout: Duration::from_secs(10),
        interrupt_on_error: false,
        signing_key: format!("key-{id}"),
    }
}

fn execution_handler(querier: InMemoryTargetQuerier) -> ExecutionHandler<InMemoryTargetQuerier> {
    ExecutionHandler::new(
        ProjectionName::try_new("projections.execution_handler").unwrap(),
        [AggregateType::try_new("user").unwrap()],
        querier,
    )
    .unwrap()
}

#[tokio::test]
async fn one_request_per_event_with_all_matching_targets() {
    let log = eventstore();
    let store = InMemoryProjectionStore::new();
    let querier = InMemoryTargetQuerier::new();
    let tenant = instance("instance-1");
    querier.set_targets(
        &tenant,
        &ExecutionCondition::Event(Some("user.added".into())),
        vec![target("exact")],
    );
    querier.set_targets(
        &tenant,
        &ExecutionCondition::Event(Some("user.*".into())),
        vec![target("group")],
    );
    querier.set_targets(&tenant, &ExecutionCondition::Event(None), vec![target("all")]);

    let pushed = log
        .push(vec![new_event(
            user("instance-1", "user-1"),
            ExpectedSequence::Any,
            "user.added",
        )
        .with_payload(&json!({ "username": "gigi" }))
        .unwrap()])
        .await
        .unwrap();

    let handler = Handler::new(
        execution_handler(querier),
        log.clone(),
        store.clone(),
        HandlerConfig::default(),
    );
    handler.trigger(&tenant).await.unwrap();

    let requests = store.dispatch_requests();
    assert_eq!(requests.len(), 1);
    let (queue, request) = &requests[0];
    assert_eq!(queue, "execution");
    assert_eq!(request.event_id, pushed[0].id);
    assert_eq!(request.payload, Some(json!({ "username": "gigi" })));
    let ids: Vec<_> = request.targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["exact", "group", "all"]);
}

#[tokio::test]
async fn events_without_targets_enqueue_nothing() {
    let log = eventstore();
    let store = InMemoryProjectionStore::new();
    let querier = InMemoryTargetQuerier::new();
    querier.set_targets(
        &instance("instance-1"),
        &ExecutionCondition::Event(Some("session.*".into())),
        vec![target("sessions")],
    );
    log.push(vec![new_event(
        user("instance-1", "user-1"),
        ExpectedSequence::Any,
        "user.added",
    )])
    .await
    .unwrap();

    let handler = Handler::new(
        execution_handler(querier),
        log.clone(),
        store.clone(),
        HandlerConfig::default(),
    );
    let report = handler.trigger(&instance("instance-1")).await.unwrap();

    assert_eq!(report.processed, 1);
    assert!(store.dispatch_requests().is_empty());
}

#[tokio::test]
async fn targets_of_other_instances_are_ignored() {
    let log = eventstore();
    let store = InMemoryProjectionStore::new();
    let querier = InMemoryTargetQuerier::new();
    querier.set_targets(
        &instance("instance-2"),
        &ExecutionCondition::Event(None),
        vec![target("foreign")],
    );
    log.push(vec![new_event(
        user("instance-1", "user-1"),
        ExpectedSequence::Any,
        "user.added",
    )])
    .await
    .unwrap();

    let handler = Handler::new(
        execution_handler(querier),
        log.clone(),
        store.clone(),
        HandlerConfig::default(),
    );
    handler.trigger(&instance("instance-1")).await.unwrap();

    assert!(store.dispatch_requests().is_empty());
}

#[tokio::test]
async fn replayed_events_are_enqueued_once() {
    let log = eventstore();
    let store = InMemoryProjectionStore::new();
    let querier = InMemoryTargetQuerier::new();
    querier.set_targets(
        &instance("instance-1"),
        &ExecutionCondition::Event(None),
        vec![target("all")],
    );
    log.push(vec![
        new_event(user("instance-1", "user-1"), ExpectedSequence::Any, "user.added"),
        new_event(user("instance-1", "user-2"), ExpectedSequence::Any, "user.added"),
    ])
    .await
    .unwrap();

    Handler::new(
        execution_handler(querier.clone()),
        log.clone(),
        store.clone(),
        HandlerConfig::default(),
    )
    .trigger(&instance("instance-1"))
    .await
    .unwrap();

    // a second handler with fresh progress replays the same events
    let replay = ExecutionHandler::new(
        ProjectionName::try_new("projections.execution_handler_replay").unwrap(),
        [AggregateType::try_new("user").unwrap()],
        querier,
    )
    .unwrap();
    Handler::new(replay, log.clone(), store.clone(), HandlerConfig::default())
        .trigger(&instance("instance-1"))
        .await
        .unwrap();

    assert_eq!(store.dispatch_requests().len(), 2);
}

#[tokio::test]
async fn custom_queue_names_are_kept() {
    let log = eventstore();
    let store = InMemoryProjectionStore::new();
    let querier = InMemoryTargetQuerier::new();
    querier.set_targets(
        &instance("instance-1"),
        &ExecutionCondition::Event(Some("user.*".into())),
        vec![target("a"), target("b"), target("c")],
    );
    log.push(vec![new_event(
        user("instance-1", "user-1"),
        ExpectedSequence::Any,
        "user.added",
    )])
    .await
    .unwrap();

    Handler::new(
        execution_handler(querier).with_queue("webhooks"),
        log.clone(),
        store.clone(),
        HandlerConfig::default(),
    )
    .trigger(&instance("instance-1"))
    .await
    .unwrap();

    let requests = store.dispatch_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "webhooks");
    assert_eq!(requests[0].1.targets.len(), 3);
}
