//! Event log behaviour of the in-memory adapter through the `Eventstore` facade.

mod common;

use common::{eventstore, instance, new_event, user};
use idstore::retry::{retry_on_conflict, RetryConfig};
use idstore::{
    AggregateType, ErrorKind, EventType, ExpectedSequence, Position, SearchQuery,
    SearchQueryBuilder, Sequence, UniqueConstraint,
};
use serde_json::json;
use std::time::Duration;

fn exact(sequence: u64) -> ExpectedSequence {
    ExpectedSequence::Exact(Sequence::new(sequence))
}

fn user_query(instance_id: &str) -> SearchQueryBuilder {
    SearchQueryBuilder::new()
        .instance_id(instance(instance_id))
        .add_query(SearchQuery::new().aggregate_types([AggregateType::try_new("user").unwrap()]))
}

#[tokio::test]
async fn push_assigns_consecutive_sequences_and_shared_position() {
    let store = eventstore();
    let aggregate = user("instance-1", "user-1");
    let pushed = store
        .push(vec![
            new_event(aggregate.clone(), exact(0), "user.added"),
            new_event(aggregate.clone(), exact(0), "user.changed"),
        ])
        .await
        .unwrap();

    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[0].sequence, Sequence::new(1));
    assert_eq!(pushed[1].sequence, Sequence::new(2));
    assert_eq!(pushed[0].position, pushed[1].position);
    assert_eq!(pushed[0].in_tx_order, 0);
    assert_eq!(pushed[1].in_tx_order, 1);
    assert_eq!(pushed[0].created_at, pushed[1].created_at);
}

#[tokio::test]
async fn empty_push_is_a_noop() {
    let store = eventstore();
    assert!(store.push(Vec::new()).await.unwrap().is_empty());
    assert!(store.log().is_empty());
}

#[tokio::test]
async fn first_push_twice_conflicts() {
    let store = eventstore();
    let aggregate = user("instance-1", "user-1");
    store
        .push(vec![new_event(aggregate.clone(), exact(0), "user.added")])
        .await
        .unwrap();

    let error = store
        .push(vec![new_event(aggregate, exact(0), "user.added")])
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConcurrencyConflict);
    assert_eq!(store.log().len(), 1);
}

#[tokio::test]
async fn concurrent_writers_exactly_one_wins_and_retry_succeeds() {
    let store = eventstore();
    let aggregate = user("instance-1", "user-1");
    store
        .push(vec![new_event(aggregate.clone(), exact(0), "user.added")])
        .await
        .unwrap();

    let first = store.push(vec![new_event(aggregate.clone(), exact(1), "user.changed")]);
    let second = store.push(vec![new_event(aggregate.clone(), exact(1), "user.changed")]);
    let (first, second) = tokio::join!(first, second);
    let conflicts = [&first, &second]
        .into_iter()
        .filter(|result| matches!(result, Err(error) if error.is_concurrency_conflict()))
        .count();
    assert_eq!(conflicts, 1);
    assert!(first.is_ok() ^ second.is_ok());

    // the loser re-reads the current sequence and pushes again
    let config = RetryConfig {
        base_delay: Duration::from_millis(1),
        use_jitter: false,
        ..RetryConfig::default()
    };
    let query = SearchQueryBuilder::new()
        .instance_id(instance("instance-1"))
        .add_query(
            SearchQuery::new()
                .aggregate_types([aggregate.aggregate_type.clone()])
                .aggregate_ids([aggregate.id.clone()]),
        );
    let retried = retry_on_conflict(&config, |_| {
        let store = &store;
        let aggregate = aggregate.clone();
        let query = query.clone();
        async move {
            let current = store.latest_sequence(&query).await?;
            store
                .push(vec![new_event(
                    aggregate,
                    ExpectedSequence::Exact(current),
                    "user.changed",
                )])
                .await
        }
    })
    .await
    .unwrap();
    assert_eq!(retried[0].sequence, Sequence::new(3));

    let sequences: Vec<_> = store
        .filter(&query)
        .await
        .unwrap()
        .iter()
        .map(|event| event.sequence.into_inner())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_push_leaves_no_partial_state() {
    let store = eventstore();
    let taken = user("instance-1", "user-1");
    store
        .push(vec![new_event(taken.clone(), exact(0), "user.added")])
        .await
        .unwrap();

    let error = store
        .push(vec![
            new_event(user("instance-1", "user-2"), exact(0), "user.added").with_unique_constraint(
                UniqueConstraint::add("username", "gigi", "Errors.User.AlreadyExists"),
            ),
            new_event(taken, exact(0), "user.changed"),
        ])
        .await
        .unwrap_err();

    assert!(error.is_concurrency_conflict());
    assert_eq!(store.log().len(), 1);
    assert!(!store
        .log()
        .has_unique_constraint("instance-1", "username", "gigi"));
}

#[tokio::test]
async fn duplicate_unique_constraint_is_rejected() {
    let store = eventstore();
    let claim = |id: &str| {
        new_event(user("instance-1", id), exact(0), "user.added").with_unique_constraint(
            UniqueConstraint::add("username", "gigi", "Errors.User.AlreadyExists"),
        )
    };
    store.push(vec![claim("user-1")]).await.unwrap();

    let error = store.push(vec![claim("user-2")]).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyExists);
    assert!(error.to_string().contains("Errors.User.AlreadyExists"));
    assert_eq!(store.log().len(), 1);
}

#[tokio::test]
async fn removing_a_missing_constraint_succeeds() {
    let store = eventstore();
    let pushed = store
        .push(vec![new_event(user("instance-1", "user-1"), exact(0), "user.removed")
            .with_unique_constraint(UniqueConstraint::remove("username", "nobody"))])
        .await
        .unwrap();
    assert_eq!(pushed.len(), 1);
}

#[tokio::test]
async fn removed_constraint_can_be_claimed_again() {
    let store = eventstore();
    let add = UniqueConstraint::add("username", "gigi", "Errors.User.AlreadyExists");
    store
        .push(vec![new_event(user("instance-1", "user-1"), exact(0), "user.added")
            .with_unique_constraint(add.clone())])
        .await
        .unwrap();
    store
        .push(vec![new_event(user("instance-1", "user-1"), exact(1), "user.removed")
            .with_unique_constraint(UniqueConstraint::remove("username", "gigi"))])
        .await
        .unwrap();
    store
        .push(vec![new_event(user("instance-1", "user-2"), exact(0), "user.added")
            .with_unique_constraint(add)])
        .await
        .unwrap();
    assert!(store
        .log()
        .has_unique_constraint("instance-1", "username", "gigi"));
}

#[tokio::test]
async fn constraints_are_scoped_per_instance_unless_global() {
    let store = eventstore();
    let local = UniqueConstraint::add("username", "gigi", "Errors.User.AlreadyExists");
    let global = UniqueConstraint::add("domain", "example.com", "Errors.Org.DomainTaken").global();

    for instance_id in ["instance-1", "instance-2"] {
        store
            .push(vec![new_event(user(instance_id, "user-1"), exact(0), "user.added")
                .with_unique_constraint(local.clone())])
            .await
            .unwrap();
    }

    store
        .push(vec![new_event(user("instance-1", "user-1"), exact(1), "user.domain.added")
            .with_unique_constraint(global.clone())])
        .await
        .unwrap();
    let error = store
        .push(vec![new_event(user("instance-2", "user-1"), exact(1), "user.domain.added")
            .with_unique_constraint(global)])
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyExists);
    assert!(store.log().has_unique_constraint("", "domain", "example.com"));
}

#[tokio::test]
async fn case_insensitive_constraints_fold_case() {
    let store = eventstore();
    let claim = |id: &str, name: &str| {
        new_event(user("instance-1", id), exact(0), "user.added").with_unique_constraint(
            UniqueConstraint::add("email", name, "Errors.User.EmailTaken").case_insensitive(),
        )
    };
    store
        .push(vec![claim("user-1", "Gigi@Example.com")])
        .await
        .unwrap();
    let error = store
        .push(vec![claim("user-2", "gigi@example.COM")])
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AlreadyExists);
    assert!(store
        .log()
        .has_unique_constraint("instance-1", "email", "gigi@example.com"));
}

#[tokio::test]
async fn instance_remove_drops_every_constraint_of_the_instance() {
    let store = eventstore();
    for (id, name) in [("user-1", "gigi"), ("user-2", "hodor")] {
        store
            .push(vec![new_event(user("instance-1", id), exact(0), "user.added")
                .with_unique_constraint(UniqueConstraint::add(
                    "username",
                    name,
                    "Errors.User.AlreadyExists",
                ))])
            .await
            .unwrap();
    }
    store
        .push(vec![new_event(user("instance-2", "user-1"), exact(0), "user.added")
            .with_unique_constraint(UniqueConstraint::add(
                "username",
                "gigi",
                "Errors.User.AlreadyExists",
            ))])
        .await
        .unwrap();

    store
        .push(vec![new_event(user("instance-1", "user-1"), exact(1), "instance.removed")
            .with_unique_constraint(UniqueConstraint::remove_instance())])
        .await
        .unwrap();

    assert!(!store
        .log()
        .has_unique_constraint("instance-1", "username", "gigi"));
    assert!(!store
        .log()
        .has_unique_constraint("instance-1", "username", "hodor"));
    assert!(store
        .log()
        .has_unique_constraint("instance-2", "username", "gigi"));
}

#[tokio::test]
async fn filter_orders_by_position_then_transaction_order() {
    let store = eventstore();
    store
        .push(vec![
            new_event(user("instance-1", "user-1"), exact(0), "user.added"),
            new_event(user("instance-1", "user-2"), exact(0), "user.added"),
        ])
        .await
        .unwrap();
    store
        .push(vec![new_event(user("instance-1", "user-1"), exact(1), "user.changed")])
        .await
        .unwrap();

    let ascending = store.filter(&user_query("instance-1")).await.unwrap();
    let order: Vec<_> = ascending.iter().map(|e| e.global_order()).collect();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);
    assert_eq!(ascending.len(), 3);

    let descending = store
        .filter(&user_query("instance-1").order_desc())
        .await
        .unwrap();
    assert_eq!(descending.first(), ascending.last());
    assert_eq!(descending.last(), ascending.first());
}

#[tokio::test]
async fn filter_is_scoped_to_the_instance() {
    let store = eventstore();
    store
        .push(vec![new_event(user("instance-1", "user-1"), exact(0), "user.added")])
        .await
        .unwrap();
    store
        .push(vec![new_event(user("instance-2", "user-1"), exact(0), "user.added")])
        .await
        .unwrap();

    let events = store.filter(&user_query("instance-2")).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].aggregate.instance_id, instance("instance-2"));

    let none = store.filter(&user_query("instance-3")).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn filter_applies_limit_offset_and_event_types() {
    let store = eventstore();
    let aggregate = user("instance-1", "user-1");
    store
        .push(vec![
            new_event(aggregate.clone(), exact(0), "user.added"),
            new_event(aggregate.clone(), exact(0), "user.changed"),
            new_event(aggregate.clone(), exact(0), "user.changed"),
            new_event(aggregate, exact(0), "user.removed"),
        ])
        .await
        .unwrap();

    let page = store
        .filter(&user_query("instance-1").limit(2).offset(1))
        .await
        .unwrap();
    let sequences: Vec<_> = page.iter().map(|e| e.sequence.into_inner()).collect();
    assert_eq!(sequences, vec![2, 3]);

    let changed = store
        .filter(
            &SearchQueryBuilder::new()
                .instance_id(instance("instance-1"))
                .add_query(
                    SearchQuery::new()
                        .aggregate_types([AggregateType::try_new("user").unwrap()])
                        .event_types([EventType::try_new("user.changed").unwrap()]),
                ),
        )
        .await
        .unwrap();
    assert_eq!(changed.len(), 2);
}

#[tokio::test]
async fn filter_matches_payload_containment() {
    let store = eventstore();
    store
        .push(vec![
            new_event(user("instance-1", "user-1"), exact(0), "user.added")
                .with_payload(&json!({"username": "gigi", "profile": {"lang": "de"}}))
                .unwrap(),
            new_event(user("instance-1", "user-2"), exact(0), "user.added")
                .with_payload(&json!({"username": "hodor"}))
                .unwrap(),
        ])
        .await
        .unwrap();

    let events = store
        .filter(
            &SearchQueryBuilder::new()
                .instance_id(instance("instance-1"))
                .add_query(
                    SearchQuery::new()
                        .aggregate_types([AggregateType::try_new("user").unwrap()])
                        .event_data(json!({"profile": {"lang": "de"}})),
                ),
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].aggregate.id.to_string(), "user-1");
}

#[tokio::test]
async fn latest_sequence_and_position_default_to_zero() {
    let store = eventstore();
    assert_eq!(
        store.latest_sequence(&user_query("instance-1")).await.unwrap(),
        Sequence::zero()
    );
    assert_eq!(
        store.latest_position(&user_query("instance-1")).await.unwrap(),
        Position::origin()
    );

    let pushed = store
        .push(vec![
            new_event(user("instance-1", "user-1"), exact(0), "user.added"),
            new_event(user("instance-1", "user-1"), exact(0), "user.changed"),
        ])
        .await
        .unwrap();
    assert_eq!(
        store.latest_sequence(&user_query("instance-1")).await.unwrap(),
        Sequence::new(2)
    );
    assert_eq!(
        store.latest_position(&user_query("instance-1")).await.unwrap(),
        pushed[0].position
    );
}

#[tokio::test]
async fn positions_grow_across_pushes() {
    let store = eventstore();
    let mut last = Position::origin();
    for id in ["user-1", "user-2", "user-3"] {
        let pushed = store
            .push(vec![new_event(user("instance-1", id), exact(0), "user.added")])
            .await
            .unwrap();
        assert!(pushed[0].position > last);
        last = pushed[0].position;
    }
}

#[tokio::test]
async fn unscoped_queries_are_rejected_before_io() {
    let store = eventstore();
    let error = store.filter(&SearchQueryBuilder::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn many_writers_on_one_sequence_yield_a_single_winner() {
    let store = eventstore();
    let aggregate = user("instance-1", "user-1");
    store
        .push(vec![new_event(aggregate.clone(), exact(0), "user.added")])
        .await
        .unwrap();

    let results = futures::future::join_all((0..10).map(|_| {
        store.push(vec![new_event(aggregate.clone(), exact(1), "user.changed")])
    }))
    .await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(idstore::EventstoreError::is_concurrency_conflict));
    assert_eq!(store.log().len(), 2);
}
