//! Shared fixtures for the in-memory adapter tests.

#![allow(dead_code)]

use idstore::{
    ActorId, AggregateId, AggregateRef, AggregateType, EventType, Eventstore, EventstoreConfig,
    ExpectedSequence, InstanceId, NewEvent, ResourceOwner,
};
use idstore_memory::InMemoryEventStore;

pub fn instance(id: &str) -> InstanceId {
    InstanceId::try_new(id).unwrap()
}

pub fn user(instance_id: &str, id: &str) -> AggregateRef {
    AggregateRef::new(
        instance(instance_id),
        AggregateType::try_new("user").unwrap(),
        AggregateId::try_new(id).unwrap(),
        ResourceOwner::try_new("org-1").unwrap(),
    )
}

pub fn new_event(aggregate: AggregateRef, expected: ExpectedSequence, event_type: &str) -> NewEvent {
    NewEvent::new(
        aggregate,
        expected,
        EventType::try_new(event_type).unwrap(),
        ActorId::try_new("admin").unwrap(),
    )
}

pub fn eventstore() -> Eventstore<InMemoryEventStore> {
    Eventstore::new(InMemoryEventStore::new(), EventstoreConfig::default())
}
