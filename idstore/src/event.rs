//! The event and aggregate model of the log.

use crate::errors::{EventstoreError, EventstoreResult, Operation};
use crate::types::{
    ActorId, AggregateId, AggregateType, EventId, EventType, InstanceId, Position, ResourceOwner,
    Revision, Sequence, Timestamp,
};
use crate::unique::UniqueConstraint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one aggregate stream: `(instance, type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    /// Tenant the aggregate belongs to.
    pub instance_id: InstanceId,
    /// Kind of aggregate.
    pub aggregate_type: AggregateType,
    /// Identifier within type and instance.
    pub aggregate_id: AggregateId,
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instance_id, self.aggregate_type, self.aggregate_id
        )
    }
}

/// Reference to the aggregate an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    /// Identifier within type and instance.
    pub id: AggregateId,
    /// Kind of aggregate.
    #[serde(rename = "type")]
    pub aggregate_type: AggregateType,
    /// Owning organisation.
    pub resource_owner: ResourceOwner,
    /// Tenant.
    pub instance_id: InstanceId,
    /// Aggregate schema version.
    pub version: Revision,
}

impl AggregateRef {
    /// Creates a reference with version 1.
    pub fn new(
        instance_id: InstanceId,
        aggregate_type: AggregateType,
        id: AggregateId,
        resource_owner: ResourceOwner,
    ) -> Self {
        Self {
            id,
            aggregate_type,
            resource_owner,
            instance_id,
            version: Revision::new(1),
        }
    }

    /// Overrides the aggregate version.
    #[must_use]
    pub const fn with_version(mut self, version: Revision) -> Self {
        self.version = version;
        self
    }

    /// The stream identity of this aggregate.
    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            instance_id: self.instance_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.id.clone(),
        }
    }
}

/// The caller's belief about an aggregate's current sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedSequence {
    /// The aggregate must currently be at exactly this sequence.
    /// `Exact(Sequence::zero())` requires that the aggregate has no events.
    Exact(Sequence),
    /// Skip the check; the next sequence is still assigned atomically.
    Any,
}

impl ExpectedSequence {
    /// Whether `current` satisfies this expectation.
    pub fn matches(self, current: Sequence) -> bool {
        match self {
            Self::Exact(expected) => expected == current,
            Self::Any => true,
        }
    }

    /// The exact expectation, if any.
    pub const fn exact(self) -> Option<Sequence> {
        match self {
            Self::Exact(sequence) => Some(sequence),
            Self::Any => None,
        }
    }
}

/// An event to be pushed.
///
/// Carries the unique constraint changes that must commit atomically with it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Aggregate the event belongs to.
    pub aggregate: AggregateRef,
    /// Optimistic concurrency token.
    pub expected: ExpectedSequence,
    /// Event type.
    pub event_type: EventType,
    /// Payload schema revision.
    pub revision: Revision,
    /// Principal causing the event.
    pub creator: ActorId,
    /// JSON payload.
    pub payload: Option<Value>,
    /// Ledger changes bundled with the event.
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl NewEvent {
    /// Creates an event without payload at revision 1.
    pub fn new(
        aggregate: AggregateRef,
        expected: ExpectedSequence,
        event_type: EventType,
        creator: ActorId,
    ) -> Self {
        Self {
            aggregate,
            expected,
            event_type,
            revision: Revision::new(1),
            creator,
            payload: None,
            unique_constraints: Vec::new(),
        }
    }

    /// Serializes `payload` as the event's JSON payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> EventstoreResult<Self> {
        let value = serde_json::to_value(payload).map_err(|error| {
            EventstoreError::validation("EVENT-Pay01", format!("unserializable payload: {error}"))
        })?;
        self.payload = Some(value);
        Ok(self)
    }

    /// Overrides the payload revision.
    #[must_use]
    pub const fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    /// Attaches a unique constraint change.
    #[must_use]
    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }
}

/// A committed, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// Aggregate the event belongs to.
    pub aggregate: AggregateRef,
    /// Per-aggregate sequence, starting at 1.
    pub sequence: Sequence,
    /// Global position shared by every event of one push.
    pub position: Position,
    /// Index of the event within its push.
    pub in_tx_order: u32,
    /// Commit timestamp.
    pub created_at: Timestamp,
    /// Event type.
    pub event_type: EventType,
    /// Payload schema revision.
    pub revision: Revision,
    /// Principal that caused the event.
    pub creator: ActorId,
    /// JSON payload.
    pub payload: Option<Value>,
}

impl Event {
    /// Decodes the payload into `T`. A missing payload decodes from `null`.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> EventstoreResult<T> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|error| {
            EventstoreError::internal(
                "EVENT-Unm01",
                Operation::DecodeEvent,
                format!("event {} ({}): {error}", self.id, self.event_type),
            )
        })
    }

    /// Orders events by `(position, in_tx_order)`.
    pub fn global_order(&self) -> (Position, u32) {
        (self.position, self.in_tx_order)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn aggregate(instance: &str, aggregate_type: &str, id: &str) -> AggregateRef {
        AggregateRef::new(
            InstanceId::try_new(instance).unwrap(),
            AggregateType::try_new(aggregate_type).unwrap(),
            AggregateId::try_new(id).unwrap(),
            ResourceOwner::try_new("org-1").unwrap(),
        )
    }

    pub fn event(event_type: &str, sequence: u64, position: u64) -> Event {
        Event {
            id: EventId::new(),
            aggregate: aggregate("instance-1", "user", "user-1"),
            sequence: Sequence::new(sequence),
            position: Position::new(position),
            in_tx_order: 0,
            created_at: Timestamp::now(),
            event_type: EventType::try_new(event_type).unwrap(),
            revision: Revision::new(1),
            creator: ActorId::try_new("admin").unwrap(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Added {
        username: String,
    }

    #[test]
    fn unmarshal_decodes_payload() {
        let mut e = event("user.human.added", 1, 1);
        e.payload = Some(serde_json::json!({"username": "gigi"}));
        let added: Added = e.unmarshal().unwrap();
        assert_eq!(
            added,
            Added {
                username: "gigi".to_string()
            }
        );
    }

    #[test]
    fn unmarshal_reports_decode_failures_as_internal() {
        let mut e = event("user.human.added", 1, 1);
        e.payload = Some(serde_json::json!({"name": 1}));
        let err = e.unmarshal::<Added>().unwrap_err();
        assert!(matches!(
            err,
            EventstoreError::Internal {
                operation: Operation::DecodeEvent,
                ..
            }
        ));
    }

    #[test]
    fn expected_sequence_any_matches_everything() {
        assert!(ExpectedSequence::Any.matches(Sequence::new(42)));
        assert!(ExpectedSequence::Exact(Sequence::zero()).matches(Sequence::zero()));
        assert!(!ExpectedSequence::Exact(Sequence::zero()).matches(Sequence::new(1)));
    }

    #[test]
    fn aggregate_key_displays_as_path() {
        let key = aggregate("instance-1", "user", "user-1").key();
        assert_eq!(key.to_string(), "instance-1/user/user-1");
    }
}
