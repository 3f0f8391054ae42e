//! Execution dispatch: matching events to registered targets.
//!
//! Targets (webhooks and friends) are registered against conditions such as
//! `event/session.*` or `request/zitadel.user.v2.UserService`. The
//! [`ExecutionHandler`] projection resolves the conditions an event satisfies,
//! looks up their targets and enqueues one [`DispatchRequest`] per event for
//! out-of-process delivery.

mod handler;

pub use handler::{ConditionResolver, ExecutionHandler, DEFAULT_QUEUE};

use crate::errors::EventstoreResult;
use crate::event::{AggregateRef, Event};
use crate::matcher::EVENT_NAMESPACE;
use crate::types::{ActorId, EventId, EventType, InstanceId, Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Scope of a request or response condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionScope {
    /// Every call.
    All,
    /// Every method of a service.
    Service(String),
    /// One fully qualified method.
    Method(String),
}

/// A condition targets can be registered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionCondition {
    /// Before an API call.
    Request(ConditionScope),
    /// After an API call.
    Response(ConditionScope),
    /// A named function hook.
    Function(String),
    /// An event type or wildcard group; `None` matches every event.
    Event(Option<String>),
}

impl ExecutionCondition {
    /// Stable identifier used as lookup key.
    pub fn id(&self) -> String {
        fn scoped(prefix: &str, scope: &ConditionScope) -> String {
            match scope {
                ConditionScope::All => prefix.to_string(),
                ConditionScope::Service(name) | ConditionScope::Method(name) => {
                    format!("{prefix}/{name}")
                }
            }
        }
        match self {
            Self::Request(scope) => scoped("request", scope),
            Self::Response(scope) => scoped("response", scope),
            Self::Function(name) => format!("function/{name}"),
            Self::Event(None) => EVENT_NAMESPACE.to_string(),
            Self::Event(Some(group)) => format!("{EVENT_NAMESPACE}/{group}"),
        }
    }
}

impl fmt::Display for ExecutionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// How a target is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Fire-and-forget HTTP call; the response is ignored.
    Webhook,
    /// HTTP call whose response is used.
    Call,
    /// Asynchronous HTTP call.
    Async,
}

/// A registered delivery endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTarget {
    /// Target id.
    pub id: String,
    /// Invocation kind.
    pub target_type: TargetType,
    /// Endpoint URL.
    pub endpoint: String,
    /// Delivery timeout.
    pub timeout: Duration,
    /// Whether a delivery failure interrupts the triggering flow.
    pub interrupt_on_error: bool,
    /// Key used to sign payloads.
    pub signing_key: String,
}

impl fmt::Debug for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTarget")
            .field("id", &self.id)
            .field("target_type", &self.target_type)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("interrupt_on_error", &self.interrupt_on_error)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Resolves the current targets of conditions.
pub trait TargetQuerier: Send + Sync {
    /// Targets per condition id, for the ids that have any.
    fn targets_by_conditions(
        &self,
        instance: &InstanceId,
        condition_ids: &[String],
    ) -> impl Future<Output = EventstoreResult<HashMap<String, Vec<ExecutionTarget>>>> + Send;
}

/// A queued delivery of one event to its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Idempotency key.
    pub event_id: EventId,
    /// Aggregate of the event.
    pub aggregate: AggregateRef,
    /// Sequence of the event.
    pub sequence: Sequence,
    /// Event type.
    pub event_type: EventType,
    /// Creation time of the event.
    pub created_at: Timestamp,
    /// Principal that caused the event.
    pub user_id: ActorId,
    /// Event payload.
    pub payload: Option<Value>,
    /// Matched targets, most specific condition first.
    pub targets: Vec<ExecutionTarget>,
}

impl DispatchRequest {
    /// Builds the request for `event`.
    pub fn new(event: &Event, targets: Vec<ExecutionTarget>) -> Self {
        Self {
            event_id: event.id,
            aggregate: event.aggregate.clone(),
            sequence: event.sequence,
            event_type: event.event_type.clone(),
            created_at: event.created_at,
            user_id: event.creator.clone(),
            payload: event.payload.clone(),
            targets,
        }
    }
}

/// Options of a queue insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Queue name.
    pub queue: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_ids_are_stable() {
        assert_eq!(ExecutionCondition::Request(ConditionScope::All).id(), "request");
        assert_eq!(
            ExecutionCondition::Request(ConditionScope::Service(
                "zitadel.session.v2.SessionService".into()
            ))
            .id(),
            "request/zitadel.session.v2.SessionService"
        );
        assert_eq!(
            ExecutionCondition::Response(ConditionScope::Method(
                "/zitadel.session.v2.SessionService/ListSessions".into()
            ))
            .id(),
            "response//zitadel.session.v2.SessionService/ListSessions"
        );
        assert_eq!(
            ExecutionCondition::Function("preuserinfo".into()).id(),
            "function/preuserinfo"
        );
        assert_eq!(ExecutionCondition::Event(None).id(), "event");
        assert_eq!(
            ExecutionCondition::Event(Some("session.*".into())).id(),
            "event/session.*"
        );
    }

    #[test]
    fn signing_key_is_redacted_from_debug_output() {
        let target = ExecutionTarget {
            id: "target-1".into(),
            target_type: TargetType::Webhook,
            endpoint: "https://example.com/hook".into(),
            timeout: Duration::from_secs(10),
            interrupt_on_error: false,
            signing_key: "super-secret".into(),
        };
        let debug = format!("{target:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
