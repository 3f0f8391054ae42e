//! Projections: folding ordered events into read models and side effects.
//!
//! - [`Projection`]: declares the handled events and reduces each into a [`Statement`]
//! - [`ProjectionStore`]/[`ProjectionTx`]: persist statements and progress atomically
//! - [`Handler`]: drives a projection per instance, batch by batch

mod handler;
mod statement;
mod store;

pub use handler::{BulkLimit, Handler, HandlerConfig, MaxFailureCount, TriggerReport};
pub use statement::{
    Column, ColumnSpec, ColumnType, ColumnValue, Condition, InitStep, Mutation, Statement, Table,
};
pub use store::{ProjectionStore, ProjectionTx};

use crate::errors::EventstoreError;
use crate::event::Event;
use crate::mapper::EventMapper;
use crate::types::{
    AggregateId, AggregateType, EventId, InstanceId, Position, ProjectionName, Sequence, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Context provided to [`Projection::on_error`] when reducing or applying an
/// event fails.
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// The failure.
    pub error: &'a EventstoreError,
    /// The event that could not be processed.
    pub event: &'a Event,
    /// Global position of the event.
    pub position: Position,
    /// Persisted number of failures of this event, including this one.
    pub retry_count: u32,
}

/// How the handler reacts to a failed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStrategy {
    /// Stop the run. Progress up to the previous event is committed.
    Fatal,
    /// Leave the event recorded as failed and continue with the next one.
    Skip,
    /// Reprocess the event, bounded by `HandlerConfig::max_failure_count`.
    Retry,
}

/// A read model fed from the event log.
///
/// # Example
///
/// ```ignore
/// impl Projection for UserProjection {
///     type Event = UserEvent;
///
///     fn name(&self) -> &ProjectionName { &self.name }
///     fn mapper(&self) -> &EventMapper<UserEvent> { &self.mapper }
///
///     async fn reduce(&self, event: UserEvent, raw: &Event) -> EventstoreResult<Statement> {
///         match event {
///             UserEvent::Added { username } => Ok(Statement::new(raw, vec![
///                 Mutation::upsert("projections.users", &["id"], vec![
///                     Column::new("id", raw.aggregate.id.to_string())?,
///                     Column::new("username", username)?,
///                 ])?,
///             ])),
///         }
///     }
/// }
/// ```
pub trait Projection: Send + Sync {
    /// Tagged union of the handled events.
    type Event: Send;

    /// Stable name; keys progress and failed events.
    fn name(&self) -> &ProjectionName;

    /// Declares the handled aggregate and event types and decodes them.
    fn mapper(&self) -> &EventMapper<Self::Event>;

    /// Reduces one decoded event. Re-reducing the same event must converge
    /// to the same read-model state.
    fn reduce(
        &self,
        event: Self::Event,
        raw: &Event,
    ) -> impl Future<Output = Result<Statement, EventstoreError>> + Send;

    /// Readiness predicates; empty means always ready.
    fn init_check(&self) -> Vec<InitStep> {
        Vec::new()
    }

    /// Classifies a failure. Retries retryable errors and skips the rest.
    fn on_error(&self, ctx: &FailureContext<'_>) -> FailureStrategy {
        if ctx.error.is_retryable() {
            FailureStrategy::Retry
        } else {
            FailureStrategy::Skip
        }
    }
}

/// Progress of one projection within one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Projection name.
    pub projection: ProjectionName,
    /// Instance.
    pub instance_id: InstanceId,
    /// Aggregate type of the last processed event.
    pub aggregate_type: Option<AggregateType>,
    /// Aggregate id of the last processed event.
    pub aggregate_id: Option<AggregateId>,
    /// Sequence of the last processed event.
    pub sequence: Option<Sequence>,
    /// Position of the last processed event.
    pub position: Position,
    /// Number of events already processed at exactly `position`.
    pub filter_offset: u64,
    /// Creation time of the last processed event.
    pub event_timestamp: Option<Timestamp>,
    /// Last time progress was committed.
    pub last_run: Option<Timestamp>,
}

impl ProjectionState {
    /// State of a projection that has not processed anything.
    pub fn initial(projection: ProjectionName, instance_id: InstanceId) -> Self {
        Self {
            projection,
            instance_id,
            aggregate_type: None,
            aggregate_id: None,
            sequence: None,
            position: Position::origin(),
            filter_offset: 0,
            event_timestamp: None,
            last_run: None,
        }
    }

    /// State after processing `events`, which were read in order starting
    /// at this state's cursor.
    #[must_use]
    pub fn advance(&self, events: &[Event]) -> Self {
        let Some(last) = events.last() else {
            return Self {
                last_run: Some(Timestamp::now()),
                ..self.clone()
            };
        };
        let at_last_position = events
            .iter()
            .filter(|event| event.position == last.position)
            .count() as u64;
        let filter_offset = if last.position == self.position {
            self.filter_offset + at_last_position
        } else {
            at_last_position
        };
        Self {
            projection: self.projection.clone(),
            instance_id: self.instance_id.clone(),
            aggregate_type: Some(last.aggregate.aggregate_type.clone()),
            aggregate_id: Some(last.aggregate.id.clone()),
            sequence: Some(last.sequence),
            position: last.position,
            filter_offset,
            event_timestamp: Some(last.created_at),
            last_run: Some(Timestamp::now()),
        }
    }
}

/// An event a projection failed to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    /// Projection name.
    pub projection: ProjectionName,
    /// Instance.
    pub instance_id: InstanceId,
    /// The failed event.
    pub event_id: EventId,
    /// Aggregate type of the failed event.
    pub aggregate_type: AggregateType,
    /// Aggregate id of the failed event.
    pub aggregate_id: AggregateId,
    /// Sequence of the failed event.
    pub sequence: Sequence,
    /// Position of the failed event.
    pub position: Position,
    /// Rendered error of the last failure.
    pub error: String,
    /// Number of failures so far.
    pub retry_count: u32,
    /// Time of the last failure.
    pub last_failed: Timestamp,
}

impl FailedEvent {
    /// First failure of `event`.
    pub fn first(
        projection: ProjectionName,
        event: &Event,
        error: &EventstoreError,
    ) -> Self {
        Self {
            projection,
            instance_id: event.aggregate.instance_id.clone(),
            event_id: event.id,
            aggregate_type: event.aggregate.aggregate_type.clone(),
            aggregate_id: event.aggregate.id.clone(),
            sequence: event.sequence,
            position: event.position,
            error: error.to_string(),
            retry_count: 1,
            last_failed: Timestamp::now(),
        }
    }

    /// Records another failure.
    pub fn failed_again(&mut self, error: &EventstoreError) {
        self.retry_count += 1;
        self.error = error.to_string();
        self.last_failed = Timestamp::now();
    }
}
