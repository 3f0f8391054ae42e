//! The event log port and its validating facade.

use crate::config::{env_millis, ConfigError};
use crate::errors::{EventstoreError, EventstoreResult, Operation};
use crate::event::{AggregateKey, Event, ExpectedSequence, NewEvent};
use crate::mapper::EventMapper;
use crate::search::{BuiltQuery, Columns, SearchQueryBuilder};
use crate::types::{Position, Sequence};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Contract for event log backends.
///
/// Implementations:
/// - `idstore-postgres`: production backend, one database transaction per push
/// - `idstore-memory`: in-memory backend for tests and local development
///
/// Backends may assume the input was validated by [`Eventstore`].
pub trait EventLog: Send + Sync {
    /// Atomically appends `events` and applies their unique constraints.
    ///
    /// For every touched aggregate the expected sequence must equal the
    /// persisted latest sequence, otherwise nothing is written and
    /// [`EventstoreError::ConcurrencyConflict`] is returned. All events of one
    /// push share a position; the returned events carry their assigned
    /// sequence, position, `in_tx_order` and creation timestamp.
    fn push(
        &self,
        events: Vec<NewEvent>,
    ) -> impl Future<Output = EventstoreResult<Vec<Event>>> + Send;

    /// Events matching `query`, ordered by `(position, in_tx_order)`.
    fn filter(
        &self,
        query: &BuiltQuery,
    ) -> impl Future<Output = EventstoreResult<Vec<Event>>> + Send;

    /// Highest sequence in scope, zero if none.
    fn latest_sequence(
        &self,
        query: &BuiltQuery,
    ) -> impl Future<Output = EventstoreResult<Sequence>> + Send;

    /// Highest position in scope, origin if none.
    fn latest_position(
        &self,
        query: &BuiltQuery,
    ) -> impl Future<Output = EventstoreResult<Position>> + Send;
}

/// Configuration for [`Eventstore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventstoreConfig {
    /// Deadline applied to every operation (default: 30 seconds).
    pub operation_timeout: Duration,
}

impl Default for EventstoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl EventstoreConfig {
    /// Reads `IDSTORE_OPERATION_TIMEOUT_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            operation_timeout: env_millis("IDSTORE_OPERATION_TIMEOUT_MS")?
                .unwrap_or(defaults.operation_timeout),
        })
    }
}

/// Validating, deadline-enforcing facade over an [`EventLog`].
#[derive(Debug, Clone)]
pub struct Eventstore<L> {
    log: L,
    config: EventstoreConfig,
}

impl<L: EventLog> Eventstore<L> {
    /// Wraps `log` with the given configuration.
    pub const fn new(log: L, config: EventstoreConfig) -> Self {
        Self { log, config }
    }

    /// The underlying backend.
    pub const fn log(&self) -> &L {
        &self.log
    }

    /// Appends events atomically.
    ///
    /// An empty list is a no-op. Two events of the same aggregate with
    /// different expectations fail with a validation error before any I/O.
    #[instrument(name = "eventstore.push", skip_all, fields(events = events.len()))]
    pub async fn push(&self, events: Vec<NewEvent>) -> EventstoreResult<Vec<Event>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        validate_push(&events)?;
        let pushed = self
            .with_deadline(Operation::Push, self.log.push(events))
            .await
            .inspect_err(|error| {
                if error.is_concurrency_conflict() {
                    debug!(%error, "[eventstore.push] concurrency conflict");
                } else {
                    warn!(%error, "[eventstore.push] push failed");
                }
            })?;
        debug!(
            pushed = pushed.len(),
            position = %pushed.first().map_or(Position::origin(), |e| e.position),
            "[eventstore.push] events committed"
        );
        Ok(pushed)
    }

    /// Events matching the query; an empty result is not an error.
    #[instrument(name = "eventstore.filter", skip_all)]
    pub async fn filter(&self, query: &SearchQueryBuilder) -> EventstoreResult<Vec<Event>> {
        let built = query.clone().columns(Columns::Event).build()?;
        self.with_deadline(Operation::Filter, self.log.filter(&built))
            .await
    }

    /// Highest sequence in scope, zero if none.
    #[instrument(name = "eventstore.latest_sequence", skip_all)]
    pub async fn latest_sequence(&self, query: &SearchQueryBuilder) -> EventstoreResult<Sequence> {
        let built = query.clone().columns(Columns::MaxSequence).build()?;
        self.with_deadline(Operation::LatestSequence, self.log.latest_sequence(&built))
            .await
    }

    /// Highest position in scope, origin if none.
    #[instrument(name = "eventstore.latest_position", skip_all)]
    pub async fn latest_position(&self, query: &SearchQueryBuilder) -> EventstoreResult<Position> {
        let built = query.clone().columns(Columns::MaxPosition).build()?;
        self.with_deadline(Operation::LatestPosition, self.log.latest_position(&built))
            .await
    }

    /// Feeds matching events into `reducer`, stopping at its first error.
    #[instrument(name = "eventstore.filter_to_reducer", skip_all)]
    pub async fn filter_to_reducer<R>(
        &self,
        query: &SearchQueryBuilder,
        mut reducer: R,
    ) -> EventstoreResult<()>
    where
        R: FnMut(&Event) -> EventstoreResult<()>,
    {
        for event in self.filter(query).await? {
            reducer(&event)?;
        }
        Ok(())
    }

    /// Decodes matching events with `mapper`, skipping unregistered ones.
    #[instrument(name = "eventstore.filter_mapped", skip_all)]
    pub async fn filter_mapped<T>(
        &self,
        query: &SearchQueryBuilder,
        mapper: &EventMapper<T>,
    ) -> EventstoreResult<Vec<T>> {
        self.filter(query)
            .await?
            .iter()
            .filter_map(|event| mapper.decode(event))
            .collect()
    }

    async fn with_deadline<T>(
        &self,
        operation: Operation,
        future: impl Future<Output = EventstoreResult<T>>,
    ) -> EventstoreResult<T> {
        let timeout = self.config.operation_timeout;
        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| {
                EventstoreError::internal(
                    "EVENT-Dead1",
                    operation,
                    format!("deadline of {timeout:?} exceeded"),
                )
            })?
    }
}

fn validate_push(events: &[NewEvent]) -> EventstoreResult<()> {
    let mut expectations: HashMap<AggregateKey, ExpectedSequence> = HashMap::new();
    for event in events {
        let key = event.aggregate.key();
        if let Some(first) = expectations.get(&key) {
            if *first != event.expected {
                return Err(EventstoreError::validation(
                    "EVENT-Exp01",
                    format!(
                        "conflicting expected sequences for aggregate {key}: {first:?} and {:?}",
                        event.expected
                    ),
                ));
            }
        } else {
            expectations.insert(key, event.expected);
        }
        if let Some(constraint) = event
            .unique_constraints
            .iter()
            .find(|constraint| !constraint.is_well_formed())
        {
            return Err(EventstoreError::validation(
                "EVENT-Uniq1",
                format!(
                    "unique constraint of event {} needs a type and a field: {constraint:?}",
                    event.event_type
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::aggregate;
    use crate::types::{ActorId, EventType};
    use crate::unique::UniqueConstraint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLog {
        pushes: AtomicUsize,
    }

    impl EventLog for CountingLog {
        async fn push(&self, _events: Vec<NewEvent>) -> EventstoreResult<Vec<Event>> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn filter(&self, _query: &BuiltQuery) -> EventstoreResult<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn latest_sequence(&self, _query: &BuiltQuery) -> EventstoreResult<Sequence> {
            Ok(Sequence::zero())
        }

        async fn latest_position(&self, _query: &BuiltQuery) -> EventstoreResult<Position> {
            Ok(Position::origin())
        }
    }

    struct StalledLog;

    impl EventLog for StalledLog {
        async fn push(&self, _events: Vec<NewEvent>) -> EventstoreResult<Vec<Event>> {
            std::future::pending().await
        }

        async fn filter(&self, _query: &BuiltQuery) -> EventstoreResult<Vec<Event>> {
            std::future::pending().await
        }

        async fn latest_sequence(&self, _query: &BuiltQuery) -> EventstoreResult<Sequence> {
            std::future::pending().await
        }

        async fn latest_position(&self, _query: &BuiltQuery) -> EventstoreResult<Position> {
            std::future::pending().await
        }
    }

    fn new_event(expected: ExpectedSequence) -> NewEvent {
        NewEvent::new(
            aggregate("instance-1", "user", "user-1"),
            expected,
            EventType::try_new("user.added").unwrap(),
            ActorId::try_new("admin").unwrap(),
        )
    }

    #[tokio::test]
    async fn empty_push_is_a_noop() {
        let store = Eventstore::new(CountingLog::default(), EventstoreConfig::default());
        let pushed = store.push(Vec::new()).await.unwrap();
        assert!(pushed.is_empty());
        assert_eq!(store.log().pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conflicting_expectations_fail_before_io() {
        let store = Eventstore::new(CountingLog::default(), EventstoreConfig::default());
        let err = store
            .push(vec![
                new_event(ExpectedSequence::Exact(Sequence::zero())),
                new_event(ExpectedSequence::Exact(Sequence::new(1))),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EVENT-Exp01");
        assert_eq!(store.log().pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_unique_constraint_fails_before_io() {
        let store = Eventstore::new(CountingLog::default(), EventstoreConfig::default());
        let event = new_event(ExpectedSequence::Any)
            .with_unique_constraint(UniqueConstraint::add("username", "", "taken"));
        let err = store.push(vec![event]).await.unwrap_err();
        assert_eq!(err.code(), "EVENT-Uniq1");
        assert_eq!(store.log().pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_query_fails_before_io() {
        let store = Eventstore::new(CountingLog::default(), EventstoreConfig::default());
        let err = store.filter(&SearchQueryBuilder::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_as_internal_error() {
        let store = Eventstore::new(
            StalledLog,
            EventstoreConfig {
                operation_timeout: Duration::from_millis(50),
            },
        );
        let err = store
            .push(vec![new_event(ExpectedSequence::Any)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventstoreError::Internal {
                code: "EVENT-Dead1",
                operation: Operation::Push,
                ..
            }
        ));
    }
}
