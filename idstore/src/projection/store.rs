use super::{FailedEvent, InitStep, ProjectionState, Statement};
use crate::errors::{EventstoreError, EventstoreResult, ProjectionResult};
use crate::event::Event;
use crate::types::{InstanceId, ProjectionName};
use std::future::Future;

/// Persistence of read models, progress and failed events.
///
/// Implementations:
/// - `idstore-postgres`: tables in the `projections` schema, row locks per progress row
/// - `idstore-memory`: maps guarded by per-key async mutexes
pub trait ProjectionStore: Send + Sync {
    /// A transaction holding the progress lock of one projection and instance.
    type Tx: ProjectionTx;

    /// Runs the readiness predicates, creating missing tables.
    fn init(
        &self,
        projection: &ProjectionName,
        steps: &[InitStep],
    ) -> impl Future<Output = EventstoreResult<()>> + Send;

    /// Opens a transaction and locks the progress row.
    ///
    /// Fails with [`crate::ProjectionError::Locked`] without waiting when
    /// another worker holds the lock.
    fn begin(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> impl Future<Output = ProjectionResult<Self::Tx>> + Send;

    /// Committed progress, if any.
    fn state(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> impl Future<Output = EventstoreResult<Option<ProjectionState>>> + Send;

    /// Recorded failures, ordered by position.
    fn failed_events(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> impl Future<Output = EventstoreResult<Vec<FailedEvent>>> + Send;
}

/// An open projection transaction.
///
/// Dropping it without [`ProjectionTx::commit`] discards every change.
pub trait ProjectionTx: Send {
    /// Progress as of the start of the transaction.
    fn state(&self) -> &ProjectionState;

    /// Applies a statement inside a savepoint; on error nothing of it remains.
    fn apply(&mut self, statement: &Statement)
        -> impl Future<Output = EventstoreResult<()>> + Send;

    /// Persisted failure count of `event`, zero if it never failed.
    fn failure_count(&mut self, event: &Event) -> impl Future<Output = EventstoreResult<u32>> + Send;

    /// Records a failure of `event` and returns the new failure count.
    fn record_failure(
        &mut self,
        event: &Event,
        error: &EventstoreError,
    ) -> impl Future<Output = EventstoreResult<u32>> + Send;

    /// Writes `state` and commits everything applied so far.
    fn commit(self, state: ProjectionState) -> impl Future<Output = EventstoreResult<()>> + Send;
}
