//! Error types for idstore.
//!
//! Every failure is classified into one of five kinds so that callers can
//! decide how to react without inspecting messages:
//!
//! - **ConcurrencyConflict**: the caller's believed sequence was stale. Refetch,
//!   rebuild the events and push again.
//! - **AlreadyExists**: a unique constraint is taken. Surface it as a business
//!   conflict, never retry automatically.
//! - **NotFound**: a point lookup missed. Empty filter results are not errors.
//! - **Internal**: storage or transport failure. Retry per caller policy.
//! - **Validation**: malformed input detected before any I/O. Never retry.
//!
//! Each error also carries a stable diagnostic code (`"EVENT-..."`,
//! `"POSTG-..."`, ...) that identifies the site that raised it.

use crate::types::{EventId, InstanceId, ProjectionName, Sequence};
use thiserror::Error;

/// Classification of an [`EventstoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Optimistic concurrency check failed.
    ConcurrencyConflict,
    /// Unique constraint violation.
    AlreadyExists,
    /// Point lookup miss.
    NotFound,
    /// Storage or transport failure.
    Internal,
    /// Malformed input, rejected before I/O.
    Validation,
}

/// Identifies the store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Appending events.
    Push,
    /// Reading events.
    Filter,
    /// Reading the latest sequence of a scope.
    LatestSequence,
    /// Reading the latest position of a scope.
    LatestPosition,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
    /// Locking the latest row of each pushed aggregate.
    LockAggregates,
    /// Allocating the global position of a push.
    AllocatePosition,
    /// Inserting event rows.
    InsertEvents,
    /// Mutating the unique constraint ledger.
    UniqueConstraints,
    /// Decoding a stored row or payload.
    DecodeEvent,
    /// Locking a projection's progress row.
    LockProjection,
    /// Applying a projection statement.
    ApplyStatement,
    /// Recording a failed event.
    RecordFailedEvent,
    /// Reading failed events.
    ReadFailedEvents,
    /// Writing projection progress.
    UpdateProjectionState,
    /// Running a projection's init check.
    InitProjection,
    /// Looking up execution targets.
    LookupTargets,
    /// Applying schema migrations.
    Migrate,
    /// Checking connectivity.
    Ping,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::Filter => "filter",
            Self::LatestSequence => "latest_sequence",
            Self::LatestPosition => "latest_position",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::LockAggregates => "lock_aggregates",
            Self::AllocatePosition => "allocate_position",
            Self::InsertEvents => "insert_events",
            Self::UniqueConstraints => "unique_constraints",
            Self::DecodeEvent => "decode_event",
            Self::LockProjection => "lock_projection",
            Self::ApplyStatement => "apply_statement",
            Self::RecordFailedEvent => "record_failed_event",
            Self::ReadFailedEvents => "read_failed_events",
            Self::UpdateProjectionState => "update_projection_state",
            Self::InitProjection => "init_projection",
            Self::LookupTargets => "lookup_targets",
            Self::Migrate => "migrate",
            Self::Ping => "ping",
        };
        f.write_str(name)
    }
}

/// Errors raised by the event log, the search query builder and the stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventstoreError {
    /// The believed sequence of an aggregate did not match the persisted one.
    #[error("[{code}] concurrency conflict on aggregate {aggregate}")]
    ConcurrencyConflict {
        /// Diagnostic code.
        code: &'static str,
        /// `instance/type/id` of the conflicting aggregate.
        aggregate: String,
        /// Sequence the caller believed to be current.
        expected: Option<Sequence>,
        /// Sequence found in the store, when known.
        current: Option<Sequence>,
    },

    /// A unique constraint key is already taken.
    #[error("[{code}] {message} (unique {unique_type}/{unique_field})")]
    AlreadyExists {
        /// Diagnostic code.
        code: &'static str,
        /// Constraint type.
        unique_type: String,
        /// Constraint field.
        unique_field: String,
        /// Business conflict message attached to the constraint.
        message: String,
    },

    /// A point lookup found nothing.
    #[error("[{code}] not found: {what}")]
    NotFound {
        /// Diagnostic code.
        code: &'static str,
        /// What was looked up.
        what: String,
    },

    /// The backing store or a collaborator failed.
    #[error("[{code}] {operation} operation failed: {detail}")]
    Internal {
        /// Diagnostic code.
        code: &'static str,
        /// The failed operation.
        operation: Operation,
        /// Rendered lower-level error.
        detail: String,
    },

    /// The input was rejected before any I/O happened.
    #[error("[{code}] invalid input: {message}")]
    Validation {
        /// Diagnostic code.
        code: &'static str,
        /// What was wrong.
        message: String,
    },
}

impl EventstoreError {
    /// Wraps a lower-level error as [`EventstoreError::Internal`].
    pub fn internal(code: &'static str, operation: Operation, error: impl std::fmt::Display) -> Self {
        Self::Internal {
            code,
            operation,
            detail: error.to_string(),
        }
    }

    /// Builds a [`EventstoreError::Validation`].
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Builds a [`EventstoreError::NotFound`].
    pub fn not_found(code: &'static str, what: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            what: what.into(),
        }
    }

    /// The taxonomy classification of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Validation { .. } => ErrorKind::Validation,
        }
    }

    /// The stable diagnostic code of the raising site.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConcurrencyConflict { code, .. }
            | Self::AlreadyExists { code, .. }
            | Self::NotFound { code, .. }
            | Self::Internal { code, .. }
            | Self::Validation { code, .. } => code,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrencyConflict | ErrorKind::Internal
        )
    }

    /// Shorthand for `kind() == ErrorKind::ConcurrencyConflict`.
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Framework-level failures of the projection handler.
///
/// Single-event failures never surface here; they are recorded as failed
/// events. These errors abort a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// Another worker holds the progress lock of this projection and instance.
    #[error("projection '{projection}' is locked for instance '{instance}'")]
    Locked {
        /// Projection name.
        projection: ProjectionName,
        /// Instance being processed.
        instance: InstanceId,
    },

    /// The projection's init check reported it is not ready.
    #[error("projection '{projection}' is not ready: {source}")]
    NotReady {
        /// Projection name.
        projection: ProjectionName,
        /// Why the init check failed.
        #[source]
        source: EventstoreError,
    },

    /// A reducer failure the projection classified as fatal.
    #[error("projection '{projection}' stopped at event {event_id}: {source}")]
    Fatal {
        /// Projection name.
        projection: ProjectionName,
        /// The event that could not be processed.
        event_id: EventId,
        /// The underlying failure.
        #[source]
        source: EventstoreError,
    },

    /// A store operation of the framework itself failed.
    #[error(transparent)]
    Store(#[from] EventstoreError),
}

/// Type alias for event store results.
pub type EventstoreResult<T> = Result<T, EventstoreError>;

/// Type alias for projection results.
pub type ProjectionResult<T> = Result<T, ProjectionError>;
