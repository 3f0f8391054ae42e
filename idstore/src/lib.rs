//! `idstore` - event-sourced persistence core for a multi-tenant identity platform
//!
//! Every state change of a domain object is recorded as an immutable event in
//! a per-aggregate, totally ordered stream. This crate provides:
//!
//! - the event model and the [`EventLog`] port with its validating [`Eventstore`] facade
//! - the unique constraint ledger entries pushed together with events
//! - the [`SearchQueryBuilder`] turning read requests into filter groups
//! - the [`EventMapper`] registry and hierarchical event-type [`matcher`]
//! - the [`projection`] framework folding events into read models
//! - the [`execution`] projection producing webhook dispatch requests
//!
//! Storage backends live in `idstore-postgres` and `idstore-memory`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod errors;
pub mod event;
pub mod execution;
pub mod log;
pub mod mapper;
pub mod matcher;
pub mod projection;
pub mod retry;
pub mod search;
pub mod types;
pub mod unique;

pub use errors::{
    ErrorKind, EventstoreError, EventstoreResult, Operation, ProjectionError, ProjectionResult,
};
pub use event::{AggregateKey, AggregateRef, Event, ExpectedSequence, NewEvent};
pub use log::{EventLog, Eventstore, EventstoreConfig};
pub use mapper::{EventMapper, EventMapperBuilder};
pub use search::{BuiltQuery, SearchQuery, SearchQueryBuilder};
pub use types::{
    ActorId, AggregateId, AggregateType, EventId, EventType, Identifier, InstanceId, Position,
    ProjectionName, ResourceOwner, Revision, Sequence, Timestamp,
};
pub use unique::{UniqueConstraint, UniqueConstraintAction};
