//! In-memory adapters for `idstore`
//!
//! This crate provides in-memory implementations of the [`idstore::EventLog`],
//! [`idstore::projection::ProjectionStore`] and
//! [`idstore::execution::TargetQuerier`] ports, useful for tests and
//! development where persistence is not required. They follow the same
//! semantics as the Postgres adapters: atomic pushes with sequence checks,
//! unique constraints, per-projection progress locks and savepoint-scoped
//! statements.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod event_store;
mod projection;
mod targets;

pub use event_store::InMemoryEventStore;
pub use projection::{InMemoryProjectionStore, InMemoryProjectionTx};
pub use targets::InMemoryTargetQuerier;
