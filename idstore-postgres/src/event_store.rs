use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use idstore::search::BuiltQuery;
use idstore::{
    ActorId, AggregateId, AggregateKey, AggregateRef, AggregateType, Event, EventId, EventLog,
    EventType, EventstoreError, EventstoreResult, InstanceId, NewEvent, Operation, Position,
    ResourceOwner, Revision, Sequence, Timestamp, UniqueConstraint, UniqueConstraintAction,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{query, PgConnection, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::query::{build, instance_scope, to_i64};
use crate::{map_sqlx_error, sql_state, Database, TxOptions, UNIQUE_VIOLATION};

/// Advisory lock key of readers that are not scoped to instances.
const GLOBAL_LOCK_KEY: &str = "";

/// Event log backed by `eventstore.events`.
///
/// A push runs in one read-committed transaction:
///
/// 1. shared advisory locks on the touched instances (and the global key)
/// 2. `FOR UPDATE` on the latest row of every touched aggregate
/// 3. expected-sequence checks
/// 4. one `nextval('eventstore.positions')` for the whole push
/// 5. event inserts and unique constraint changes
///
/// The primary key `(instance_id, aggregate_type, aggregate_id, sequence)`
/// turns a lost race into a concurrency conflict: two writers that read the
/// same latest sequence both try to insert its successor. This also applies
/// to [`idstore::ExpectedSequence::Any`] pushes, which callers retry.
///
/// `allow_time_travel` is accepted but ignored; every read sees the latest
/// committed state.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    database: Database,
}

impl PostgresEventStore {
    /// Creates an event log on `database`.
    pub const fn new(database: Database) -> Self {
        Self { database }
    }

    /// The underlying database.
    pub const fn database(&self) -> &Database {
        &self.database
    }

    /// Runs `built` on a caller's connection or transaction.
    ///
    /// The read sees the transaction's own uncommitted writes.
    /// `await_open_transactions` is not applied: waiting for other writers
    /// inside an open transaction could deadlock against them.
    pub async fn filter_in(
        connection: &mut PgConnection,
        built: &BuiltQuery,
    ) -> EventstoreResult<Vec<Event>> {
        let sql = build(built, None)?;
        let rows = sql
            .to_query()
            .fetch_all(connection)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Filter))?;
        rows.iter().map(decode_event).collect()
    }

    /// Highest position that no open writer of the query's instances can
    /// still fall below.
    ///
    /// Writers hold a shared advisory lock per instance for their whole
    /// transaction; taking it exclusively waits until they committed or
    /// rolled back.
    #[instrument(name = "postgres.await_open_transactions", skip_all)]
    async fn settled_position(&self, built: &BuiltQuery) -> EventstoreResult<u64> {
        let keys = instance_scope(built).unwrap_or_else(|| vec![GLOBAL_LOCK_KEY.to_string()]);
        let mut tx = self
            .database
            .begin(TxOptions::default().read_committed())
            .await?;
        for key in &keys {
            query("SELECT pg_advisory_xact_lock(hashtext('eventstore.events'), hashtext($1))")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Filter))?;
        }
        let row = query("SELECT last_value, is_called FROM eventstore.positions")
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Filter))?;
        let last_value: i64 = row.try_get("last_value").map_err(decode_error)?;
        let is_called: bool = row.try_get("is_called").map_err(decode_error)?;
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        let bound = if is_called { last_value } else { 0 };
        debug!(bound, locks = keys.len(), "[postgres.await_open_transactions] settled");
        Ok(u64::try_from(bound).unwrap_or_default())
    }

    async fn position_bound(&self, built: &BuiltQuery) -> EventstoreResult<Option<u64>> {
        if built.await_open_transactions {
            self.settled_position(built).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn fetch_max(&self, built: &BuiltQuery, operation: Operation) -> EventstoreResult<u64> {
        let bound = self.position_bound(built).await?;
        let sql = build(built, bound)?;
        let row = sql
            .to_query()
            .fetch_one(self.database.pool())
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;
        let max: i64 = row.try_get(0).map_err(decode_error)?;
        u64::try_from(max).map_err(decode_error)
    }
}

fn decode_error(error: impl std::fmt::Display) -> EventstoreError {
    EventstoreError::internal("POSTG-Deco1", Operation::DecodeEvent, error)
}

fn decode_event(row: &PgRow) -> EventstoreResult<Event> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let instance_id: String = row.try_get("instance_id").map_err(decode_error)?;
    let aggregate_type: String = row.try_get("aggregate_type").map_err(decode_error)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(decode_error)?;
    let aggregate_version: i32 = row.try_get("aggregate_version").map_err(decode_error)?;
    let owner: String = row.try_get("owner").map_err(decode_error)?;
    let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
    let position: i64 = row.try_get("position").map_err(decode_error)?;
    let in_tx_order: i32 = row.try_get("in_tx_order").map_err(decode_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode_error)?;
    let event_type: String = row.try_get("event_type").map_err(decode_error)?;
    let revision: i32 = row.try_get("revision").map_err(decode_error)?;
    let creator: String = row.try_get("creator").map_err(decode_error)?;
    let payload: Option<Value> = row.try_get("payload").map_err(decode_error)?;

    let aggregate = AggregateRef::new(
        InstanceId::try_new(instance_id).map_err(decode_error)?,
        AggregateType::try_new(aggregate_type).map_err(decode_error)?,
        AggregateId::try_new(aggregate_id).map_err(decode_error)?,
        ResourceOwner::try_new(owner).map_err(decode_error)?,
    )
    .with_version(Revision::new(
        u16::try_from(aggregate_version).map_err(decode_error)?,
    ));

    Ok(Event {
        id: EventId::try_new(id).map_err(decode_error)?,
        aggregate,
        sequence: Sequence::new(u64::try_from(sequence).map_err(decode_error)?),
        position: Position::new(u64::try_from(position).map_err(decode_error)?),
        in_tx_order: u32::try_from(in_tx_order).map_err(decode_error)?,
        created_at: Timestamp::new(created_at),
        event_type: EventType::try_new(event_type).map_err(decode_error)?,
        revision: Revision::new(u16::try_from(revision).map_err(decode_error)?),
        creator: ActorId::try_new(creator).map_err(decode_error)?,
        payload,
    })
}

/// Latest persisted sequence of `key`, locking its newest row.
async fn lock_latest(
    connection: &mut PgConnection,
    key: &AggregateKey,
) -> EventstoreResult<Sequence> {
    let row = query(
        "SELECT sequence FROM eventstore.events \
         WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3 \
         ORDER BY sequence DESC LIMIT 1 FOR UPDATE",
    )
    .bind(key.instance_id.as_ref())
    .bind(key.aggregate_type.as_ref())
    .bind(key.aggregate_id.as_ref())
    .fetch_optional(connection)
    .await
    .map_err(|error| map_sqlx_error(error, Operation::LockAggregates))?;

    match row {
        Some(row) => {
            let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
            Ok(Sequence::new(u64::try_from(sequence).map_err(decode_error)?))
        }
        None => Ok(Sequence::zero()),
    }
}

async fn apply_unique_constraint(
    connection: &mut PgConnection,
    instance: &InstanceId,
    constraint: &UniqueConstraint,
) -> EventstoreResult<()> {
    match constraint.action {
        UniqueConstraintAction::Add => {
            let result = query(
                "INSERT INTO eventstore.unique_constraints (instance_id, unique_type, unique_field) \
                 VALUES ($1, $2, $3)",
            )
            .bind(constraint.scope(instance))
            .bind(&constraint.unique_type)
            .bind(constraint.stored_field())
            .execute(connection)
            .await;
            match result {
                Ok(_) => Ok(()),
                Err(error) if sql_state(&error).as_deref() == Some(UNIQUE_VIOLATION) => {
                    debug!(
                        unique_type = %constraint.unique_type,
                        "[postgres.push] unique constraint already taken"
                    );
                    Err(EventstoreError::AlreadyExists {
                        code: "POSTG-Uniq1",
                        unique_type: constraint.unique_type.clone(),
                        unique_field: constraint.unique_field.clone(),
                        message: constraint.error_message.clone(),
                    })
                }
                Err(error) => Err(map_sqlx_error(error, Operation::UniqueConstraints)),
            }
        }
        UniqueConstraintAction::Remove => {
            query(
                "DELETE FROM eventstore.unique_constraints \
                 WHERE instance_id = $1 AND unique_type = $2 AND unique_field = $3",
            )
            .bind(constraint.scope(instance))
            .bind(&constraint.unique_type)
            .bind(constraint.stored_field())
            .execute(connection)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::UniqueConstraints))?;
            Ok(())
        }
        UniqueConstraintAction::InstanceRemove => {
            query("DELETE FROM eventstore.unique_constraints WHERE instance_id = $1")
                .bind(instance.as_ref())
                .execute(connection)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::UniqueConstraints))?;
            Ok(())
        }
    }
}

impl EventLog for PostgresEventStore {
    #[instrument(name = "postgres.push", skip_all, fields(events = events.len()))]
    async fn push(&self, events: Vec<NewEvent>) -> EventstoreResult<Vec<Event>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self
            .database
            .begin(TxOptions::default().read_committed())
            .await?;

        // global key first, then instances in sorted order
        let lock_keys: BTreeSet<String> = std::iter::once(GLOBAL_LOCK_KEY.to_string())
            .chain(events.iter().map(|e| e.aggregate.instance_id.to_string()))
            .collect();
        for key in &lock_keys {
            query(
                "SELECT pg_advisory_xact_lock_shared(hashtext('eventstore.events'), hashtext($1))",
            )
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LockAggregates))?;
        }

        // first expectation per aggregate, locked in key order
        let mut expectations = BTreeMap::new();
        for event in &events {
            expectations
                .entry(event.aggregate.key())
                .or_insert(event.expected);
        }
        let mut latest = BTreeMap::new();
        for (key, expected) in expectations {
            let current = lock_latest(&mut tx, &key).await?;
            if !expected.matches(current) {
                debug!(aggregate = %key, %current, "[postgres.push] sequence mismatch");
                return Err(EventstoreError::ConcurrencyConflict {
                    code: "POSTG-Conc2",
                    aggregate: key.to_string(),
                    expected: expected.exact(),
                    current: Some(current),
                });
            }
            latest.insert(key, current);
        }

        let row = query("SELECT nextval('eventstore.positions') AS position, now() AS created_at")
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::AllocatePosition))?;
        let position: i64 = row.try_get("position").map_err(decode_error)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode_error)?;

        let mut pushed = Vec::with_capacity(events.len());
        for (in_tx_order, event) in (0_u32..).zip(events) {
            let key = event.aggregate.key();
            let sequence = latest
                .get(&key)
                .copied()
                .unwrap_or_else(Sequence::zero)
                .next();
            latest.insert(key, sequence);

            let id = EventId::new();
            query(
                "INSERT INTO eventstore.events (id, instance_id, aggregate_type, aggregate_id, \
                 aggregate_version, owner, sequence, position, in_tx_order, created_at, \
                 event_type, revision, creator, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(*id.as_ref())
            .bind(event.aggregate.instance_id.as_ref())
            .bind(event.aggregate.aggregate_type.as_ref())
            .bind(event.aggregate.id.as_ref())
            .bind(i32::from(event.aggregate.version.into_inner()))
            .bind(event.aggregate.resource_owner.as_ref())
            .bind(to_i64(sequence.into_inner(), "sequence")?)
            .bind(position)
            .bind(i32::try_from(in_tx_order).map_err(|_| {
                EventstoreError::validation("POSTG-Size1", "too many events in one push")
            })?)
            .bind(created_at)
            .bind(event.event_type.as_ref())
            .bind(i32::from(event.revision.into_inner()))
            .bind(event.creator.as_ref())
            .bind(event.payload.as_ref())
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::InsertEvents))?;

            for constraint in &event.unique_constraints {
                apply_unique_constraint(&mut tx, &event.aggregate.instance_id, constraint).await?;
            }

            pushed.push(Event {
                id,
                aggregate: event.aggregate,
                sequence,
                position: Position::new(u64::try_from(position).map_err(decode_error)?),
                in_tx_order,
                created_at: Timestamp::new(created_at),
                event_type: event.event_type,
                revision: event.revision,
                creator: event.creator,
                payload: event.payload,
            });
        }

        tx.commit().await.map_err(|error| {
            warn!(%error, "[postgres.push] commit failed");
            map_sqlx_error(error, Operation::CommitTransaction)
        })?;
        info!(position, events = pushed.len(), "[postgres.push] events stored");
        Ok(pushed)
    }

    #[instrument(name = "postgres.filter", skip_all)]
    async fn filter(&self, built: &BuiltQuery) -> EventstoreResult<Vec<Event>> {
        let bound = self.position_bound(built).await?;
        let sql = build(built, bound)?;
        let rows = sql
            .to_query()
            .fetch_all(self.database.pool())
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Filter))?;
        debug!(rows = rows.len(), "[postgres.filter] events read");
        rows.iter().map(decode_event).collect()
    }

    async fn latest_sequence(&self, built: &BuiltQuery) -> EventstoreResult<Sequence> {
        self.fetch_max(built, Operation::LatestSequence)
            .await
            .map(Sequence::new)
    }

    async fn latest_position(&self, built: &BuiltQuery) -> EventstoreResult<Position> {
        self.fetch_max(built, Operation::LatestPosition)
            .await
            .map(Position::new)
    }
}
