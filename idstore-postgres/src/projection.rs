use chrono::{DateTime, Utc};
use idstore::execution::DispatchRequest;
use idstore::projection::{
    ColumnType, ColumnValue, Column, Condition, FailedEvent, InitStep, Mutation, ProjectionState,
    ProjectionStore, ProjectionTx, Statement, Table,
};
use idstore::{
    AggregateId, AggregateType, Event, EventId, EventstoreError, EventstoreResult, Identifier,
    InstanceId, Operation, Position, ProjectionError, ProjectionName, ProjectionResult, Sequence,
    Timestamp,
};
use sqlx::postgres::PgRow;
use sqlx::{query, PgConnection, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::query::to_i64;
use crate::{map_sqlx_error, sql_state, Database, TxOptions, LOCK_NOT_AVAILABLE, UNIQUE_VIOLATION};

const STATE_COLUMNS: &str = "projection_name, instance_id, aggregate_type, aggregate_id, \
     sequence, position, filter_offset, event_date, last_updated";

const FAILED_COLUMNS: &str = "projection_name, instance_id, event_id, aggregate_type, \
     aggregate_id, sequence, position, error, retry_count, last_failed";

/// Projection persistence in the `projections` and `queue` schemas.
///
/// Progress lives in `projections.current_states`, one row per projection
/// and instance. [`ProjectionStore::begin`] locks that row with
/// `FOR UPDATE NOWAIT`, so a second worker fails fast instead of queueing.
#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    database: Database,
}

impl PostgresProjectionStore {
    /// Creates a projection store on `database`.
    pub const fn new(database: Database) -> Self {
        Self { database }
    }

    /// Dispatch requests of `queue` in insertion order.
    pub async fn dispatch_requests(&self, queue: &str) -> EventstoreResult<Vec<DispatchRequest>> {
        let rows = query(
            "SELECT request FROM queue.dispatch_requests WHERE queue = $1 ORDER BY created_at, event_id",
        )
        .bind(queue)
        .fetch_all(self.database.pool())
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ApplyStatement))?;
        rows.iter()
            .map(|row| {
                let request: serde_json::Value = row.try_get("request").map_err(decode_error)?;
                serde_json::from_value(request).map_err(decode_error)
            })
            .collect()
    }
}

fn decode_error(error: impl std::fmt::Display) -> EventstoreError {
    EventstoreError::internal("POSTG-Deco2", Operation::DecodeEvent, error)
}

fn opt_u64(value: Option<i64>) -> EventstoreResult<Option<u64>> {
    value
        .map(|v| u64::try_from(v).map_err(decode_error))
        .transpose()
}

fn decode_state(row: &PgRow) -> EventstoreResult<ProjectionState> {
    let projection: String = row.try_get("projection_name").map_err(decode_error)?;
    let instance_id: String = row.try_get("instance_id").map_err(decode_error)?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(decode_error)?;
    let aggregate_id: Option<String> = row.try_get("aggregate_id").map_err(decode_error)?;
    let sequence: Option<i64> = row.try_get("sequence").map_err(decode_error)?;
    let position: i64 = row.try_get("position").map_err(decode_error)?;
    let filter_offset: i64 = row.try_get("filter_offset").map_err(decode_error)?;
    let event_date: Option<DateTime<Utc>> = row.try_get("event_date").map_err(decode_error)?;
    let last_updated: Option<DateTime<Utc>> = row.try_get("last_updated").map_err(decode_error)?;

    Ok(ProjectionState {
        projection: ProjectionName::try_new(projection).map_err(decode_error)?,
        instance_id: InstanceId::try_new(instance_id).map_err(decode_error)?,
        aggregate_type: aggregate_type
            .map(AggregateType::try_new)
            .transpose()
            .map_err(decode_error)?,
        aggregate_id: aggregate_id
            .map(AggregateId::try_new)
            .transpose()
            .map_err(decode_error)?,
        sequence: opt_u64(sequence)?.map(Sequence::new),
        position: Position::new(u64::try_from(position).map_err(decode_error)?),
        filter_offset: u64::try_from(filter_offset).map_err(decode_error)?,
        event_timestamp: event_date.map(Timestamp::new),
        last_run: last_updated.map(Timestamp::new),
    })
}

fn decode_failed(row: &PgRow) -> EventstoreResult<FailedEvent> {
    let projection: String = row.try_get("projection_name").map_err(decode_error)?;
    let instance_id: String = row.try_get("instance_id").map_err(decode_error)?;
    let event_id: Uuid = row.try_get("event_id").map_err(decode_error)?;
    let aggregate_type: String = row.try_get("aggregate_type").map_err(decode_error)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(decode_error)?;
    let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
    let position: i64 = row.try_get("position").map_err(decode_error)?;
    let error: String = row.try_get("error").map_err(decode_error)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode_error)?;
    let last_failed: DateTime<Utc> = row.try_get("last_failed").map_err(decode_error)?;

    Ok(FailedEvent {
        projection: ProjectionName::try_new(projection).map_err(decode_error)?,
        instance_id: InstanceId::try_new(instance_id).map_err(decode_error)?,
        event_id: EventId::try_new(event_id).map_err(decode_error)?,
        aggregate_type: AggregateType::try_new(aggregate_type).map_err(decode_error)?,
        aggregate_id: AggregateId::try_new(aggregate_id).map_err(decode_error)?,
        sequence: Sequence::new(u64::try_from(sequence).map_err(decode_error)?),
        position: Position::new(u64::try_from(position).map_err(decode_error)?),
        error,
        retry_count: u32::try_from(retry_count).map_err(decode_error)?,
        last_failed: Timestamp::new(last_failed),
    })
}

const fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Bool => "BOOLEAN",
        ColumnType::Int => "BIGINT",
        ColumnType::Text => "TEXT",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Json => "JSONB",
    }
}

/// Quoted SQL identifier; `schema.table` quotes each part.
///
/// Identifiers are validated lower case without quotes, so quoting only
/// keeps reserved words such as `user` or `order` usable.
fn quoted(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

fn quoted_list<'a>(names: impl IntoIterator<Item = &'a Identifier>) -> String {
    names
        .into_iter()
        .map(|name| quoted(name.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `CREATE TABLE IF NOT EXISTS` for `table`.
pub(crate) fn create_table_sql(table: &Table) -> String {
    let mut definitions: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let null = if column.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", quoted(&column.name), sql_type(column.column_type))
        })
        .collect();
    if !table.primary_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", quoted_list(&table.primary_key)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quoted(&table.name),
        definitions.join(", ")
    )
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &ColumnValue) {
    match value {
        ColumnValue::Null => {
            builder.push("NULL");
        }
        ColumnValue::Bool(value) => {
            builder.push_bind(*value);
        }
        ColumnValue::Int(value) => {
            builder.push_bind(*value);
        }
        ColumnValue::Text(value) => {
            builder.push_bind(value.clone());
        }
        ColumnValue::Timestamp(value) => {
            builder.push_bind(value.into_datetime());
        }
        ColumnValue::Json(value) => {
            builder.push_bind(value.clone());
        }
    }
}

fn push_insert(builder: &mut QueryBuilder<'static, Postgres>, table: &str, columns: &[Column]) {
    builder.push(format!(
        "INSERT INTO {} ({}) VALUES (",
        quoted(table),
        quoted_list(columns.iter().map(|c| &c.name))
    ));
    for (index, column) in columns.iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        push_value(builder, &column.value);
    }
    builder.push(")");
}

fn push_conditions(builder: &mut QueryBuilder<'static, Postgres>, conditions: &[Condition]) {
    builder.push(" WHERE ");
    for (index, condition) in conditions.iter().enumerate() {
        if index > 0 {
            builder.push(" AND ");
        }
        if condition.value == ColumnValue::Null {
            builder.push(format!("{} IS NULL", quoted(&condition.column)));
        } else {
            builder.push(format!("{} = ", quoted(&condition.column)));
            push_value(builder, &condition.value);
        }
    }
}

/// Renders a table mutation; enqueues are not table mutations and yield `None`.
pub(crate) fn mutation_sql(mutation: &Mutation) -> Option<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new("");
    match mutation {
        Mutation::Create { table, columns } => push_insert(&mut builder, table, columns),
        Mutation::Upsert {
            table,
            conflict_columns,
            columns,
        } => {
            push_insert(&mut builder, table, columns);
            let conflict = quoted_list(conflict_columns);
            let updates: Vec<String> = columns
                .iter()
                .filter(|column| !conflict_columns.contains(&column.name))
                .map(|column| format!("{0} = EXCLUDED.{0}", quoted(&column.name)))
                .collect();
            if updates.is_empty() {
                builder.push(format!(" ON CONFLICT ({conflict}) DO NOTHING"));
            } else {
                builder.push(format!(
                    " ON CONFLICT ({conflict}) DO UPDATE SET {}",
                    updates.join(", ")
                ));
            }
        }
        Mutation::Update {
            table,
            values,
            conditions,
        } => {
            builder.push(format!("UPDATE {} SET ", quoted(table)));
            for (index, column) in values.iter().enumerate() {
                if index > 0 {
                    builder.push(", ");
                }
                builder.push(format!("{} = ", quoted(&column.name)));
                push_value(&mut builder, &column.value);
            }
            push_conditions(&mut builder, conditions);
        }
        Mutation::Delete { table, conditions } => {
            builder.push(format!("DELETE FROM {}", quoted(table)));
            push_conditions(&mut builder, conditions);
        }
        Mutation::Enqueue { .. } => return None,
    }
    Some(builder)
}

async fn execute_mutation(
    connection: &mut PgConnection,
    mutation: &Mutation,
) -> EventstoreResult<()> {
    if let Mutation::Enqueue { request, options } = mutation {
        let body = serde_json::to_value(request).map_err(|error| {
            EventstoreError::internal("POSTG-Enqu1", Operation::ApplyStatement, error)
        })?;
        query(
            "INSERT INTO queue.dispatch_requests (event_id, queue, instance_id, request) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(*request.event_id.as_ref())
        .bind(&options.queue)
        .bind(request.aggregate.instance_id.as_ref())
        .bind(body)
        .execute(connection)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ApplyStatement))?;
        return Ok(());
    }

    let Some(mut builder) = mutation_sql(mutation) else {
        return Ok(());
    };
    match builder.build().execute(connection).await {
        Ok(_) => Ok(()),
        Err(error) if sql_state(&error).as_deref() == Some(UNIQUE_VIOLATION) => {
            let table = match mutation {
                Mutation::Create { table, .. } | Mutation::Upsert { table, .. } => table.to_string(),
                _ => String::new(),
            };
            Err(EventstoreError::AlreadyExists {
                code: "POSTG-Crea1",
                unique_type: table,
                unique_field: String::new(),
                message: error.to_string(),
            })
        }
        Err(error) => Err(map_sqlx_error(error, Operation::ApplyStatement)),
    }
}

impl ProjectionStore for PostgresProjectionStore {
    type Tx = PostgresProjectionTx;

    #[instrument(name = "postgres.init", skip(self, steps))]
    async fn init(&self, projection: &ProjectionName, steps: &[InitStep]) -> EventstoreResult<()> {
        for step in steps {
            match step {
                InitStep::EnsureTable(table) => {
                    if let Some((schema, _)) = table.name.split_once('.') {
                        query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema)))
                            .execute(self.database.pool())
                            .await
                            .map_err(|error| map_sqlx_error(error, Operation::InitProjection))?;
                    }
                    query(&create_table_sql(table))
                        .execute(self.database.pool())
                        .await
                        .map_err(|error| map_sqlx_error(error, Operation::InitProjection))?;
                    debug!(table = %table.name, "[postgres.init] table ensured");
                }
            }
        }
        info!("[postgres.init] projection ready");
        Ok(())
    }

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> ProjectionResult<PostgresProjectionTx> {
        query(
            "INSERT INTO projections.current_states (projection_name, instance_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(projection.as_ref())
        .bind(instance.as_ref())
        .execute(self.database.pool())
        .await
        .map_err(|error| map_sqlx_error(error, Operation::LockProjection))?;

        let mut tx = self
            .database
            .begin(TxOptions::default().read_committed())
            .await?;
        let row = query(&format!(
            "SELECT {STATE_COLUMNS} FROM projections.current_states \
             WHERE projection_name = $1 AND instance_id = $2 FOR UPDATE NOWAIT"
        ))
        .bind(projection.as_ref())
        .bind(instance.as_ref())
        .fetch_one(&mut *tx)
        .await;
        let row = match row {
            Ok(row) => row,
            Err(error) if sql_state(&error).as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                debug!("[postgres.begin] progress row locked");
                return Err(ProjectionError::Locked {
                    projection: projection.clone(),
                    instance: instance.clone(),
                });
            }
            Err(error) => return Err(map_sqlx_error(error, Operation::LockProjection).into()),
        };
        let state = decode_state(&row)?;
        Ok(PostgresProjectionTx { tx, state })
    }

    async fn state(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> EventstoreResult<Option<ProjectionState>> {
        let row = query(&format!(
            "SELECT {STATE_COLUMNS} FROM projections.current_states \
             WHERE projection_name = $1 AND instance_id = $2"
        ))
        .bind(projection.as_ref())
        .bind(instance.as_ref())
        .fetch_optional(self.database.pool())
        .await
        .map_err(|error| map_sqlx_error(error, Operation::UpdateProjectionState))?;
        row.as_ref().map(decode_state).transpose()
    }

    async fn failed_events(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> EventstoreResult<Vec<FailedEvent>> {
        let rows = query(&format!(
            "SELECT {FAILED_COLUMNS} FROM projections.failed_events \
             WHERE projection_name = $1 AND instance_id = $2 ORDER BY position, sequence"
        ))
        .bind(projection.as_ref())
        .bind(instance.as_ref())
        .fetch_all(self.database.pool())
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReadFailedEvents))?;
        rows.iter().map(decode_failed).collect()
    }
}

/// Transaction of [`PostgresProjectionStore`], holding the progress row lock.
pub struct PostgresProjectionTx {
    tx: Transaction<'static, Postgres>,
    state: ProjectionState,
}

impl std::fmt::Debug for PostgresProjectionTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProjectionTx")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PostgresProjectionTx {
    async fn savepoint(&mut self, statement: &str) -> EventstoreResult<()> {
        query(statement)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ApplyStatement))?;
        Ok(())
    }
}

impl ProjectionTx for PostgresProjectionTx {
    fn state(&self) -> &ProjectionState {
        &self.state
    }

    async fn apply(&mut self, statement: &Statement) -> EventstoreResult<()> {
        if statement.is_noop() {
            return Ok(());
        }
        self.savepoint("SAVEPOINT projection_statement").await?;
        for mutation in statement.mutations() {
            if let Err(error) = execute_mutation(&mut self.tx, mutation).await {
                self.savepoint("ROLLBACK TO SAVEPOINT projection_statement")
                    .await?;
                return Err(error);
            }
        }
        self.savepoint("RELEASE SAVEPOINT projection_statement").await
    }

    async fn failure_count(&mut self, event: &Event) -> EventstoreResult<u32> {
        let row = query(
            "SELECT retry_count FROM projections.failed_events \
             WHERE projection_name = $1 AND instance_id = $2 AND event_id = $3",
        )
        .bind(self.state.projection.as_ref())
        .bind(self.state.instance_id.as_ref())
        .bind(*event.id.as_ref())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ReadFailedEvents))?;
        match row {
            Some(row) => {
                let count: i32 = row.try_get("retry_count").map_err(decode_error)?;
                u32::try_from(count).map_err(decode_error)
            }
            None => Ok(0),
        }
    }

    async fn record_failure(
        &mut self,
        event: &Event,
        error: &EventstoreError,
    ) -> EventstoreResult<u32> {
        let row = query(&format!(
            "INSERT INTO projections.failed_events ({FAILED_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, now()) \
             ON CONFLICT (projection_name, instance_id, event_id) DO UPDATE SET \
             retry_count = projections.failed_events.retry_count + 1, \
             error = EXCLUDED.error, last_failed = EXCLUDED.last_failed \
             RETURNING retry_count"
        ))
        .bind(self.state.projection.as_ref())
        .bind(event.aggregate.instance_id.as_ref())
        .bind(*event.id.as_ref())
        .bind(event.aggregate.aggregate_type.as_ref())
        .bind(event.aggregate.id.as_ref())
        .bind(to_i64(event.sequence.into_inner(), "sequence")?)
        .bind(to_i64(event.position.into_inner(), "position")?)
        .bind(error.to_string())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::RecordFailedEvent))?;
        let count: i32 = row.try_get("retry_count").map_err(decode_error)?;
        u32::try_from(count).map_err(decode_error)
    }

    async fn commit(mut self, state: ProjectionState) -> EventstoreResult<()> {
        query(
            "UPDATE projections.current_states SET aggregate_type = $3, aggregate_id = $4, \
             sequence = $5, position = $6, filter_offset = $7, event_date = $8, last_updated = now() \
             WHERE projection_name = $1 AND instance_id = $2",
        )
        .bind(state.projection.as_ref())
        .bind(state.instance_id.as_ref())
        .bind(state.aggregate_type.as_ref().map(|t| t.as_str()))
        .bind(state.aggregate_id.as_ref().map(|id| id.as_str()))
        .bind(
            state
                .sequence
                .map(|s| to_i64(s.into_inner(), "sequence"))
                .transpose()?,
        )
        .bind(to_i64(state.position.into_inner(), "position")?)
        .bind(to_i64(state.filter_offset, "filter offset")?)
        .bind(state.event_timestamp.map(Timestamp::into_datetime))
        .execute(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::UpdateProjectionState))?;
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        debug!(position = %state.position, "[postgres.commit] progress stored");
        Ok(())
    }
}
