use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use idstore::execution::DispatchRequest;
use idstore::projection::{
    Column, ColumnValue, Condition, InitStep, Mutation, ProjectionStore, ProjectionTx, Statement,
    Table,
};
use idstore::projection::{FailedEvent, ProjectionState};
use idstore::{
    Event, EventId, EventstoreError, EventstoreResult, Identifier, InstanceId, Operation,
    ProjectionError, ProjectionName, ProjectionResult,
};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument};

type StateKey = (ProjectionName, InstanceId);
type FailureKey = (ProjectionName, InstanceId, EventId);

#[derive(Debug, Clone)]
struct TableData {
    spec: Table,
    rows: Vec<Vec<Column>>,
}

#[derive(Default)]
struct ProjectionData {
    tables: HashMap<Identifier, TableData>,
    states: HashMap<StateKey, ProjectionState>,
    failed: HashMap<FailureKey, FailedEvent>,
    queue: Vec<(String, DispatchRequest)>,
    queued: HashSet<EventId>,
}

/// In-memory read models, progress rows, failed events and dispatch queue.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    data: Arc<Mutex<ProjectionData>>,
    locks: Arc<Mutex<HashMap<StateKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InMemoryProjectionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Vec<Column>> {
        Identifier::try_new(table)
            .ok()
            .and_then(|name| self.data.lock().tables.get(&name).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    /// Committed dispatch requests with their queue, in enqueue order.
    pub fn dispatch_requests(&self) -> Vec<(String, DispatchRequest)> {
        self.data.lock().queue.clone()
    }
}

fn not_found(table: &Identifier) -> EventstoreError {
    EventstoreError::internal(
        "MEMOR-Tabl1",
        Operation::ApplyStatement,
        format!("relation {table} does not exist"),
    )
}

fn column_error(table: &Identifier, detail: String) -> EventstoreError {
    EventstoreError::internal(
        "MEMOR-Colm1",
        Operation::ApplyStatement,
        format!("{table}: {detail}"),
    )
}

impl TableData {
    fn new(spec: Table) -> Self {
        Self {
            spec,
            rows: Vec::new(),
        }
    }

    fn check_columns(&self, columns: &[Column]) -> EventstoreResult<()> {
        for column in columns {
            if !self.spec.columns.iter().any(|spec| spec.name == column.name) {
                return Err(column_error(
                    &self.spec.name,
                    format!("column {} does not exist", column.name),
                ));
            }
        }
        Ok(())
    }

    /// Full row in declaration order; missing columns are `NULL`.
    fn build_row(&self, columns: &[Column]) -> EventstoreResult<Vec<Column>> {
        self.check_columns(columns)?;
        self.spec
            .columns
            .iter()
            .map(|spec| {
                let value = columns
                    .iter()
                    .find(|column| column.name == spec.name)
                    .map_or(ColumnValue::Null, |column| column.value.clone());
                if value == ColumnValue::Null && !spec.nullable {
                    return Err(column_error(
                        &self.spec.name,
                        format!("null value in column {} violates not-null constraint", spec.name),
                    ));
                }
                Ok(Column {
                    name: spec.name.clone(),
                    value,
                })
            })
            .collect()
    }

    fn key_conditions(row: &[Column], key: &[Identifier]) -> Vec<Condition> {
        key.iter()
            .map(|name| Condition {
                column: name.clone(),
                value: row
                    .iter()
                    .find(|column| &column.name == name)
                    .map_or(ColumnValue::Null, |column| column.value.clone()),
            })
            .collect()
    }

    fn position(&self, conditions: &[Condition]) -> Option<usize> {
        if conditions.is_empty() {
            return None;
        }
        self.rows
            .iter()
            .position(|row| conditions.iter().all(|condition| condition.matches(row)))
    }

    fn set(row: &mut [Column], values: &[Column]) {
        for value in values {
            if let Some(column) = row.iter_mut().find(|column| column.name == value.name) {
                column.value = value.value.clone();
            }
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> EventstoreResult<()> {
        match mutation {
            Mutation::Create { columns, .. } => {
                let row = self.build_row(columns)?;
                let key = Self::key_conditions(&row, &self.spec.primary_key);
                if self.position(&key).is_some() {
                    return Err(EventstoreError::AlreadyExists {
                        code: "MEMOR-Crea1",
                        unique_type: self.spec.name.to_string(),
                        unique_field: format!("{key:?}"),
                        message: "duplicate key value violates unique constraint".to_string(),
                    });
                }
                self.rows.push(row);
            }
            Mutation::Upsert {
                conflict_columns,
                columns,
                ..
            } => {
                let row = self.build_row(columns)?;
                let key = Self::key_conditions(&row, conflict_columns);
                match self.position(&key) {
                    Some(index) => Self::set(&mut self.rows[index], columns),
                    None => self.rows.push(row),
                }
            }
            Mutation::Update {
                values, conditions, ..
            } => {
                self.check_columns(values)?;
                for row in &mut self.rows {
                    if conditions.iter().all(|condition| condition.matches(row)) {
                        Self::set(row, values);
                    }
                }
            }
            Mutation::Delete { conditions, .. } => {
                self.rows
                    .retain(|row| !conditions.iter().all(|condition| condition.matches(row)));
            }
            Mutation::Enqueue { .. } => {}
        }
        Ok(())
    }
}

fn table_of(mutation: &Mutation) -> Option<&Identifier> {
    match mutation {
        Mutation::Create { table, .. }
        | Mutation::Upsert { table, .. }
        | Mutation::Update { table, .. }
        | Mutation::Delete { table, .. } => Some(table),
        Mutation::Enqueue { .. } => None,
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    type Tx = InMemoryProjectionTx;

    async fn init(&self, projection: &ProjectionName, steps: &[InitStep]) -> EventstoreResult<()> {
        let mut data = self.data.lock();
        for step in steps {
            match step {
                InitStep::EnsureTable(table) => {
                    if let Entry::Vacant(entry) = data.tables.entry(table.name.clone()) {
                        debug!(%projection, table = %table.name, "[memory.init] table created");
                        entry.insert(TableData::new(table.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    #[instrument(name = "memory.begin", skip(self))]
    async fn begin(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> ProjectionResult<InMemoryProjectionTx> {
        let key = (projection.clone(), instance.clone());
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = lock
            .try_lock_owned()
            .map_err(|_| ProjectionError::Locked {
                projection: projection.clone(),
                instance: instance.clone(),
            })?;
        let state = self
            .data
            .lock()
            .states
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ProjectionState::initial(projection.clone(), instance.clone()));
        Ok(InMemoryProjectionTx {
            data: Arc::clone(&self.data),
            _guard: guard,
            state,
            tables: HashMap::new(),
            applied: Vec::new(),
            queued: Vec::new(),
            failures: HashMap::new(),
        })
    }

    async fn state(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> EventstoreResult<Option<ProjectionState>> {
        Ok(self
            .data
            .lock()
            .states
            .get(&(projection.clone(), instance.clone()))
            .cloned())
    }

    async fn failed_events(
        &self,
        projection: &ProjectionName,
        instance: &InstanceId,
    ) -> EventstoreResult<Vec<FailedEvent>> {
        let mut failed: Vec<FailedEvent> = self
            .data
            .lock()
            .failed
            .values()
            .filter(|failed| &failed.projection == projection && &failed.instance_id == instance)
            .cloned()
            .collect();
        failed.sort_by_key(|failed| (failed.position, failed.sequence));
        Ok(failed)
    }
}

/// Transaction of [`InMemoryProjectionStore`].
///
/// Statements run against private table overlays, which act as savepoints.
/// The mutations of every successful statement are logged and replayed onto
/// the shared tables on commit, so transactions holding different progress
/// locks never overwrite each other's rows. Dropping the transaction discards
/// the log and releases the progress lock.
pub struct InMemoryProjectionTx {
    data: Arc<Mutex<ProjectionData>>,
    _guard: OwnedMutexGuard<()>,
    state: ProjectionState,
    tables: HashMap<Identifier, TableData>,
    applied: Vec<Mutation>,
    queued: Vec<(String, DispatchRequest)>,
    failures: HashMap<EventId, FailedEvent>,
}

impl InMemoryProjectionTx {
    fn failure_key(&self, event: &Event) -> FailureKey {
        (
            self.state.projection.clone(),
            self.state.instance_id.clone(),
            event.id,
        )
    }

    fn existing_failure(&self, event: &Event) -> Option<FailedEvent> {
        self.failures.get(&event.id).cloned().or_else(|| {
            self.data
                .lock()
                .failed
                .get(&self.failure_key(event))
                .cloned()
        })
    }
}

impl ProjectionTx for InMemoryProjectionTx {
    fn state(&self) -> &ProjectionState {
        &self.state
    }

    async fn apply(&mut self, statement: &Statement) -> EventstoreResult<()> {
        if statement.is_noop() {
            return Ok(());
        }
        // savepoint: work on copies and keep them only if every mutation succeeds
        let mut tables = self.tables.clone();
        let mut queued = self.queued.clone();
        {
            let data = self.data.lock();
            for mutation in statement.mutations() {
                if let Mutation::Enqueue { request, options } = mutation {
                    let already = data.queued.contains(&request.event_id)
                        || queued.iter().any(|(_, r)| r.event_id == request.event_id);
                    if !already {
                        queued.push((options.queue.clone(), request.clone()));
                    }
                    continue;
                }
                let Some(name) = table_of(mutation) else {
                    continue;
                };
                let table = match tables.entry(name.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let base = data.tables.get(name).cloned().ok_or_else(|| not_found(name))?;
                        entry.insert(base)
                    }
                };
                table.apply(mutation)?;
            }
        }
        self.tables = tables;
        self.queued = queued;
        self.applied.extend(
            statement
                .mutations()
                .iter()
                .filter(|mutation| table_of(mutation).is_some())
                .cloned(),
        );
        Ok(())
    }

    async fn failure_count(&mut self, event: &Event) -> EventstoreResult<u32> {
        Ok(self
            .existing_failure(event)
            .map_or(0, |failed| failed.retry_count))
    }

    async fn record_failure(
        &mut self,
        event: &Event,
        error: &EventstoreError,
    ) -> EventstoreResult<u32> {
        let failed = match self.existing_failure(event) {
            Some(mut failed) => {
                failed.failed_again(error);
                failed
            }
            None => FailedEvent::first(self.state.projection.clone(), event, error),
        };
        let count = failed.retry_count;
        self.failures.insert(event.id, failed);
        Ok(count)
    }

    async fn commit(self, state: ProjectionState) -> EventstoreResult<()> {
        let mut data = self.data.lock();
        // replay on copies first so a failing mutation leaves nothing behind
        let mut touched: HashMap<Identifier, TableData> = HashMap::new();
        for mutation in &self.applied {
            let Some(name) = table_of(mutation) else {
                continue;
            };
            let table = match touched.entry(name.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let base = data.tables.get(name).cloned().ok_or_else(|| not_found(name))?;
                    entry.insert(base)
                }
            };
            table.apply(mutation)?;
        }
        data.tables.extend(touched);
        for (queue, request) in self.queued {
            if data.queued.insert(request.event_id) {
                data.queue.push((queue, request));
            }
        }
        for (event_id, failed) in self.failures {
            data.failed.insert(
                (failed.projection.clone(), failed.instance_id.clone(), event_id),
                failed,
            );
        }
        data.states
            .insert((state.projection.clone(), state.instance_id.clone()), state);
        Ok(())
    }
}
