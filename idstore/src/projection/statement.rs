//! Read-model mutations produced by reducers.
//!
//! A [`Statement`] is plain data. The projection store interprets it inside
//! the projection transaction, so reducers never touch a connection.

use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::{AggregateKey, Event};
use crate::execution::{DispatchRequest, EnqueueOptions};
use crate::types::{EventId, Identifier, Position, Sequence, Timestamp};
use serde_json::Value;

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Text.
    Text(String),
    /// Timestamp with time zone.
    Timestamp(Timestamp),
    /// JSONB.
    Json(Value),
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Timestamp> for ColumnValue {
    fn from(value: Timestamp) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Value> for ColumnValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

fn identifier(name: &str) -> EventstoreResult<Identifier> {
    Identifier::try_new(name).map_err(|error| {
        EventstoreError::validation("PROJE-Iden1", format!("invalid identifier '{name}': {error}"))
    })
}

/// A named column value.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: Identifier,
    /// Value.
    pub value: ColumnValue,
}

impl Column {
    /// Validates `name` and builds the column.
    pub fn new(name: &str, value: impl Into<ColumnValue>) -> EventstoreResult<Self> {
        Ok(Self {
            name: identifier(name)?,
            value: value.into(),
        })
    }
}

/// Equality condition of an update or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column name.
    pub column: Identifier,
    /// Required value.
    pub value: ColumnValue,
}

impl Condition {
    /// `column = value`
    pub fn eq(column: &str, value: impl Into<ColumnValue>) -> EventstoreResult<Self> {
        Ok(Self {
            column: identifier(column)?,
            value: value.into(),
        })
    }

    /// Whether `row` satisfies the condition.
    pub fn matches(&self, row: &[Column]) -> bool {
        row.iter()
            .find(|column| column.name == self.column)
            .map_or(self.value == ColumnValue::Null, |column| {
                column.value == self.value
            })
    }
}

/// One read-model change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert a row.
    Create {
        /// Target table.
        table: Identifier,
        /// Row values.
        columns: Vec<Column>,
    },
    /// Insert a row or update it on conflict.
    Upsert {
        /// Target table.
        table: Identifier,
        /// Columns identifying the row.
        conflict_columns: Vec<Identifier>,
        /// Row values.
        columns: Vec<Column>,
    },
    /// Update matching rows.
    Update {
        /// Target table.
        table: Identifier,
        /// New values.
        values: Vec<Column>,
        /// Row selection.
        conditions: Vec<Condition>,
    },
    /// Delete matching rows.
    Delete {
        /// Target table.
        table: Identifier,
        /// Row selection.
        conditions: Vec<Condition>,
    },
    /// Enqueue a dispatch request; idempotent per event id.
    Enqueue {
        /// Request to deliver.
        request: DispatchRequest,
        /// Queue options.
        options: EnqueueOptions,
    },
}

impl Mutation {
    /// Insert into `table`.
    pub fn create(table: &str, columns: Vec<Column>) -> EventstoreResult<Self> {
        Ok(Self::Create {
            table: identifier(table)?,
            columns,
        })
    }

    /// Upsert into `table` keyed by `conflict_columns`.
    pub fn upsert(
        table: &str,
        conflict_columns: &[&str],
        columns: Vec<Column>,
    ) -> EventstoreResult<Self> {
        let conflict_columns = conflict_columns
            .iter()
            .map(|name| identifier(name))
            .collect::<EventstoreResult<Vec<_>>>()?;
        if conflict_columns.is_empty() {
            return Err(EventstoreError::validation(
                "PROJE-Upse1",
                "upsert needs at least one conflict column",
            ));
        }
        Ok(Self::Upsert {
            table: identifier(table)?,
            conflict_columns,
            columns,
        })
    }

    /// Update rows of `table` matching every condition.
    pub fn update(
        table: &str,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> EventstoreResult<Self> {
        if conditions.is_empty() {
            return Err(EventstoreError::validation(
                "PROJE-Updt1",
                "update without conditions",
            ));
        }
        Ok(Self::Update {
            table: identifier(table)?,
            values,
            conditions,
        })
    }

    /// Delete rows of `table` matching every condition.
    pub fn delete(table: &str, conditions: Vec<Condition>) -> EventstoreResult<Self> {
        if conditions.is_empty() {
            return Err(EventstoreError::validation(
                "PROJE-Dele1",
                "delete without conditions",
            ));
        }
        Ok(Self::Delete {
            table: identifier(table)?,
            conditions,
        })
    }
}

/// The outcome of reducing one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Reduced event.
    pub event_id: EventId,
    /// Aggregate of the reduced event.
    pub aggregate: AggregateKey,
    /// Sequence of the reduced event.
    pub sequence: Sequence,
    /// Position of the reduced event.
    pub position: Position,
    /// `None` is a no-op that still advances progress.
    pub execute: Option<Vec<Mutation>>,
}

impl Statement {
    /// A statement that changes nothing.
    pub fn noop(event: &Event) -> Self {
        Self {
            event_id: event.id,
            aggregate: event.aggregate.key(),
            sequence: event.sequence,
            position: event.position,
            execute: None,
        }
    }

    /// A statement applying `mutations` in order.
    pub fn new(event: &Event, mutations: Vec<Mutation>) -> Self {
        Self {
            execute: Some(mutations),
            ..Self::noop(event)
        }
    }

    /// Whether applying the statement changes nothing.
    pub fn is_noop(&self) -> bool {
        self.execute.as_ref().map_or(true, Vec::is_empty)
    }

    /// The mutations, empty for a no-op.
    pub fn mutations(&self) -> &[Mutation] {
        self.execute.as_deref().unwrap_or_default()
    }
}

/// Column data type of a projection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// `BOOLEAN`
    Bool,
    /// `BIGINT`
    Int,
    /// `TEXT`
    Text,
    /// `TIMESTAMPTZ`
    Timestamp,
    /// `JSONB`
    Json,
}

/// Column definition of a projection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name.
    pub name: Identifier,
    /// Data type.
    pub column_type: ColumnType,
    /// Whether `NULL` is allowed.
    pub nullable: bool,
}

/// Definition of a projection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Schema-qualified table name.
    pub name: Identifier,
    /// Columns in declaration order.
    pub columns: Vec<ColumnSpec>,
    /// Primary key columns.
    pub primary_key: Vec<Identifier>,
}

impl Table {
    /// Starts a table definition.
    pub fn new(name: &str) -> EventstoreResult<Self> {
        Ok(Self {
            name: identifier(name)?,
            columns: Vec::new(),
            primary_key: Vec::new(),
        })
    }

    /// Adds a `NOT NULL` column.
    pub fn column(mut self, name: &str, column_type: ColumnType) -> EventstoreResult<Self> {
        self.columns.push(ColumnSpec {
            name: identifier(name)?,
            column_type,
            nullable: false,
        });
        Ok(self)
    }

    /// Adds a nullable column.
    pub fn nullable_column(mut self, name: &str, column_type: ColumnType) -> EventstoreResult<Self> {
        self.columns.push(ColumnSpec {
            name: identifier(name)?,
            column_type,
            nullable: true,
        });
        Ok(self)
    }

    /// Sets the primary key; every column must be declared.
    pub fn primary_key(mut self, columns: &[&str]) -> EventstoreResult<Self> {
        let key = columns
            .iter()
            .map(|name| identifier(name))
            .collect::<EventstoreResult<Vec<_>>>()?;
        if let Some(missing) = key
            .iter()
            .find(|name| !self.columns.iter().any(|c| &c.name == *name))
        {
            return Err(EventstoreError::validation(
                "PROJE-Pkey1",
                format!("primary key column {missing} is not declared"),
            ));
        }
        self.primary_key = key;
        Ok(self)
    }
}

/// Readiness predicate of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStep {
    /// The table exists, created if missing.
    EnsureTable(Table),
}
