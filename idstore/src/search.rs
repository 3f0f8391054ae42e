//! Search query builder.
//!
//! A [`SearchQueryBuilder`] describes which events to read. Builder-level
//! fields (instances, resource owner, creator, position cursor) apply to every
//! subquery; each [`SearchQuery`] adds its own conditions. [`SearchQueryBuilder::build`]
//! validates everything and produces OR-of-AND [`Filter`] groups that the
//! stores evaluate, in memory via [`Filter::matches`] or translated to SQL.
//!
//! ```
//! use idstore::search::{SearchQuery, SearchQueryBuilder};
//! use idstore::{AggregateType, InstanceId};
//!
//! let query = SearchQueryBuilder::new()
//!     .instance_id(InstanceId::try_new("instance-1").unwrap())
//!     .add_query(SearchQuery::new().aggregate_types([AggregateType::try_new("user").unwrap()]))
//!     .build()
//!     .unwrap();
//! assert_eq!(query.filters.len(), 1);
//! ```

use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::Event;
use crate::types::{
    ActorId, AggregateId, AggregateType, EventType, InstanceId, Position, ResourceOwner, Sequence,
    Timestamp,
};
use serde_json::Value;

/// What a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Columns {
    /// Full events.
    #[default]
    Event,
    /// Highest sequence in scope.
    MaxSequence,
    /// Highest position in scope.
    MaxPosition,
}

/// Scan direction over `(position, in_tx_order)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first.
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

/// Event attribute a filter tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// `aggregate.instance_id`
    InstanceId,
    /// `aggregate.resource_owner`
    ResourceOwner,
    /// `creator`
    Creator,
    /// `aggregate.aggregate_type`
    AggregateType,
    /// `aggregate.id`
    AggregateId,
    /// `event_type`
    EventType,
    /// `sequence`
    Sequence,
    /// `created_at`
    CreatedAt,
    /// `position`
    Position,
    /// `payload`
    Payload,
}

/// Comparison a filter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperation {
    /// `=`
    Equals,
    /// `= ANY(list)`
    In,
    /// `<> ALL(list)`
    NotIn,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEquals,
    /// `<`
    Less,
    /// JSON containment (`@>`).
    JsonContains,
}

/// Value a filter compares against.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// Single string.
    Text(String),
    /// Non-empty list of strings.
    TextList(Vec<String>),
    /// Sequence or position.
    Number(u64),
    /// Point in time.
    Timestamp(Timestamp),
    /// JSON object for containment.
    Json(Value),
}

/// One condition of a filter group.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Tested attribute.
    pub field: Field,
    /// Comparison.
    pub operation: FilterOperation,
    /// Operand.
    pub value: FilterValue,
}

impl Filter {
    /// Creates a filter.
    pub const fn new(field: Field, operation: FilterOperation, value: FilterValue) -> Self {
        Self {
            field,
            operation,
            value,
        }
    }

    fn text_or_list<T: AsRef<str>>(field: Field, values: &[T]) -> Self {
        match values {
            [single] => Self::new(
                field,
                FilterOperation::Equals,
                FilterValue::Text(single.as_ref().to_string()),
            ),
            many => Self::new(
                field,
                FilterOperation::In,
                FilterValue::TextList(many.iter().map(|v| v.as_ref().to_string()).collect()),
            ),
        }
    }

    /// Evaluates the filter against an event.
    pub fn matches(&self, event: &Event) -> bool {
        match (self.field, &self.value) {
            (Field::Sequence, FilterValue::Number(n)) => {
                compare(self.operation, &event.sequence.into_inner(), n)
            }
            (Field::Position, FilterValue::Number(n)) => {
                compare(self.operation, &event.position.into_inner(), n)
            }
            (Field::CreatedAt, FilterValue::Timestamp(t)) => {
                compare(self.operation, &event.created_at, t)
            }
            (Field::Payload, FilterValue::Json(needle)) => {
                self.operation == FilterOperation::JsonContains
                    && event
                        .payload
                        .as_ref()
                        .is_some_and(|payload| json_contains(payload, needle))
            }
            (field, value) => {
                let Some(actual) = text_field(event, field) else {
                    return false;
                };
                match (self.operation, value) {
                    (FilterOperation::Equals, FilterValue::Text(expected)) => actual == expected,
                    (FilterOperation::In, FilterValue::TextList(list)) => {
                        list.iter().any(|v| v == actual)
                    }
                    (FilterOperation::NotIn, FilterValue::TextList(list)) => {
                        list.iter().all(|v| v != actual)
                    }
                    _ => false,
                }
            }
        }
    }
}

fn text_field(event: &Event, field: Field) -> Option<&str> {
    match field {
        Field::InstanceId => Some(event.aggregate.instance_id.as_ref()),
        Field::ResourceOwner => Some(event.aggregate.resource_owner.as_ref()),
        Field::Creator => Some(event.creator.as_ref()),
        Field::AggregateType => Some(event.aggregate.aggregate_type.as_ref()),
        Field::AggregateId => Some(event.aggregate.id.as_ref()),
        Field::EventType => Some(event.event_type.as_ref()),
        Field::Sequence | Field::CreatedAt | Field::Position | Field::Payload => None,
    }
}

fn compare<T: PartialOrd>(operation: FilterOperation, actual: &T, operand: &T) -> bool {
    match operation {
        FilterOperation::Equals => actual == operand,
        FilterOperation::Greater => actual > operand,
        FilterOperation::GreaterOrEquals => actual >= operand,
        FilterOperation::Less => actual < operand,
        FilterOperation::In | FilterOperation::NotIn | FilterOperation::JsonContains => false,
    }
}

/// JSONB `@>` semantics: every part of `needle` is present in `haystack`.
///
/// A bare scalar is contained in an array only at the top level, so
/// `["admin"] @> "admin"` holds but `{"roles": ["admin"]} @> {"roles": "admin"}`
/// does not.
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    contains(haystack, needle, true)
}

fn contains(haystack: &Value, needle: &Value, top_level: bool) -> bool {
    match (haystack, needle) {
        (Value::Object(hay), Value::Object(needle)) => needle
            .iter()
            .all(|(key, value)| hay.get(key).is_some_and(|h| contains(h, value, false))),
        (Value::Array(hay), Value::Array(needle)) => needle
            .iter()
            .all(|value| hay.iter().any(|h| contains(h, value, false))),
        (Value::Array(hay), scalar) if top_level && !scalar.is_object() => hay.contains(scalar),
        (hay, needle) => hay == needle,
    }
}

/// Per-subquery conditions, ANDed together. Subqueries are ORed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    aggregate_types: Option<Vec<AggregateType>>,
    aggregate_ids: Option<Vec<AggregateId>>,
    event_types: Option<Vec<EventType>>,
    sequence_greater: Option<Sequence>,
    sequence_less: Option<Sequence>,
    created_after: Option<Timestamp>,
    position_after: Option<Position>,
    event_data: Option<Value>,
}

impl SearchQuery {
    /// An empty subquery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to these aggregate types.
    #[must_use]
    pub fn aggregate_types(mut self, types: impl IntoIterator<Item = AggregateType>) -> Self {
        self.aggregate_types = Some(types.into_iter().collect());
        self
    }

    /// Restricts to these aggregate ids.
    #[must_use]
    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = AggregateId>) -> Self {
        self.aggregate_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts to these event types.
    #[must_use]
    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    /// Events after `sequence` in scan direction.
    #[must_use]
    pub const fn sequence_greater(mut self, sequence: Sequence) -> Self {
        self.sequence_greater = Some(sequence);
        self
    }

    /// Events before `sequence` in scan direction.
    #[must_use]
    pub const fn sequence_less(mut self, sequence: Sequence) -> Self {
        self.sequence_less = Some(sequence);
        self
    }

    /// Events created strictly after `timestamp`.
    #[must_use]
    pub const fn created_after(mut self, timestamp: Timestamp) -> Self {
        self.created_after = Some(timestamp);
        self
    }

    /// Events at a position strictly greater than `position`.
    #[must_use]
    pub const fn position_after(mut self, position: Position) -> Self {
        self.position_after = Some(position);
        self
    }

    /// Events whose payload contains this JSON object.
    #[must_use]
    pub fn event_data(mut self, data: Value) -> Self {
        self.event_data = Some(data);
        self
    }

    fn filters(&self, order: Order) -> EventstoreResult<Vec<Filter>> {
        let mut filters = Vec::new();
        if let Some(types) = &self.aggregate_types {
            non_empty("aggregate types", types)?;
            filters.push(Filter::text_or_list(Field::AggregateType, types));
        }
        if let Some(ids) = &self.aggregate_ids {
            non_empty("aggregate ids", ids)?;
            filters.push(Filter::text_or_list(Field::AggregateId, ids));
        }
        if let Some(types) = &self.event_types {
            non_empty("event types", types)?;
            filters.push(Filter::text_or_list(Field::EventType, types));
        }
        let (after, before) = match order {
            Order::Asc => (FilterOperation::Greater, FilterOperation::Less),
            Order::Desc => (FilterOperation::Less, FilterOperation::Greater),
        };
        if let Some(sequence) = self.sequence_greater {
            filters.push(Filter::new(
                Field::Sequence,
                after,
                FilterValue::Number(sequence.into_inner()),
            ));
        }
        if let Some(sequence) = self.sequence_less {
            filters.push(Filter::new(
                Field::Sequence,
                before,
                FilterValue::Number(sequence.into_inner()),
            ));
        }
        if let Some(timestamp) = self.created_after {
            filters.push(Filter::new(
                Field::CreatedAt,
                FilterOperation::Greater,
                FilterValue::Timestamp(timestamp),
            ));
        }
        if let Some(position) = self.position_after {
            filters.push(Filter::new(
                Field::Position,
                FilterOperation::Greater,
                FilterValue::Number(position.into_inner()),
            ));
        }
        if let Some(data) = &self.event_data {
            if !data.is_object() {
                return Err(EventstoreError::validation(
                    "SEARC-Json1",
                    "event data filter must be a JSON object",
                ));
            }
            filters.push(Filter::new(
                Field::Payload,
                FilterOperation::JsonContains,
                FilterValue::Json(data.clone()),
            ));
        }
        Ok(filters)
    }
}

fn non_empty<T>(what: &str, values: &[T]) -> EventstoreResult<()> {
    if values.is_empty() {
        return Err(EventstoreError::validation(
            "SEARC-Empt1",
            format!("{what} filter must not be empty"),
        ));
    }
    Ok(())
}

/// Describes a read from the event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQueryBuilder {
    instance_ids: Vec<InstanceId>,
    excluded_instances: Vec<InstanceId>,
    resource_owner: Option<ResourceOwner>,
    creator: Option<ActorId>,
    position_at_least: Option<Position>,
    limit: Option<u64>,
    offset: u64,
    order: Order,
    columns: Columns,
    await_open_transactions: bool,
    allow_time_travel: bool,
    queries: Vec<SearchQuery>,
}

impl SearchQueryBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one instance.
    #[must_use]
    pub fn instance_id(mut self, instance: InstanceId) -> Self {
        self.instance_ids = vec![instance];
        self
    }

    /// Restricts to any of these instances.
    #[must_use]
    pub fn instance_ids(mut self, instances: impl IntoIterator<Item = InstanceId>) -> Self {
        self.instance_ids = instances.into_iter().collect();
        self
    }

    /// Excludes these instances.
    #[must_use]
    pub fn exclude_instances(mut self, instances: impl IntoIterator<Item = InstanceId>) -> Self {
        self.excluded_instances = instances.into_iter().collect();
        self
    }

    /// Restricts to aggregates owned by `owner`.
    #[must_use]
    pub fn resource_owner(mut self, owner: ResourceOwner) -> Self {
        self.resource_owner = Some(owner);
        self
    }

    /// Restricts to events caused by `creator`.
    #[must_use]
    pub fn creator(mut self, creator: ActorId) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Events at `position` or later.
    #[must_use]
    pub const fn position_at_least(mut self, position: Position) -> Self {
        self.position_at_least = Some(position);
        self
    }

    /// Maximum number of events; `0` means unlimited.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = if limit == 0 { None } else { Some(limit) };
        self
    }

    /// Number of matching events to skip.
    #[must_use]
    pub const fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Oldest first.
    #[must_use]
    pub const fn order_asc(mut self) -> Self {
        self.order = Order::Asc;
        self
    }

    /// Newest first.
    #[must_use]
    pub const fn order_desc(mut self) -> Self {
        self.order = Order::Desc;
        self
    }

    /// Selects what the query returns.
    #[must_use]
    pub const fn columns(mut self, columns: Columns) -> Self {
        self.columns = columns;
        self
    }

    /// Hide events of transactions that may still be overtaken by open ones.
    #[must_use]
    pub const fn await_open_transactions(mut self) -> Self {
        self.await_open_transactions = true;
        self
    }

    /// Allow reading from a possibly stale snapshot.
    #[must_use]
    pub const fn allow_time_travel(mut self) -> Self {
        self.allow_time_travel = true;
        self
    }

    /// Adds an OR-ed subquery.
    #[must_use]
    pub fn add_query(mut self, query: SearchQuery) -> Self {
        self.queries.push(query);
        self
    }

    /// The configured instances.
    pub fn instances(&self) -> &[InstanceId] {
        &self.instance_ids
    }

    /// Validates the builder and produces filter groups.
    pub fn build(&self) -> EventstoreResult<BuiltQuery> {
        let mut shared = Vec::new();
        if !self.instance_ids.is_empty() {
            shared.push(Filter::text_or_list(Field::InstanceId, &self.instance_ids));
        }
        if !self.excluded_instances.is_empty() {
            shared.push(Filter::new(
                Field::InstanceId,
                FilterOperation::NotIn,
                FilterValue::TextList(
                    self.excluded_instances
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                ),
            ));
        }
        if let Some(owner) = &self.resource_owner {
            shared.push(Filter::new(
                Field::ResourceOwner,
                FilterOperation::Equals,
                FilterValue::Text(owner.to_string()),
            ));
        }
        if let Some(creator) = &self.creator {
            shared.push(Filter::new(
                Field::Creator,
                FilterOperation::Equals,
                FilterValue::Text(creator.to_string()),
            ));
        }
        if let Some(position) = self.position_at_least {
            shared.push(Filter::new(
                Field::Position,
                FilterOperation::GreaterOrEquals,
                FilterValue::Number(position.into_inner()),
            ));
        }

        let filters = if self.queries.is_empty() {
            vec![shared]
        } else {
            self.queries
                .iter()
                .map(|query| {
                    let mut group = shared.clone();
                    group.extend(query.filters(self.order)?);
                    Ok(group)
                })
                .collect::<EventstoreResult<Vec<_>>>()?
        };

        if filters.iter().any(Vec::is_empty) {
            return Err(EventstoreError::validation(
                "SEARC-Scop1",
                "query needs an instance scope or at least one condition per subquery",
            ));
        }

        let aggregates_only = self.columns != Columns::Event;
        Ok(BuiltQuery {
            columns: self.columns,
            order: self.order,
            limit: if aggregates_only { None } else { self.limit },
            offset: if aggregates_only { 0 } else { self.offset },
            await_open_transactions: self.await_open_transactions,
            allow_time_travel: self.allow_time_travel,
            filters,
        })
    }
}

/// A validated query, ready for a store.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    /// What to return.
    pub columns: Columns,
    /// Scan direction.
    pub order: Order,
    /// Maximum number of events.
    pub limit: Option<u64>,
    /// Events to skip.
    pub offset: u64,
    /// Hide events that open transactions may still precede.
    pub await_open_transactions: bool,
    /// Stale reads allowed.
    pub allow_time_travel: bool,
    /// OR-of-AND filter groups; never empty, no group is empty.
    pub filters: Vec<Vec<Filter>>,
}

impl BuiltQuery {
    /// Whether any filter group fully matches the event.
    pub fn matches(&self, event: &Event) -> bool {
        self.filters
            .iter()
            .any(|group| group.iter().all(|filter| filter.matches(event)))
    }
}
