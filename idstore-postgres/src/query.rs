//! SQL rendering of [`BuiltQuery`] filter groups.
//!
//! Filter groups are OR-ed, filters inside a group AND-ed. Every operand is a
//! bind parameter; only column names and operators are spliced into the text.

use idstore::search::{BuiltQuery, Columns, Field, Filter, FilterOperation, FilterValue, Order};
use idstore::{EventstoreError, EventstoreResult, Operation};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

/// Columns of `eventstore.events` in the order rows are decoded.
pub const EVENT_COLUMNS: &str = "id, instance_id, aggregate_type, aggregate_id, \
     aggregate_version, owner, sequence, position, in_tx_order, created_at, event_type, \
     revision, creator, payload";

/// A bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    /// `TEXT`
    Text(String),
    /// `TEXT[]`
    TextList(Vec<String>),
    /// `BIGINT`
    BigInt(i64),
    /// `TIMESTAMPTZ`
    Timestamp(chrono::DateTime<chrono::Utc>),
    /// `JSONB`
    Json(serde_json::Value),
}

/// Rendered statement with its parameters in `$n` order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    /// Statement text.
    pub sql: String,
    /// Parameters.
    pub args: Vec<SqlArg>,
}

impl SqlQuery {
    /// A sqlx query with every parameter bound.
    pub fn to_query(&self) -> Query<'_, Postgres, PgArguments> {
        self.args
            .iter()
            .fold(sqlx::query(&self.sql), |query, arg| match arg {
                SqlArg::Text(value) => query.bind(value.clone()),
                SqlArg::TextList(values) => query.bind(values.clone()),
                SqlArg::BigInt(value) => query.bind(*value),
                SqlArg::Timestamp(value) => query.bind(*value),
                SqlArg::Json(value) => query.bind(value.clone()),
            })
    }

    fn push_arg(&mut self, arg: SqlArg) -> String {
        self.args.push(arg);
        format!("${}", self.args.len())
    }
}

const fn column(field: Field) -> &'static str {
    match field {
        Field::InstanceId => "instance_id",
        Field::ResourceOwner => "owner",
        Field::Creator => "creator",
        Field::AggregateType => "aggregate_type",
        Field::AggregateId => "aggregate_id",
        Field::EventType => "event_type",
        Field::Sequence => "sequence",
        Field::CreatedAt => "created_at",
        Field::Position => "position",
        Field::Payload => "payload",
    }
}

pub(crate) fn to_i64(value: u64, what: &str) -> EventstoreResult<i64> {
    i64::try_from(value).map_err(|_| {
        EventstoreError::validation("POSTG-Rang1", format!("{what} {value} exceeds BIGINT"))
    })
}

fn argument(value: &FilterValue) -> EventstoreResult<SqlArg> {
    Ok(match value {
        FilterValue::Text(text) => SqlArg::Text(text.clone()),
        FilterValue::TextList(list) => SqlArg::TextList(list.clone()),
        FilterValue::Number(number) => SqlArg::BigInt(to_i64(*number, "filter value")?),
        FilterValue::Timestamp(timestamp) => SqlArg::Timestamp(timestamp.into_datetime()),
        FilterValue::Json(json) => SqlArg::Json(json.clone()),
    })
}

fn condition(query: &mut SqlQuery, filter: &Filter) -> EventstoreResult<String> {
    let column = column(filter.field);
    let placeholder = query.push_arg(argument(&filter.value)?);
    let rendered = match filter.operation {
        FilterOperation::Equals => format!("{column} = {placeholder}"),
        FilterOperation::In => format!("{column} = ANY({placeholder})"),
        FilterOperation::NotIn => format!("{column} <> ALL({placeholder})"),
        FilterOperation::Greater => format!("{column} > {placeholder}"),
        FilterOperation::GreaterOrEquals => format!("{column} >= {placeholder}"),
        FilterOperation::Less => format!("{column} < {placeholder}"),
        FilterOperation::JsonContains => format!("{column} @> {placeholder}"),
    };
    Ok(rendered)
}

/// Renders `built` against `eventstore.events`.
///
/// `position_bound` hides events above a position, used to wait for open
/// transactions.
pub fn build(built: &BuiltQuery, position_bound: Option<u64>) -> EventstoreResult<SqlQuery> {
    let mut query = SqlQuery {
        sql: String::new(),
        args: Vec::new(),
    };

    let mut groups = Vec::with_capacity(built.filters.len());
    for group in &built.filters {
        let conditions = group
            .iter()
            .map(|filter| condition(&mut query, filter))
            .collect::<EventstoreResult<Vec<_>>>()?;
        groups.push(format!("({})", conditions.join(" AND ")));
    }
    if groups.is_empty() {
        return Err(EventstoreError::internal(
            "POSTG-Filt1",
            Operation::Filter,
            "query without filter groups",
        ));
    }
    let mut where_clause = if groups.len() == 1 {
        groups.remove(0)
    } else {
        format!("({})", groups.join(" OR "))
    };
    if let Some(bound) = position_bound {
        let placeholder = query.push_arg(SqlArg::BigInt(to_i64(bound, "position")?));
        where_clause = format!("{where_clause} AND position <= {placeholder}");
    }

    query.sql = match built.columns {
        Columns::MaxSequence => format!(
            "SELECT COALESCE(MAX(sequence), 0) FROM eventstore.events WHERE {where_clause}"
        ),
        Columns::MaxPosition => format!(
            "SELECT COALESCE(MAX(position), 0) FROM eventstore.events WHERE {where_clause}"
        ),
        Columns::Event => {
            let order = match built.order {
                Order::Asc => "position, in_tx_order",
                Order::Desc => "position DESC, in_tx_order DESC",
            };
            let mut sql = format!(
                "SELECT {EVENT_COLUMNS} FROM eventstore.events WHERE {where_clause} ORDER BY {order}"
            );
            if let Some(limit) = built.limit {
                let placeholder = query.push_arg(SqlArg::BigInt(to_i64(limit, "limit")?));
                sql.push_str(&format!(" LIMIT {placeholder}"));
            }
            if built.offset > 0 {
                let placeholder =
                    query.push_arg(SqlArg::BigInt(to_i64(built.offset, "offset")?));
                sql.push_str(&format!(" OFFSET {placeholder}"));
            }
            sql
        }
    };
    Ok(query)
}

/// Instance ids a query is restricted to.
///
/// `None` when at least one group may match events of any instance.
pub fn instance_scope(built: &BuiltQuery) -> Option<Vec<String>> {
    let mut instances = Vec::new();
    for group in &built.filters {
        let scoped = group.iter().find_map(|filter| {
            match (filter.field, filter.operation, &filter.value) {
                (Field::InstanceId, FilterOperation::Equals, FilterValue::Text(id)) => {
                    Some(vec![id.clone()])
                }
                (Field::InstanceId, FilterOperation::In, FilterValue::TextList(ids)) => {
                    Some(ids.clone())
                }
                _ => None,
            }
        })?;
        instances.extend(scoped);
    }
    instances.sort();
    instances.dedup();
    Some(instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use idstore::search::SearchQuery;
    use idstore::{AggregateType, InstanceId, Position, SearchQueryBuilder, Sequence};
    use serde_json::json;

    fn instance(id: &str) -> InstanceId {
        InstanceId::try_new(id).unwrap()
    }

    #[test]
    fn instance_scoped_query_orders_by_position() {
        let built = SearchQueryBuilder::new()
            .instance_id(instance("instance-1"))
            .limit(10)
            .build()
            .unwrap();
        let query = build(&built, None).unwrap();

        insta::assert_snapshot!(query.sql, @"SELECT id, instance_id, aggregate_type, aggregate_id, aggregate_version, owner, sequence, position, in_tx_order, created_at, event_type, revision, creator, payload FROM eventstore.events WHERE (instance_id = $1) ORDER BY position, in_tx_order LIMIT $2");
        assert_eq!(
            query.args,
            vec![SqlArg::Text("instance-1".into()), SqlArg::BigInt(10)]
        );
    }

    #[test]
    fn subqueries_are_or_ed() {
        let built = SearchQueryBuilder::new()
            .instance_id(instance("instance-1"))
            .order_desc()
            .offset(5)
            .add_query(
                SearchQuery::new()
                    .aggregate_types([AggregateType::try_new("user").unwrap()])
                    .sequence_greater(Sequence::new(3)),
            )
            .add_query(SearchQuery::new().event_data(json!({ "username": "gigi" })))
            .build()
            .unwrap();
        let query = build(&built, None).unwrap();

        insta::assert_snapshot!(query.sql, @"SELECT id, instance_id, aggregate_type, aggregate_id, aggregate_version, owner, sequence, position, in_tx_order, created_at, event_type, revision, creator, payload FROM eventstore.events WHERE ((instance_id = $1 AND aggregate_type = $2 AND sequence < $3) OR (instance_id = $4 AND payload @> $5)) ORDER BY position DESC, in_tx_order DESC OFFSET $6");
        assert_eq!(query.args.len(), 6);
    }

    #[test]
    fn aggregates_ignore_limit_and_offset() {
        let built = SearchQueryBuilder::new()
            .instance_ids([instance("a"), instance("b")])
            .columns(Columns::MaxPosition)
            .limit(1)
            .offset(4)
            .build()
            .unwrap();
        let query = build(&built, Some(42)).unwrap();

        insta::assert_snapshot!(query.sql, @"SELECT COALESCE(MAX(position), 0) FROM eventstore.events WHERE (instance_id = ANY($1)) AND position <= $2");
        assert_eq!(query.args[1], SqlArg::BigInt(42));
    }

    #[test]
    fn excluded_instances_render_as_all() {
        let built = SearchQueryBuilder::new()
            .exclude_instances([instance("system")])
            .position_at_least(Position::new(7))
            .columns(Columns::MaxSequence)
            .build()
            .unwrap();
        let query = build(&built, None).unwrap();

        insta::assert_snapshot!(query.sql, @"SELECT COALESCE(MAX(sequence), 0) FROM eventstore.events WHERE (instance_id <> ALL($1) AND position >= $2)");
    }

    #[test]
    fn scope_is_collected_from_every_group() {
        let scoped = SearchQueryBuilder::new()
            .instance_ids([instance("b"), instance("a")])
            .build()
            .unwrap();
        assert_eq!(
            instance_scope(&scoped),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let unscoped = SearchQueryBuilder::new()
            .exclude_instances([instance("a")])
            .build()
            .unwrap();
        assert_eq!(instance_scope(&unscoped), None);
    }
}
