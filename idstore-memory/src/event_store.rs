use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use idstore::search::{BuiltQuery, Order};
use idstore::{
    AggregateKey, Event, EventId, EventLog, EventstoreError, EventstoreResult, NewEvent, Position,
    Sequence, Timestamp, UniqueConstraintAction,
};
use parking_lot::RwLock;
use tracing::{debug, instrument};

/// `(instance scope, unique type, unique field)`
type UniqueKey = (String, String, String);

#[derive(Default)]
struct LogState {
    events: Vec<Event>,
    latest: HashMap<AggregateKey, Sequence>,
    unique: HashSet<UniqueKey>,
    position: u64,
}

/// Thread-safe in-memory event log for testing.
///
/// A push is one critical section under a single write lock, so it is
/// all-or-nothing and strictly serialised.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<RwLock<LogState>>,
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Whether no event was pushed yet.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }

    /// Whether the ledger holds `(scope, unique_type, unique_field)`.
    ///
    /// `scope` is the instance id, or empty for global constraints.
    pub fn has_unique_constraint(&self, scope: &str, unique_type: &str, unique_field: &str) -> bool {
        self.state.read().unique.contains(&(
            scope.to_string(),
            unique_type.to_string(),
            unique_field.to_string(),
        ))
    }

    fn matching<'a>(events: &'a [Event], query: &'a BuiltQuery) -> impl Iterator<Item = &'a Event> {
        events.iter().filter(move |event| query.matches(event))
    }
}

fn apply_unique_constraints(
    ledger: &mut HashSet<UniqueKey>,
    events: &[NewEvent],
) -> EventstoreResult<()> {
    for event in events {
        let instance = &event.aggregate.instance_id;
        for constraint in &event.unique_constraints {
            let key = (
                constraint.scope(instance),
                constraint.unique_type.clone(),
                constraint.stored_field(),
            );
            match constraint.action {
                UniqueConstraintAction::Add => {
                    if !ledger.insert(key) {
                        return Err(EventstoreError::AlreadyExists {
                            code: "MEMOR-Uniq1",
                            unique_type: constraint.unique_type.clone(),
                            unique_field: constraint.unique_field.clone(),
                            message: constraint.error_message.clone(),
                        });
                    }
                }
                UniqueConstraintAction::Remove => {
                    ledger.remove(&key);
                }
                UniqueConstraintAction::InstanceRemove => {
                    let scope = instance.to_string();
                    ledger.retain(|(row_scope, _, _)| *row_scope != scope);
                }
            }
        }
    }
    Ok(())
}

impl EventLog for InMemoryEventStore {
    #[instrument(name = "memory.push", skip_all, fields(events = events.len()))]
    async fn push(&self, events: Vec<NewEvent>) -> EventstoreResult<Vec<Event>> {
        let mut state = self.state.write();

        // verify every expectation before touching anything
        let mut next: HashMap<AggregateKey, Sequence> = HashMap::new();
        let mut assigned = Vec::with_capacity(events.len());
        for event in &events {
            let key = event.aggregate.key();
            let sequence = if let Some(current) = next.get(&key).copied() {
                current.next()
            } else {
                let current = state.latest.get(&key).copied().unwrap_or_else(Sequence::zero);
                if !event.expected.matches(current) {
                    return Err(EventstoreError::ConcurrencyConflict {
                        code: "MEMOR-Conc1",
                        aggregate: key.to_string(),
                        expected: event.expected.exact(),
                        current: Some(current),
                    });
                }
                current.next()
            };
            next.insert(key, sequence);
            assigned.push(sequence);
        }

        let mut ledger = state.unique.clone();
        apply_unique_constraints(&mut ledger, &events)?;

        state.position += 1;
        let position = Position::new(state.position);
        let created_at = Timestamp::now();
        let pushed: Vec<Event> = events
            .into_iter()
            .zip(assigned)
            .zip(0_u32..)
            .map(|((event, sequence), in_tx_order)| Event {
                id: EventId::new(),
                aggregate: event.aggregate,
                sequence,
                position,
                in_tx_order,
                created_at,
                event_type: event.event_type,
                revision: event.revision,
                creator: event.creator,
                payload: event.payload,
            })
            .collect();

        state.unique = ledger;
        state.latest.extend(next);
        state.events.extend(pushed.iter().cloned());
        debug!(%position, "[memory.push] events stored");
        Ok(pushed)
    }

    async fn filter(&self, query: &BuiltQuery) -> EventstoreResult<Vec<Event>> {
        let state = self.state.read();
        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        let matching = Self::matching(&state.events, query);
        // events are stored in (position, in_tx_order) order
        let events: Vec<Event> = match query.order {
            Order::Asc => matching.skip(offset).take(limit).cloned().collect(),
            Order::Desc => {
                let mut all: Vec<&Event> = matching.collect();
                all.reverse();
                all.into_iter().skip(offset).take(limit).cloned().collect()
            }
        };
        Ok(events)
    }

    async fn latest_sequence(&self, query: &BuiltQuery) -> EventstoreResult<Sequence> {
        let state = self.state.read();
        Ok(Self::matching(&state.events, query)
            .map(|event| event.sequence)
            .max()
            .unwrap_or_else(Sequence::zero))
    }

    async fn latest_position(&self, query: &BuiltQuery) -> EventstoreResult<Position> {
        let state = self.state.read();
        Ok(Self::matching(&state.events, query)
            .map(|event| event.position)
            .max()
            .unwrap_or_else(Position::origin))
    }
}
