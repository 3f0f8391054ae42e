//! Event-type to decoder registry.
//!
//! An [`EventMapper`] is built once per consumer and passed by reference.
//! It declares which aggregate and event types the consumer handles and
//! decodes stored events into the consumer's own tagged union.
//!
//! ```
//! use idstore::mapper::EventMapper;
//! use idstore::AggregateType;
//!
//! #[derive(Debug)]
//! enum UserEvent {
//!     Added,
//!     Other,
//! }
//!
//! let user = AggregateType::try_new("user").unwrap();
//! let mapper = EventMapper::builder()
//!     .on(user.clone(), "user.added", |_| Ok(UserEvent::Added))
//!     .on(user, "user.*", |_| Ok(UserEvent::Other))
//!     .build()
//!     .unwrap();
//! assert_eq!(mapper.aggregate_types().len(), 1);
//! ```

use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::Event;
use crate::matcher::event_type_groups;
use crate::search::SearchQuery;
use crate::types::{AggregateType, EventType};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

type Decoder<T> = Box<dyn Fn(&Event) -> EventstoreResult<T> + Send + Sync>;

struct AggregateMapping<T> {
    by_type: HashMap<String, Decoder<T>>,
    exact: Vec<EventType>,
    wildcard: bool,
    catch_all: Option<Decoder<T>>,
}

impl<T> Default for AggregateMapping<T> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            exact: Vec::new(),
            wildcard: false,
            catch_all: None,
        }
    }
}

/// Decodes events of registered types into `T`.
pub struct EventMapper<T> {
    aggregates: BTreeMap<AggregateType, AggregateMapping<T>>,
}

impl<T> fmt::Debug for EventMapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (aggregate_type, mapping) in &self.aggregates {
            let mut keys: Vec<&String> = mapping.by_type.keys().collect();
            keys.sort();
            map.entry(aggregate_type, &keys);
        }
        map.finish()
    }
}

impl<T> EventMapper<T> {
    /// Starts an empty builder.
    pub fn builder() -> EventMapperBuilder<T> {
        EventMapperBuilder {
            entries: Vec::new(),
        }
    }

    /// Decodes `event`, or `None` when nothing is registered for it.
    ///
    /// Lookup is first match wins: the exact type, then each wildcard group
    /// from most to least specific, then the aggregate-wide catch-all.
    pub fn decode(&self, event: &Event) -> Option<EventstoreResult<T>> {
        let mapping = self.aggregates.get(&event.aggregate.aggregate_type)?;
        event_type_groups(event.event_type.as_ref())
            .iter()
            .find_map(|group| mapping.by_type.get(group))
            .or(mapping.catch_all.as_ref())
            .map(|decoder| decoder(event))
    }

    /// Whether any decoder is registered for `event`.
    pub fn handles(&self, event: &Event) -> bool {
        self.aggregates
            .get(&event.aggregate.aggregate_type)
            .is_some_and(|mapping| {
                mapping.catch_all.is_some()
                    || event_type_groups(event.event_type.as_ref())
                        .iter()
                        .any(|group| mapping.by_type.contains_key(group))
            })
    }

    /// Aggregate types with at least one decoder.
    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        self.aggregates.keys().cloned().collect()
    }

    /// One subquery per aggregate type.
    ///
    /// Event types are narrowed only when every registration of the
    /// aggregate is an exact type.
    pub fn search_queries(&self) -> Vec<SearchQuery> {
        self.aggregates
            .iter()
            .map(|(aggregate_type, mapping)| {
                let query = SearchQuery::new().aggregate_types([aggregate_type.clone()]);
                if mapping.wildcard || mapping.catch_all.is_some() {
                    query
                } else {
                    query.event_types(mapping.exact.iter().cloned())
                }
            })
            .collect()
    }
}

enum Pattern {
    Exact(String),
    Group(String),
    Any,
}

/// Builder for [`EventMapper`].
pub struct EventMapperBuilder<T> {
    entries: Vec<(AggregateType, Pattern, Decoder<T>)>,
}

impl<T> EventMapperBuilder<T> {
    /// Registers a decoder for an exact event type (`user.added`) or a
    /// wildcard group (`user.*`).
    #[must_use]
    pub fn on<F>(mut self, aggregate_type: AggregateType, event_type: &str, decoder: F) -> Self
    where
        F: Fn(&Event) -> EventstoreResult<T> + Send + Sync + 'static,
    {
        let pattern = event_type.strip_suffix(".*").map_or_else(
            || Pattern::Exact(event_type.to_string()),
            |_| Pattern::Group(event_type.to_string()),
        );
        self.entries
            .push((aggregate_type, pattern, Box::new(decoder)));
        self
    }

    /// Registers a catch-all decoder for every event of an aggregate type.
    #[must_use]
    pub fn on_any<F>(mut self, aggregate_type: AggregateType, decoder: F) -> Self
    where
        F: Fn(&Event) -> EventstoreResult<T> + Send + Sync + 'static,
    {
        self.entries
            .push((aggregate_type, Pattern::Any, Box::new(decoder)));
        self
    }

    /// Validates the registrations.
    pub fn build(self) -> EventstoreResult<EventMapper<T>> {
        let mut aggregates: BTreeMap<AggregateType, AggregateMapping<T>> = BTreeMap::new();
        for (aggregate_type, pattern, decoder) in self.entries {
            let mapping = aggregates.entry(aggregate_type.clone()).or_default();
            let duplicate = match pattern {
                Pattern::Exact(raw) => {
                    let event_type = EventType::try_new(raw.clone()).map_err(|error| {
                        EventstoreError::validation(
                            "MAPPE-Type1",
                            format!("invalid event type '{raw}': {error}"),
                        )
                    })?;
                    mapping.exact.push(event_type);
                    mapping.by_type.insert(raw.clone(), decoder).map(|_| raw)
                }
                Pattern::Group(raw) => {
                    let prefix = raw.trim_end_matches(".*");
                    EventType::try_new(prefix).map_err(|error| {
                        EventstoreError::validation(
                            "MAPPE-Type2",
                            format!("invalid event type group '{raw}': {error}"),
                        )
                    })?;
                    mapping.wildcard = true;
                    mapping.by_type.insert(raw.clone(), decoder).map(|_| raw)
                }
                Pattern::Any => mapping
                    .catch_all
                    .replace(decoder)
                    .map(|_| "*".to_string()),
            };
            if let Some(pattern) = duplicate {
                return Err(EventstoreError::validation(
                    "MAPPE-Dupl1",
                    format!("decoder for {aggregate_type}/{pattern} registered twice"),
                ));
            }
        }
        Ok(EventMapper { aggregates })
    }
}
