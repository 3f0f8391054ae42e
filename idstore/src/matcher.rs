//! Hierarchical event-type matching.
//!
//! `user.human.added` matches handlers registered for `user.human.added`,
//! `user.human.*` and `user.*`. Groups are always returned most specific
//! first.

/// Namespace of event conditions in flat lookup tables.
pub const EVENT_NAMESPACE: &str = "event";

/// Decomposes a dotted event type into its match groups, most specific first.
///
/// ```
/// use idstore::matcher::event_type_groups;
///
/// assert_eq!(
///     event_type_groups("session.added"),
///     vec!["session.added".to_string(), "session.*".to_string()]
/// );
/// ```
pub fn event_type_groups(event_type: &str) -> Vec<String> {
    let segments: Vec<&str> = event_type.split('.').collect();
    let mut groups = Vec::with_capacity(segments.len());
    groups.push(event_type.to_string());
    for prefix_len in (1..segments.len()).rev() {
        groups.push(format!("{}.*", segments[..prefix_len].join(".")));
    }
    groups
}

/// Prefixes every group with `namespace/` and appends the bare namespace.
///
/// The bare namespace is the wildcard root, so even a single-segment type
/// yields two entries.
pub fn namespaced_event_type_groups(namespace: &str, event_type: &str) -> Vec<String> {
    event_type_groups(event_type)
        .into_iter()
        .map(|group| format!("{namespace}/{group}"))
        .chain(std::iter::once(namespace.to_string()))
        .collect()
}
