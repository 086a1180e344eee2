//! Topic routing.
//!
//! Routing keys are dot-separated words. Binding patterns may use `*` for
//! exactly one word and `#` for zero or more words.

use crate::traits::BusError;
use orbit_protocol::EventName;

/// Build the routing key for a topic.
#[must_use]
pub fn routing_key(prefix: &str, topic: EventName) -> String {
    format!("{prefix}.{}", topic.as_str())
}

/// Bindings covering every presence topic under `prefix`.
#[must_use]
pub fn default_bindings(prefix: &str) -> Vec<String> {
    [EventName::UserStatus, EventName::UserNotifications]
        .into_iter()
        .map(|topic| routing_key(prefix, topic))
        .collect()
}

/// Extract the topic (last word) of a routing key.
#[must_use]
pub fn topic_of(routing_key: &str) -> &str {
    routing_key.rsplit('.').next().unwrap_or(routing_key)
}

/// Validate a binding pattern.
///
/// # Errors
///
/// Returns an error if the pattern is empty or has an empty word.
pub fn validate_binding(pattern: &str) -> Result<(), BusError> {
    if pattern.is_empty() || pattern.split('.').any(str::is_empty) {
        return Err(BusError::InvalidBinding(pattern.to_string()));
    }
    Ok(())
}

/// Check whether a routing key matches a binding pattern.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
