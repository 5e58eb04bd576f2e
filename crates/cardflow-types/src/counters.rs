//! Per-run counters handed to every handler call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// State that must outlive a single handler invocation.
///
/// The held simulated key is tracked in a typed slot because the executor
/// reads it on cancellation and releases the key before stopping. Anything
/// else a handler needs goes into the generic map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    held_key: Option<String>,
    values: HashMap<String, serde_json::Value>,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulated key currently in the pressed state, if any.
    pub fn held_key(&self) -> Option<&str> {
        self.held_key.as_deref()
    }

    pub fn set_held_key(&mut self, key: impl Into<String>) {
        self.held_key = Some(key.into());
    }

    /// Remove and return the held key.
    pub fn take_held_key(&mut self) -> Option<String> {
        self.held_key.take()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    /// Add one to an integer counter (missing or non-integer counts as 0)
    /// and return the new value.
    pub fn increment(&mut self, key: &str) -> i64 {
        let next = self
            .values
            .get(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;
        self.values.insert(key.to_string(), serde_json::json!(next));
        next
    }

    pub fn is_empty(&self) -> bool {
        self.held_key.is_none() && self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_key_set_and_take() {
        let mut counters = RunCounters::new();
        assert!(counters.held_key().is_none());

        counters.set_held_key("w");
        assert_eq!(counters.held_key(), Some("w"));

        assert_eq!(counters.take_held_key().as_deref(), Some("w"));
        assert!(counters.held_key().is_none());
        assert!(counters.is_empty());
    }

    #[test]
    fn increment_starts_from_zero() {
        let mut counters = RunCounters::new();
        assert_eq!(counters.increment("loops"), 1);
        assert_eq!(counters.increment("loops"), 2);
        assert_eq!(counters.get("loops"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn increment_overwrites_non_integer() {
        let mut counters = RunCounters::new();
        counters.set("loops", serde_json::json!("three"));
        assert_eq!(counters.increment("loops"), 1);
    }

    #[test]
    fn generic_values_are_independent_of_held_key() {
        let mut counters = RunCounters::new();
        counters.set("direction", serde_json::json!("left"));
        counters.set_held_key("a");
        counters.take_held_key();
        assert_eq!(counters.get("direction"), Some(&serde_json::json!("left")));
        assert_eq!(counters.remove("direction"), Some(serde_json::json!("left")));
        assert!(counters.is_empty());
    }
}
