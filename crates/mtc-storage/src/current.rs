//! Current value cache.
//!
//! Holds the most recent observation per data item, plus the set of active
//! (unresolved) conditions for condition items.

use std::collections::HashMap;

use mtc_core::{NORMAL, Observation, ObservationValue};

/// Most recent observation per data item id.
#[derive(Debug, Clone, Default)]
pub struct CurrentValueCache {
    latest: HashMap<String, Observation>,
    conditions: HashMap<String, Vec<Observation>>,
}

impl CurrentValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current observation for `id`.
    pub fn set(&mut self, id: &str, observation: Observation) {
        self.latest.insert(id.to_string(), observation);
    }

    pub fn get(&self, id: &str) -> Option<&Observation> {
        self.latest.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.latest.contains_key(id)
    }

    /// Update the active condition set for the observation's data item.
    ///
    /// NORMAL without a native code (or UNAVAILABLE) clears every active
    /// entry; NORMAL with a native code clears that code only. Any other
    /// level replaces the entry with the same native code, and identical
    /// entries are not appended twice.
    pub fn record_condition(&mut self, observation: &Observation) {
        let id = observation.data_item_id.as_str();
        let level = observation.value.leading().unwrap_or_default();
        let code = native_code(&observation.value);

        if observation.value.is_unavailable() || (level == NORMAL && code.is_empty()) {
            self.conditions.remove(id);
            return;
        }

        let active = self.conditions.entry(id.to_string()).or_default();
        if level == NORMAL {
            active.retain(|o| native_code(&o.value) != code);
        } else if active.iter().any(|o| o.value == observation.value) {
            return;
        } else {
            if !code.is_empty() {
                active.retain(|o| native_code(&o.value) != code);
            }
            active.push(observation.clone());
        }

        if active.is_empty() {
            self.conditions.remove(id);
        }
    }

    /// Active (non-normal) conditions for `id`, oldest first.
    pub fn active_conditions(&self, id: &str) -> Vec<Observation> {
        self.conditions.get(id).cloned().unwrap_or_default()
    }

    /// All current observations, ordered by sequence.
    pub fn snapshot(&self) -> Vec<Observation> {
        let mut all: Vec<Observation> = self.latest.values().cloned().collect();
        all.sort_by_key(|o| o.sequence);
        all
    }

    /// Number of data items with a current value.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Native code of a condition value (second token), empty when absent.
fn native_code(value: &ObservationValue) -> &str {
    match value {
        ObservationValue::List(items) => items.get(1).map(String::as_str).unwrap_or_default(),
        ObservationValue::Scalar(_) => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtc_core::{Category, ObservationDraft};

    fn condition(seq: u64, tokens: &[&str]) -> Observation {
        let mut draft = ObservationDraft::new(
            "dev_logic",
            "000",
            "2016-04-12T20:27:01Z",
            tokens.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        );
        draft.category = Category::Condition;
        draft.into_observation(seq)
    }

    #[test]
    fn test_set_get() {
        let mut cache = CurrentValueCache::new();
        let obs = ObservationDraft::new("dev_avail", "000", "t", "AVAILABLE").into_observation(1);
        cache.set("dev_avail", obs.clone());
        assert_eq!(cache.get("dev_avail"), Some(&obs));
        assert!(cache.get("dev_estop").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_normal_clears_active_set() {
        let mut cache = CurrentValueCache::new();
        cache.record_condition(&condition(1, &["FAULT", "100", "", "", "overtemp"]));
        cache.record_condition(&condition(2, &["WARNING", "200", "", "", "low oil"]));
        assert_eq!(cache.active_conditions("dev_logic").len(), 2);

        cache.record_condition(&condition(3, &["NORMAL", "", "", "", ""]));
        assert!(cache.active_conditions("dev_logic").is_empty());
    }

    #[test]
    fn test_normal_with_code_clears_only_that_code() {
        let mut cache = CurrentValueCache::new();
        cache.record_condition(&condition(1, &["FAULT", "100", "", "", "overtemp"]));
        cache.record_condition(&condition(2, &["WARNING", "200", "", "", "low oil"]));
        cache.record_condition(&condition(3, &["NORMAL", "100", "", "", ""]));

        let active = cache.active_conditions("dev_logic");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sequence, 2);
    }

    #[test]
    fn test_identical_condition_not_reappended() {
        let mut cache = CurrentValueCache::new();
        cache.record_condition(&condition(1, &["FAULT", "100", "", "", "overtemp"]));
        cache.record_condition(&condition(2, &["FAULT", "100", "", "", "overtemp"]));
        assert_eq!(cache.active_conditions("dev_logic").len(), 1);

        // Same code, different severity replaces the entry.
        cache.record_condition(&condition(3, &["WARNING", "100", "", "", "overtemp"]));
        let active = cache.active_conditions("dev_logic");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sequence, 3);
    }

    #[test]
    fn test_unavailable_clears_active_set() {
        let mut cache = CurrentValueCache::new();
        cache.record_condition(&condition(1, &["FAULT", "100", "", "", "overtemp"]));
        cache.record_condition(&condition(2, &["UNAVAILABLE"]));
        assert!(cache.active_conditions("dev_logic").is_empty());
    }
}
