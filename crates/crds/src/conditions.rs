//! Status conditions shared by all VMOps CRDs.
//!
//! A condition is a named, typed flag with a reason and a human message.
//! Every status carries at most one condition per type; `ConditionSet`
//! enforces that invariant while keeping the stable wire order of the
//! underlying list.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Observed truthiness of a condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition holds.
    True,

    /// The condition does not hold.
    False,

    /// Not yet evaluated by any handler.
    #[default]
    Unknown,
}

/// A single status condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, unique within one condition set.
    #[serde(rename = "type")]
    pub type_: String,

    /// Current status of the condition.
    pub status: ConditionStatus,

    /// Machine-readable reason for the last status.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Generation of the owning object when this condition was computed.
    #[serde(default)]
    pub observed_generation: i64,

    /// Timestamp of the last status transition.
    ///
    /// Only changes when `status` changes, never on reason/message churn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// An ordered set of conditions, unique by type.
///
/// Backed by a plain vector so the serialized form is the familiar
/// `status.conditions` list with stable ordering: updates replace in
/// place, new types append at the end.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the condition with the given type, if present.
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Inserts or replaces the condition with the same type.
    ///
    /// The last transition time is preserved from the existing entry
    /// when the status did not change, and stamped with `now` when it
    /// did (or when the type is new).
    pub fn set(&mut self, mut condition: Condition) {
        let now = Utc::now();
        match self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                } else {
                    condition.last_transition_time = Some(now);
                }
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.0.push(condition);
            }
        }
    }

    /// Appends the condition as-is, skipping transition stamping, if
    /// no condition of its type exists yet. Used when seeding Unknown
    /// placeholders before the first real evaluation.
    pub fn push_unchecked(&mut self, condition: Condition) {
        if self.get(&condition.type_).is_none() {
            self.0.push(condition);
        }
    }

    /// Removes the condition with the given type, if present.
    pub fn remove(&mut self, type_: &str) {
        self.0.retain(|c| c.type_ != type_);
    }

    /// True if the condition exists with status True.
    pub fn is_true(&self, type_: &str) -> bool {
        matches!(self.get(type_), Some(c) if c.status == ConditionStatus::True)
    }

    /// Iterates over all conditions in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set holds no conditions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(type_: &str, status: ConditionStatus, reason: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: String::new(),
            observed_generation: 1,
            last_transition_time: None,
        }
    }

    #[test]
    fn test_set_is_unique_by_type() {
        let mut set = ConditionSet::new();
        set.set(cond("Ready", ConditionStatus::False, "NotReady"));
        set.set(cond("Ready", ConditionStatus::True, "Ready"));
        set.set(cond("Migratable", ConditionStatus::True, "Migratable"));
        assert_eq!(set.len(), 2);
        assert!(set.is_true("Ready"));
    }

    #[test]
    fn test_transition_time_stable_when_status_unchanged() {
        let mut set = ConditionSet::new();
        set.set(cond("Ready", ConditionStatus::True, "Ready"));
        let first = set.get("Ready").and_then(|c| c.last_transition_time);
        assert!(first.is_some());

        // Same status, different message: no transition recorded.
        let mut update = cond("Ready", ConditionStatus::True, "Ready");
        update.message = "still fine".to_string();
        set.set(update);
        assert_eq!(set.get("Ready").and_then(|c| c.last_transition_time), first);
    }

    #[test]
    fn test_transition_time_moves_on_status_change() {
        let mut set = ConditionSet::new();
        set.set(cond("Ready", ConditionStatus::True, "Ready"));
        let first = set.get("Ready").and_then(|c| c.last_transition_time);
        set.set(cond("Ready", ConditionStatus::False, "NotReady"));
        let second = set.get("Ready").and_then(|c| c.last_transition_time);
        assert!(second >= first);
        assert_eq!(
            set.get("Ready").map(|c| c.status),
            Some(ConditionStatus::False)
        );
    }

    #[test]
    fn test_remove() {
        let mut set = ConditionSet::new();
        set.set(cond("Ready", ConditionStatus::True, "Ready"));
        set.remove("Ready");
        assert!(set.is_empty());
    }
}
