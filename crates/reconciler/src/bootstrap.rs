//! Condition bootstrap and observed-generation helpers.

use crds::conditions::{Condition, ConditionSet, ConditionStatus};

/// Seeds every listed condition type as `Unknown` if it is absent.
///
/// Returns true when at least one condition was added, in which case
/// the caller should persist and requeue immediately instead of
/// running the handler chain against a half-initialized status.
pub fn add_all_unknown(conditions: &mut ConditionSet, generation: i64, types: &[&str]) -> bool {
    let mut added = false;
    for type_ in types {
        if conditions.get(type_).is_none() {
            conditions.push_unchecked(Condition {
                type_: (*type_).to_owned(),
                status: ConditionStatus::Unknown,
                reason: String::new(),
                message: String::new(),
                observed_generation: generation,
                last_transition_time: None,
            });
            added = true;
        }
    }
    added
}

/// True when every condition reflects the given object generation.
///
/// `status.observedGeneration` advances only once this holds, so a
/// stale condition keeps the whole object marked as not caught up.
pub fn all_conditions_observed(conditions: &ConditionSet, generation: i64) -> bool {
    conditions.iter().all(|c| c.observed_generation >= generation)
}

#[cfg(test)]
#[path = "bootstrap_test.rs"]
mod bootstrap_test;
