use crds::conditions::{Condition, ConditionSet, ConditionStatus};

use super::*;

const TYPES: &[&str] = &["BlockDevicesReady", "ConfigurationApplied", "Migratable"];

#[test]
fn add_all_unknown_seeds_missing_types_in_order() {
    let mut set = ConditionSet::new();
    assert!(add_all_unknown(&mut set, 3, TYPES));
    assert_eq!(set.len(), 3);
    let types: Vec<_> = set.iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(types, TYPES);
    assert!(
        set.iter()
            .all(|c| c.status == ConditionStatus::Unknown && c.observed_generation == 3)
    );
}

#[test]
fn add_all_unknown_is_idempotent() {
    let mut set = ConditionSet::new();
    set.set(Condition {
        type_: "Migratable".into(),
        status: ConditionStatus::True,
        reason: "Migratable".into(),
        message: String::new(),
        observed_generation: 2,
        last_transition_time: None,
    });
    assert!(add_all_unknown(&mut set, 2, TYPES));
    // Second run adds nothing and keeps the evaluated condition.
    assert!(!add_all_unknown(&mut set, 2, TYPES));
    assert_eq!(set.len(), 3);
    assert!(set.is_true("Migratable"));
}

#[test]
fn observed_generation_waits_for_stale_conditions() {
    let mut set = ConditionSet::new();
    add_all_unknown(&mut set, 4, &["A", "B"]);
    assert!(all_conditions_observed(&set, 4));

    set.set(Condition {
        type_: "A".into(),
        status: ConditionStatus::True,
        reason: "Ready".into(),
        message: String::new(),
        observed_generation: 3,
        last_transition_time: None,
    });
    assert!(!all_conditions_observed(&set, 4));
}
