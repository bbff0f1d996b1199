use std::time::Duration;

use super::*;

#[test]
fn earliest_requeue_picks_minimum() {
    let a = Some(Duration::from_secs(60));
    let b = Some(Duration::from_secs(2));
    assert_eq!(earliest_requeue(a, b), Some(Duration::from_secs(2)));
}

#[test]
fn earliest_requeue_keeps_the_only_request() {
    let a = Some(Duration::from_secs(15));
    assert_eq!(earliest_requeue(a, None), Some(Duration::from_secs(15)));
    assert_eq!(earliest_requeue(None, a), Some(Duration::from_secs(15)));
    assert_eq!(earliest_requeue(None, None), None);
}

#[test]
fn proceed_and_requeue_constructors() {
    assert_eq!(
        HandlerFlow::proceed(),
        HandlerFlow::Continue { requeue_after: None }
    );
    assert_eq!(
        HandlerFlow::requeue(Duration::from_secs(5)),
        HandlerFlow::Continue {
            requeue_after: Some(Duration::from_secs(5))
        }
    );
}
