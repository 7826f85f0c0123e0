#![forbid(unsafe_code)]

// Proximity engine - who should hear and see whom, from the current positions alone.

use crate::world::registry::{Position, Registry};
use std::collections::HashSet;

/// Distance thresholds. A pair enters visibility at `enter` and, once subscribed,
/// leaves it only beyond `exit`. `exit == enter` means no hysteresis band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityConfig {
    pub enter: f64,
    pub exit: f64,
}

impl ProximityConfig {
    pub fn new(enter: f64, exit: f64) -> Self {
        Self { enter, exit: exit.max(enter) }
    }

    pub fn without_hysteresis(threshold: f64) -> Self {
        Self::new(threshold, threshold)
    }
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self::without_hysteresis(10.0)
    }
}

/// Euclidean distance
pub fn distance(a: Position, b: Position) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

pub fn in_range(a: Position, b: Position, threshold: f64) -> bool {
    distance(a, b) <= threshold
}

/// Producers (not owned by the subscriber) whose owner is within `threshold`
pub fn visible_producers(registry: &Registry, subscriber_id: &str, threshold: f64) -> HashSet<String> {
    let Some(subscriber) = registry.participant(subscriber_id) else {
        return HashSet::new();
    };
    registry
        .list_producers(subscriber_id)
        .into_iter()
        .filter(|producer| {
            registry
                .participant(&producer.owner_id)
                .is_some_and(|owner| in_range(subscriber.position, owner.position, threshold))
        })
        .map(|producer| producer.id.clone())
        .collect()
}

/// Producers the subscriber should be consuming right now.
///
/// Pairs that already have a consumer or an in-flight reservation are held to the
/// exit threshold, new pairs to the enter threshold.
pub fn desired_producers(registry: &Registry, subscriber_id: &str, config: &ProximityConfig) -> HashSet<String> {
    if config.exit <= config.enter {
        return visible_producers(registry, subscriber_id, config.enter);
    }
    let Some(subscriber) = registry.participant(subscriber_id) else {
        return HashSet::new();
    };
    registry
        .list_producers(subscriber_id)
        .into_iter()
        .filter(|producer| {
            let Some(owner) = registry.participant(&producer.owner_id) else {
                return false;
            };
            let held = registry.find_consumer(subscriber_id, &producer.id).is_some()
                || registry.reservation(subscriber_id, &producer.id).is_some();
            let threshold = if held { config.exit } else { config.enter };
            in_range(subscriber.position, owner.position, threshold)
        })
        .map(|producer| producer.id.clone())
        .collect()
}

/// Other participants within `threshold` of `participant_id`
pub fn neighbours(registry: &Registry, participant_id: &str, threshold: f64) -> Vec<String> {
    let Some(center) = registry.participant(participant_id) else {
        return Vec::new();
    };
    registry
        .participants()
        .filter(|p| p.id != participant_id && in_range(center.position, p.position, threshold))
        .map(|p| p.id.clone())
        .collect()
}
