//! Policies for picking which child queues of a master queue to try first.
//!
//! A strategy only orders candidates. The dequeue script re-checks capacity
//! atomically, so a stale capacity reading costs a wasted attempt and never
//! an over-limit dequeue.

use rand::Rng;
use std::fmt::Debug;

/// A child queue of a master queue with its current capacity reading.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCandidate {
    pub queue_key: String,
    /// Milliseconds since the queue's earliest message became due
    pub age_ms: i64,
    /// Free slots under the tighter of the queue and environment limits
    pub available_capacity: u64,
}

pub trait QueuePriorityStrategy: Send + Sync + Debug {
    /// Order the candidates worth trying. Queues without capacity must not
    /// be returned.
    fn choose_queues(&self, candidates: &[QueueCandidate], consumer_id: &str) -> Vec<String>;
}

/// Weighted random order without replacement. Older queues and queues with
/// more room get proportionally more weight, so no queue starves.
#[derive(Debug, Clone)]
pub struct WeightedAgeCapacityStrategy {
    /// Age at which the age factor stops growing
    pub max_age_ms: i64,
    /// Share of the weight given to age, the rest goes to capacity
    pub age_bias: f64,
}

impl Default for WeightedAgeCapacityStrategy {
    fn default() -> Self {
        Self {
            max_age_ms: 60_000,
            age_bias: 0.7,
        }
    }
}

impl WeightedAgeCapacityStrategy {
    fn weight(&self, candidate: &QueueCandidate, max_capacity: u64) -> f64 {
        let age = candidate.age_ms.clamp(0, self.max_age_ms.max(1)) as f64;
        let age_factor = age / self.max_age_ms.max(1) as f64;
        let capacity_factor = candidate.available_capacity as f64 / max_capacity.max(1) as f64;
        // Floor keeps brand-new queues selectable.
        0.01 + self.age_bias * age_factor + (1.0 - self.age_bias) * capacity_factor
    }
}

impl QueuePriorityStrategy for WeightedAgeCapacityStrategy {
    fn choose_queues(&self, candidates: &[QueueCandidate], _consumer_id: &str) -> Vec<String> {
        let max_capacity = candidates
            .iter()
            .map(|c| c.available_capacity)
            .max()
            .unwrap_or(0);

        let mut pool: Vec<(String, f64)> = candidates
            .iter()
            .filter(|c| c.available_capacity > 0)
            .map(|c| (c.queue_key.clone(), self.weight(c, max_capacity)))
            .collect();

        let mut rng = rand::thread_rng();
        let mut ordered = Vec::with_capacity(pool.len());
        while !pool.is_empty() {
            let total: f64 = pool.iter().map(|(_, w)| w).sum();
            let mut target = rng.gen_range(0.0..total);
            let mut picked = pool.len() - 1;
            for (index, (_, weight)) in pool.iter().enumerate() {
                if target < *weight {
                    picked = index;
                    break;
                }
                target -= weight;
            }
            ordered.push(pool.swap_remove(picked).0);
        }
        ordered
    }
}

/// Strict oldest-first order. Deterministic, used where tests need a
/// predictable choice.
#[derive(Debug, Clone, Default)]
pub struct OldestFirstStrategy;

impl QueuePriorityStrategy for OldestFirstStrategy {
    fn choose_queues(&self, candidates: &[QueueCandidate], _consumer_id: &str) -> Vec<String> {
        let mut available: Vec<&QueueCandidate> = candidates
            .iter()
            .filter(|c| c.available_capacity > 0)
            .collect();
        available.sort_by(|a, b| {
            b.age_ms
                .cmp(&a.age_ms)
                .then_with(|| a.queue_key.cmp(&b.queue_key))
        });
        available.into_iter().map(|c| c.queue_key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn candidate(key: &str, age_ms: i64, capacity: u64) -> QueueCandidate {
        QueueCandidate {
            queue_key: key.to_string(),
            age_ms,
            available_capacity: capacity,
        }
    }

    #[test]
    fn test_oldest_first_orders_by_age() {
        let chosen = OldestFirstStrategy.choose_queues(
            &[
                candidate("young", 10, 5),
                candidate("old", 5_000, 1),
                candidate("full", 99_999, 0),
            ],
            "consumer",
        );
        assert_eq!(chosen, vec!["old".to_string(), "young".to_string()]);
    }

    #[test]
    fn test_weighted_returns_each_available_queue_once() {
        let strategy = WeightedAgeCapacityStrategy::default();
        let chosen = strategy.choose_queues(
            &[candidate("a", 0, 1), candidate("b", 100, 3), candidate("c", 50, 2)],
            "consumer",
        );
        let mut sorted = chosen.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_weighted_favours_old_queues() {
        let strategy = WeightedAgeCapacityStrategy::default();
        let candidates = [candidate("old", 60_000, 1), candidate("new", 0, 1)];
        let old_first = (0..500)
            .filter(|_| strategy.choose_queues(&candidates, "c")[0] == "old")
            .count();
        assert!(old_first > 300, "old queue chosen first {old_first}/500 times");
    }

    proptest! {
        #[test]
        fn prop_exhausted_queues_are_never_chosen(
            entries in proptest::collection::vec((0i64..120_000, 0u64..4), 0..12)
        ) {
            let candidates: Vec<QueueCandidate> = entries
                .iter()
                .enumerate()
                .map(|(i, (age, capacity))| candidate(&format!("q{i}"), *age, *capacity))
                .collect();
            let strategies: [&dyn QueuePriorityStrategy; 2] =
                [&WeightedAgeCapacityStrategy::default(), &OldestFirstStrategy];
            for strategy in strategies {
                let chosen = strategy.choose_queues(&candidates, "consumer");
                let expected = candidates.iter().filter(|c| c.available_capacity > 0).count();
                prop_assert_eq!(chosen.len(), expected);
                for key in &chosen {
                    let source = candidates.iter().find(|c| &c.queue_key == key).unwrap();
                    prop_assert!(source.available_capacity > 0);
                }
            }
        }
    }
}
