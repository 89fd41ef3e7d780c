//! Sticky, balanced assignment
//!
//! # Goals (in priority order)
//!
//! 1. **Exclusivity**: every partition goes to at most one live session
//! 2. **Balance**: partition counts of any two sessions differ by at most one
//! 3. **Stickiness**: a session keeps as many of its partitions as balance allows
//!
//! # Algorithm
//!
//! With `p` partitions and `n` sessions every session gets a quota of
//! `p / n` partitions, and `p % n` sessions get one more. The extra slots go
//! to the sessions that already hold the most partitions (ties: oldest
//! session first), so a joiner takes partitions only from sessions that are
//! above their new quota.
//!
//! 1. Each live session keeps its previous partitions, in key order, up to
//!    its quota; the rest are released
//! 2. Partitions of departed sessions, released partitions and never
//!    assigned partitions form the pool
//! 3. The pool is handed out in key order, each partition to the session
//!    furthest below its quota (ties: oldest session first)
//!
//! # Example
//!
//! Session A holds [0, 1]; session B joins. Both quotas are 1, A keeps 0 and
//! releases 1, B receives 1.

use std::collections::{BTreeSet, HashMap};

use super::{Assignment, AssignmentInput, AssignmentStrategy};
use crate::coordinator::model::EventTypePartition;

/// Sticky partition assignment strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct StickyStrategy;

impl StickyStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl AssignmentStrategy for StickyStrategy {
    fn name(&self) -> &'static str {
        "sticky-balanced"
    }

    fn assign(&self, input: &AssignmentInput) -> Assignment {
        assign(&input.sessions, &input.partitions, &input.previous)
    }
}

/// Compute a balanced assignment that preserves previous ownership
///
/// # Arguments
/// * `sessions` - live session ids, oldest first
/// * `partitions` - partition universe (duplicates are ignored)
/// * `previous` - last persisted owners; owners not in `sessions` are ignored
pub fn assign(
    sessions: &[String],
    partitions: &[EventTypePartition],
    previous: &Assignment,
) -> Assignment {
    let mut result = Assignment::new();
    let universe: BTreeSet<&EventTypePartition> = partitions.iter().collect();
    let n = sessions.len();
    if n == 0 || universe.is_empty() {
        return result;
    }

    // First occurrence wins if a session id is listed twice
    let mut rank: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (idx, session) in sessions.iter().enumerate() {
        rank.entry(session.as_str()).or_insert(idx);
    }

    // Previous partitions still valid for each live session, in key order
    let mut prior: Vec<Vec<&EventTypePartition>> = vec![Vec::new(); n];
    for key in &universe {
        if let Some(idx) = previous.get(*key).and_then(|owner| rank.get(owner.as_str())) {
            prior[*idx].push(*key);
        }
    }

    let quotas = quotas(&prior, universe.len());

    let mut counts = vec![0usize; n];
    let mut pool: Vec<&EventTypePartition> = Vec::new();
    for (idx, keys) in prior.iter().enumerate() {
        for key in keys {
            if counts[idx] < quotas[idx] {
                result.insert((*key).clone(), sessions[idx].clone());
                counts[idx] += 1;
            } else {
                pool.push(*key);
            }
        }
    }
    pool.extend(
        universe
            .iter()
            .filter(|key| {
                !result.contains_key(**key)
                    && previous
                        .get(**key)
                        .and_then(|owner| rank.get(owner.as_str()))
                        .is_none()
            })
            .copied(),
    );
    pool.sort();

    for key in pool {
        let Some(idx) = (0..n)
            .filter(|&idx| counts[idx] < quotas[idx])
            .max_by(|&a, &b| {
                let deficit_a = quotas[a] - counts[a];
                let deficit_b = quotas[b] - counts[b];
                // On equal deficit prefer the older session (lower index)
                deficit_a.cmp(&deficit_b).then(b.cmp(&a))
            })
        else {
            break;
        };
        result.insert(key.clone(), sessions[idx].clone());
        counts[idx] += 1;
    }

    result
}

/// Per-session partition quota
///
/// Sessions holding more valid partitions get the `total % n` extra slots
/// first, so fewer partitions have to move.
fn quotas(prior: &[Vec<&EventTypePartition>], total: usize) -> Vec<usize> {
    let n = prior.len();
    let base = total / n;
    let extra = total % n;

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| prior[b].len().cmp(&prior[a].len()).then(a.cmp(&b)));

    let mut quotas = vec![base; n];
    for &idx in order.iter().take(extra) {
        quotas[idx] += 1;
    }
    quotas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(event_type: &str, count: u32) -> Vec<EventTypePartition> {
        (0..count)
            .map(|p| EventTypePartition::new(event_type, p))
            .collect()
    }

    fn sessions(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_name() {
        assert_eq!(StickyStrategy::new().name(), "sticky-balanced");
    }

    #[test]
    fn test_quota_prefers_sessions_with_more_partitions() {
        let a = EventTypePartition::new("et", 0);
        let b = EventTypePartition::new("et", 1);
        let c = EventTypePartition::new("et", 2);
        let prior = vec![vec![&a], vec![&b, &c], vec![]];
        // 5 partitions over 3 sessions: two sessions get 2, one gets 1
        assert_eq!(quotas(&prior, 5), vec![2, 2, 1]);
        assert_eq!(quotas(&prior, 3), vec![1, 1, 1]);
        assert_eq!(quotas(&prior, 4), vec![1, 2, 1]);
    }

    #[test]
    fn test_duplicate_partitions_are_ignored() {
        let mut partitions = keys("et", 2);
        partitions.extend(keys("et", 2));
        let result = assign(&sessions(&["a"]), &partitions, &Assignment::new());
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_stale_owner_partitions_are_reassigned() {
        let partitions = keys("et", 4);
        let mut previous = Assignment::new();
        for key in &partitions {
            previous.insert(key.clone(), "gone".to_string());
        }

        let result = assign(&sessions(&["a", "b"]), &partitions, &previous);
        assert_eq!(result.len(), 4);
        assert!(result.values().all(|owner| owner != "gone"));
        // Round-robin in key order, oldest session first
        assert_eq!(result[&partitions[0]], "a");
        assert_eq!(result[&partitions[1]], "b");
        assert_eq!(result[&partitions[2]], "a");
        assert_eq!(result[&partitions[3]], "b");
    }
}
