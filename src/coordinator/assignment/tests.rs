//! Scenario tests for the assignment module
//!
//! Unit tests of the algorithm internals live in `sticky.rs`; these tests
//! drive whole membership histories through the strategy trait.

use super::*;
use crate::coordinator::model::EventTypePartition;

fn universe(topics: &[(&str, u32)]) -> Vec<EventTypePartition> {
    let mut keys: Vec<EventTypePartition> = topics
        .iter()
        .flat_map(|(name, count)| (0..*count).map(move |p| EventTypePartition::new(*name, p)))
        .collect();
    keys.sort();
    keys
}

fn ids(sessions: &[&str]) -> Vec<String> {
    sessions.iter().map(|s| s.to_string()).collect()
}

fn run(sessions: &[&str], partitions: &[EventTypePartition], previous: &Assignment) -> Assignment {
    StickyStrategy::new().assign(&AssignmentInput::new(
        ids(sessions),
        partitions.to_vec(),
        previous.clone(),
    ))
}

fn assert_balanced(sessions: &[&str], assignment: &Assignment) {
    let sessions = ids(sessions);
    let counts = partition_counts(&sessions, assignment);
    let max = counts.values().max().copied().unwrap_or(0);
    let min = counts.values().min().copied().unwrap_or(0);
    assert!(max - min <= 1, "unbalanced assignment: {:?}", counts);
}

#[test]
fn test_no_sessions_leaves_everything_unassigned() {
    let partitions = universe(&[("et", 4)]);
    assert!(run(&[], &partitions, &Assignment::new()).is_empty());
}

#[test]
fn test_no_partitions() {
    assert!(run(&["a", "b"], &[], &Assignment::new()).is_empty());
}

#[test]
fn test_single_session_gets_everything() {
    let partitions = universe(&[("et", 2)]);
    let result = run(&["a"], &partitions, &Assignment::new());
    assert_eq!(result.len(), 2);
    assert!(result.values().all(|owner| owner == "a"));
}

#[test]
fn test_second_joiner_takes_one_partition() {
    // One session over two partitions, then a second session joins
    let partitions = universe(&[("et", 2)]);
    let first = run(&["a"], &partitions, &Assignment::new());
    let second = run(&["a", "b"], &partitions, &first);

    assert_eq!(second[&EventTypePartition::new("et", 0)], "a");
    assert_eq!(second[&EventTypePartition::new("et", 1)], "b");
    assert_eq!(moved_partitions(&first, &second).len(), 1);
}

#[test]
fn test_joiner_does_not_disturb_balanced_sessions() {
    let partitions = universe(&[("et", 6)]);
    let before = run(&["a", "b", "c"], &partitions, &Assignment::new());
    let after = run(&["a", "b", "c", "d"], &partitions, &before);

    assert_balanced(&["a", "b", "c", "d"], &after);
    // 6 over 4 sessions: two keep 2, one drops to 1, d gets 1
    let moved = moved_partitions(&before, &after);
    assert_eq!(moved.len(), 1);
    assert_eq!(after[&moved[0]], "d");
}

#[test]
fn test_leaver_partitions_spread_over_survivors() {
    let partitions = universe(&[("et", 6)]);
    let before = run(&["a", "b", "c"], &partitions, &Assignment::new());
    let after = run(&["a", "c"], &partitions, &before);

    assert_balanced(&["a", "c"], &after);
    assert_eq!(after.len(), 6);
    // Survivors keep everything they had
    for (key, owner) in &before {
        if owner != "b" {
            assert_eq!(&after[key], owner);
        }
    }
    assert_eq!(moved_partitions(&before, &after).len(), 2);
}

#[test]
fn test_multiple_event_types_are_one_universe() {
    let partitions = universe(&[("orders", 3), ("payments", 2)]);
    let result = run(&["a", "b"], &partitions, &Assignment::new());

    assert_eq!(result.len(), 5);
    assert_balanced(&["a", "b"], &result);
    assert_eq!(owned_by(&result, "a").len(), 3);
    assert_eq!(owned_by(&result, "b").len(), 2);
}

#[test]
fn test_more_sessions_than_partitions() {
    let partitions = universe(&[("et", 2)]);
    let result = run(&["a", "b", "c"], &partitions, &Assignment::new());

    assert_eq!(result.len(), 2);
    assert_balanced(&["a", "b", "c"], &result);
    // Oldest sessions are served first
    assert!(owned_by(&result, "c").is_empty());
}

#[test]
fn test_idle_session_keeps_nothing_when_it_had_nothing() {
    let partitions = universe(&[("et", 2)]);
    let before = run(&["a", "b", "c"], &partitions, &Assignment::new());
    // c had nothing; a leaves, c should pick up a's partition
    let after = run(&["b", "c"], &partitions, &before);

    assert_eq!(owned_by(&after, "b").len(), 1);
    assert_eq!(owned_by(&after, "c").len(), 1);
    assert_eq!(after[&EventTypePartition::new("et", 1)], "b");
}

#[test]
fn test_deterministic() {
    let partitions = universe(&[("x", 7), ("y", 5)]);
    let previous = run(&["a", "b"], &partitions, &Assignment::new());
    let first = run(&["a", "b", "c"], &partitions, &previous);
    let second = run(&["a", "b", "c"], &partitions, &previous);
    assert_eq!(first, second);
}

#[test]
fn test_same_membership_is_a_fixed_point() {
    let partitions = universe(&[("et", 5)]);
    let first = run(&["a", "b"], &partitions, &Assignment::new());
    let again = run(&["a", "b"], &partitions, &first);
    assert_eq!(first, again);
    assert!(moved_partitions(&first, &again).is_empty());
}

#[test]
fn test_moved_partitions_counts_unassignment() {
    let partitions = universe(&[("et", 2)]);
    let before = run(&["a"], &partitions, &Assignment::new());
    let after = run(&[], &partitions, &before);
    assert_eq!(moved_partitions(&before, &after).len(), 2);
}
