//! Testing utilities for the subscription coordinator
//!
//! Only compiled for unit tests.
//!
//! # Organization
//! - `mocks.rs` - mockall doubles of the store and log traits, test config
//! - `helpers.rs` - fixtures wiring the in-memory store and log together

#![cfg(test)]

pub mod helpers;
pub mod mocks;

pub use helpers::{registry_fixture, settle, store_with_subscription, CoordinatorFixture};
pub use mocks::{fast_config, MockCoordinationStore, MockEventLog};
