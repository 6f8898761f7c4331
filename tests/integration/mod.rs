//! Integration test suite for Arbor.
//!
//! These tests drive whole agent trees through the orchestrator against
//! real temporary git repositories. They verify that admission, phases,
//! merge-back, cost rollup and cascades work together correctly.
//!
//! # Test Categories
//!
//! - `scenarios`: Sequential children, merge-back and full tree completion
//! - `concurrency`: Tree invariants under concurrent callers
//! - `cascade`: Failure and cancellation propagation
//! - `merge_flow`: Conflicts, resolution and merge idempotence
//! - `persistence`: Snapshot store reopen
//!
//! # CI Compatibility
//!
//! No agent engine is attached; the tests play the agents' part by calling
//! the orchestrator directly, so they are safe to run in CI environments.

mod fixtures;

mod scenarios;
mod concurrency;
mod merge_flow;
mod persistence;
