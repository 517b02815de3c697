//! Integration test suite for hive.
//!
//! These tests drive the coordinator, negotiation and scaling engines
//! together through the public API, with scripted executors standing in for
//! real agents.
//!
//! # Test Categories
//!
//! - `scheduling`: Dependency order, concurrency, retries and failure propagation
//! - `negotiation`: Bid selection, standalone and inside a run
//! - `scaling`: Rule evaluation, manual scaling and the audit trail
//! - `isolation`: Branch-per-task worktrees against a real repository
//!
//! # CI Compatibility
//!
//! No agent binary is invoked, so the suite is safe to run in CI.

mod fixtures;

mod isolation;
mod negotiation;
mod scaling;
