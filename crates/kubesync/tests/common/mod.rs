//! Shared test utilities for kubesync integration tests.
//!
//! This module provides:
//! - In-memory fakes for the repository and the cluster
//! - `SyncHarness` wiring them to a controller over a temporary manifest tree

pub mod fakes;
pub mod harness;

pub use fakes::{FakeCluster, FakeRepo};
pub use harness::{SyncHarness, NAMESPACE};
