//! Integration test suite for swarm.
//!
//! These tests run whole plans through the orchestrator, including
//! parallel execution, resource locking and failure handling. They verify
//! that all components work together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full plan execution, from plan file to run result
//! - `parallel_agents`: Concurrency cap and dispatch order
//! - `conflict_resolution`: Resource lock exclusivity and release
//! - `recovery`: Failures, timeouts, crashes, retries and cancellation
//! - `properties`: Property tests for stratification and skip cascades
//!
//! # CI Compatibility
//!
//! These tests use scripted runners and never spawn a real agent, making
//! them safe to run in CI environments.


mod workflow_e2e;
mod conflict_resolution;
mod recovery;
