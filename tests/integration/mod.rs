//! Integration test suite for corekeep
//!
//! End-to-end tests driving the public API with fakes for the process and health
//! seams, `file://` release assets, and the real binary through `assert_cmd`.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **install**: Install pipeline through the orchestrator, including rejected artifacts
//! - **rollback**: Health monitoring and automatic / forced rollback
//! - **ports**: Port ownership checks against a real listener
//! - **cli**: The `corekeep` binary against a temporary root

mod common;

mod cli;
mod install;
mod ports;
mod rollback;
