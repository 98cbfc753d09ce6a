// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the FlinkApplication lifecycle.
//!
//! These tests drive the real phase handlers and state machine against
//! in-memory fakes of the Kubernetes API and the Flink job manager, so whole
//! create, submit and migrate sequences run without a cluster.
//!
//! ```bash
//! cargo test --test functional
//! cargo test --test functional test_fresh_deploy_replaces_stale_cluster -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Lifecycle tests**: first deployment, readiness gating, adoption
//! - **Migration tests**: spec changes moved through savepoint or checkpoint
//! - **Recovery tests**: lost jobs, failures and operator restarts mid-sequence

#[path = "../common/mod.rs"]
mod common;

mod lifecycle_tests;
mod migration_tests;
mod recovery_tests;

pub use fakes::*;
