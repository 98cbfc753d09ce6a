//! Controller module for flink-operator.
//!
//! Contains the reconciliation loop, the phase state machine and its
//! handlers, the lifecycle operations, error handling, status management
//! and validation logic.

pub mod context;
pub mod error;
pub mod flink;
pub mod k8s;
pub mod phases;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use error::{Error, Result};
pub use flink::FlinkController;
pub use state_machine::{ApplicationEvent, ApplicationStateMachine};
