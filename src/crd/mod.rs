//! Custom Resource Definitions (CRDs) for flink-operator.
//!
//! - `FlinkApplication`: a streaming job together with the cluster it runs on

mod flink_application;

pub use flink_application::*;
