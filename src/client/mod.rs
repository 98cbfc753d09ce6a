//! Flink job manager client.
//!
//! - [`FlinkApi`]: the operations the controller calls, mockable in tests
//! - [`FlinkRestClient`]: the HTTP implementation
//! - [`types`]: request and response bodies

pub mod flink_client;
pub mod types;

#[cfg(test)]
pub use flink_client::MockFlinkApi;
pub use flink_client::{DEFAULT_REQUEST_TIMEOUT, FlinkApi, FlinkClientError, FlinkRestClient};
pub use types::{
    CheckpointStatistics, ClusterOverviewResponse, FlinkJob, JobState, SavepointStatus,
    SubmitJobRequest, SubmitJobResponse, TaskManagerStats,
};
