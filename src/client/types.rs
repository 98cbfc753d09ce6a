//! Wire types for the Flink job manager REST API.
//!
//! Field names follow the engine's JSON exactly; unknown fields are ignored.

use serde::{Deserialize, Serialize};

/// Response of `GET /overview`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterOverviewResponse {
    /// Number of registered task managers.
    #[serde(rename = "taskmanagers", default)]
    pub task_manager_count: i32,
    /// Total task slots.
    #[serde(rename = "slots-total", default)]
    pub number_of_task_slots: i32,
    /// Slots not assigned to a job.
    #[serde(rename = "slots-available", default)]
    pub slots_available: i32,
    /// Jobs currently running.
    #[serde(rename = "jobs-running", default)]
    pub jobs_running: i32,
    /// Jobs that reached FINISHED.
    #[serde(rename = "jobs-finished", default)]
    pub jobs_finished: i32,
    /// Jobs that reached CANCELED.
    #[serde(rename = "jobs-cancelled", default)]
    pub jobs_cancelled: i32,
    /// Jobs that reached FAILED.
    #[serde(rename = "jobs-failed", default)]
    pub jobs_failed: i32,
}

/// Response of `GET /taskmanagers`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TaskManagersResponse {
    #[serde(rename = "taskmanagers", default)]
    pub task_managers: Vec<TaskManagerStats>,
}

/// One task manager as reported by the job manager.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskManagerStats {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub data_port: i32,
    /// Epoch milliseconds of the last heartbeat received by the job manager.
    #[serde(rename = "timeSinceLastHeartbeat", default)]
    pub time_since_last_heartbeat: i64,
    #[serde(default)]
    pub slots_number: i32,
    #[serde(default)]
    pub free_slots: i32,
}

/// Response of `GET /jobs`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobsResponse {
    #[serde(default)]
    pub jobs: Vec<FlinkJob>,
}

/// A job known to the job manager.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FlinkJob {
    #[serde(rename = "id")]
    pub job_id: String,
    pub status: JobState,
}

impl FlinkJob {
    pub fn new(job_id: impl Into<String>, status: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            status,
        }
    }
}

/// Job status vocabulary. Unknown values are kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    Created,
    Running,
    Failing,
    Failed,
    Cancelling,
    Canceled,
    Finished,
    Restarting,
    Suspended,
    Reconciling,
    Other(String),
}

impl JobState {
    /// Whether a job in this state counts as the application's active job.
    ///
    /// Cancelling, cancelled, failed and finished jobs are excluded.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            JobState::Canceled | JobState::Cancelling | JobState::Failed | JobState::Finished
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Created => "CREATED",
            JobState::Running => "RUNNING",
            JobState::Failing => "FAILING",
            JobState::Failed => "FAILED",
            JobState::Cancelling => "CANCELLING",
            JobState::Canceled => "CANCELED",
            JobState::Finished => "FINISHED",
            JobState::Restarting => "RESTARTING",
            JobState::Suspended => "SUSPENDED",
            JobState::Reconciling => "RECONCILING",
            JobState::Other(s) => s,
        }
    }
}

impl From<String> for JobState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CREATED" => JobState::Created,
            "RUNNING" => JobState::Running,
            "FAILING" => JobState::Failing,
            "FAILED" => JobState::Failed,
            "CANCELLING" => JobState::Cancelling,
            "CANCELED" | "CANCELLED" => JobState::Canceled,
            "FINISHED" => JobState::Finished,
            "RESTARTING" => JobState::Restarting,
            "SUSPENDED" => JobState::Suspended,
            "RECONCILING" => JobState::Reconciling,
            _ => JobState::Other(value),
        }
    }
}

impl From<JobState> for String {
    fn from(value: JobState) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /jars/{jarId}/run`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub parallelism: i32,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub program_args: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub entry_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savepoint_path: Option<String>,
}

/// Response of `POST /jars/{jarId}/run`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SubmitJobResponse {
    #[serde(rename = "jobid", default)]
    pub job_id: String,
}

/// Body of `POST /jobs/{jobId}/savepoints`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SavepointRequest {
    #[serde(rename = "target-directory", skip_serializing_if = "Option::is_none")]
    pub target_directory: Option<String>,
    #[serde(rename = "cancel-job")]
    pub cancel_job: bool,
}

/// Response of `POST /jobs/{jobId}/savepoints`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SavepointTriggerResponse {
    #[serde(rename = "request-id", default)]
    pub trigger_id: String,
}

/// Response of `GET /jobs/{jobId}/savepoints/{triggerId}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SavepointStatusResponse {
    pub status: SavepointQueueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<SavepointOperation>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SavepointQueueStatus {
    /// `IN_PROGRESS`, `COMPLETED` or `FAILED`.
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SavepointOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(
        rename = "failure-cause",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub failure_cause: Option<FailureCause>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FailureCause {
    #[serde(rename = "class", default)]
    pub class: String,
    #[serde(rename = "stack-trace", default)]
    pub stack_trace: String,
}

/// Outcome of a savepoint trigger, as seen by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SavepointStatus {
    InProgress,
    Completed { location: String },
    Failed { cause: String },
}

impl From<SavepointStatusResponse> for SavepointStatus {
    fn from(response: SavepointStatusResponse) -> Self {
        let operation = response.operation.unwrap_or_default();
        let failure = operation.failure_cause.map(|cause| {
            if cause.class.is_empty() {
                "savepoint failed".to_string()
            } else {
                cause.class
            }
        });
        match response.status.id.as_str() {
            "IN_PROGRESS" => SavepointStatus::InProgress,
            "FAILED" => SavepointStatus::Failed {
                cause: failure.unwrap_or_else(|| "savepoint failed".to_string()),
            },
            "COMPLETED" => match (operation.location, failure) {
                (Some(location), None) if !location.is_empty() => {
                    SavepointStatus::Completed { location }
                }
                (_, Some(cause)) => SavepointStatus::Failed { cause },
                _ => SavepointStatus::Failed {
                    cause: "savepoint completed without a location".to_string(),
                },
            },
            other => SavepointStatus::Failed {
                cause: format!("unknown savepoint status {other}"),
            },
        }
    }
}

/// Response of `GET /jobs/{jobId}/checkpoints`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CheckpointResponse {
    #[serde(default)]
    pub latest: LatestCheckpoints,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LatestCheckpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<CheckpointStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint: Option<CheckpointStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored: Option<CheckpointStatistics>,
}

/// A single checkpoint record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CheckpointStatistics {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub trigger_timestamp: i64,
    #[serde(default)]
    pub is_savepoint: bool,
    #[serde(default)]
    pub external_path: String,
}

/// Error body returned by the engine on non-2xx responses.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ErrorResponse {
    #[serde(default)]
    pub errors: Vec<String>,
}
