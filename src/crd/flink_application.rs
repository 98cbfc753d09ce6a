//! FlinkApplication Custom Resource Definition.
//!
//! A FlinkApplication describes one streaming job and the cluster it runs on.
//! The operator owns the job-manager and task-manager deployments for each
//! generation of the spec and records the job's progress in the status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// FlinkApplication is a custom resource for running a Flink job on its own cluster.
///
/// Example:
/// ```yaml
/// apiVersion: flink.k8s.io/v1alpha1
/// kind: FlinkApplication
/// metadata:
///   name: wordcount
/// spec:
///   image: registry.example.com/wordcount:1.4.0
///   flinkVersion: "1.7"
///   jarName: wordcount.jar
///   entryClass: org.example.WordCount
///   parallelism: 8
///   savepointInfo:
///     savepointOnUpdate: true
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flink.k8s.io",
    version = "v1alpha1",
    kind = "FlinkApplication",
    plural = "flinkapplications",
    shortname = "flinkapp",
    status = "FlinkApplicationStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.clusterStatus.health"}"#,
    printcolumn = r#"{"name":"Job", "type":"string", "jsonPath":".status.jobId"}"#,
    printcolumn = r#"{"name":"Parallelism", "type":"integer", "jsonPath":".spec.parallelism"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlinkApplicationSpec {
    /// Container image holding the Flink distribution and the job jar.
    pub image: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// Flink version the image was built for (e.g. "1.7").
    #[serde(default)]
    pub flink_version: String,

    /// Job parallelism (default 1). Also drives the task manager count.
    #[serde(default = "default_parallelism")]
    pub parallelism: i32,

    /// Fully qualified main class of the job.
    #[serde(default)]
    pub entry_class: String,

    /// Program arguments passed to the job's main method.
    #[serde(default)]
    pub program_args: String,

    /// Identifier of the jar uploaded to the job manager.
    pub jar_name: String,

    /// Task manager settings.
    #[serde(default)]
    pub task_manager_config: TaskManagerConfig,

    /// Job manager settings.
    #[serde(default)]
    pub job_manager_config: JobManagerConfig,

    /// Extra `flink-conf.yaml` properties.
    #[serde(default)]
    pub flink_config: BTreeMap<String, String>,

    /// Savepoint restore and migration directives.
    #[serde(default)]
    pub savepoint_info: SavepointInfo,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Additional annotations to apply to all managed resources.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for FlinkApplicationSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            image_pull_policy: default_image_pull_policy(),
            flink_version: String::new(),
            parallelism: default_parallelism(),
            entry_class: String::new(),
            program_args: String::new(),
            jar_name: String::new(),
            task_manager_config: TaskManagerConfig::default(),
            job_manager_config: JobManagerConfig::default(),
            flink_config: BTreeMap::new(),
            savepoint_info: SavepointInfo::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

impl FlinkApplicationSpec {
    /// Task slots per task manager, falling back to [`DEFAULT_TASK_SLOTS`].
    pub fn task_slots(&self) -> i32 {
        self.task_manager_config
            .task_slots
            .unwrap_or(DEFAULT_TASK_SLOTS)
    }

    /// Number of task managers needed to run the job at the requested parallelism.
    pub fn task_manager_replicas(&self) -> i32 {
        task_manager_replicas(self.parallelism, self.task_slots())
    }
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_parallelism() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

/// Task manager configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskManagerConfig {
    /// Task slots per task manager (default: 16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_slots: Option<i32>,

    /// CPU and memory requests for each task manager.
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// Job manager configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobManagerConfig {
    /// CPU and memory requests for the job manager.
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// CPU and memory requests. Unset values are left to the cluster defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request (e.g. "500m").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory request (e.g. "2Gi").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Savepoint directives.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SavepointInfo {
    /// Explicit savepoint path to restore the first submission from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savepoint_location: Option<String>,

    /// Cancel the running job with a savepoint before migrating to a new
    /// cluster (default: true). When disabled the latest externalized
    /// checkpoint is used as the restore source.
    #[serde(default = "default_true")]
    pub savepoint_on_update: bool,
}

impl Default for SavepointInfo {
    fn default() -> Self {
        Self {
            savepoint_location: None,
            savepoint_on_update: default_true(),
        }
    }
}

/// Status of a FlinkApplication.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlinkApplicationStatus {
    /// Current phase of the application lifecycle.
    #[serde(default)]
    pub phase: ApplicationPhase,

    /// Identifier of the job submitted to the current cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Fingerprint of the cluster generation the job runs on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_hash: Option<String>,

    /// Health snapshot of the current cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_status: Option<FlinkClusterStatus>,

    /// Trigger id of an in-flight cancel-with-savepoint request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savepoint_trigger_id: Option<String>,

    /// Restore source for the next submission (savepoint or checkpoint path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savepoint_location: Option<String>,

    /// Reason the application entered the Failed phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the controller wrote this status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<String>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Health snapshot derived from the job manager's view of the cluster.
///
/// Recomputed on every cycle, never merged with the previous snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlinkClusterStatus {
    /// Task managers registered with the job manager.
    pub number_of_task_managers: i32,
    /// Task managers whose last heartbeat is within the freshness threshold.
    pub healthy_task_managers: i32,
    /// Total task slots in the cluster.
    pub number_of_task_slots: i32,
    /// Task slots not assigned to any job.
    pub available_task_slots: i32,
    /// Overall verdict.
    pub health: ClusterHealth,
}

/// Tri-state cluster health verdict.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterHealth {
    /// Every registered task manager is heartbeating.
    Green,
    /// Some task managers are stale.
    Yellow,
    /// No task manager is heartbeating, or none are registered.
    #[default]
    Red,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Green => write!(f, "Green"),
            ClusterHealth::Yellow => write!(f, "Yellow"),
            ClusterHealth::Red => write!(f, "Red"),
        }
    }
}

/// ApplicationPhase is the persisted position of the application in its
/// create, submit, migrate and clean up sequence.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ApplicationPhase {
    /// No job yet. The cluster for the desired spec has not been created.
    #[default]
    New,
    /// Cluster resources exist, waiting for pods and the job manager API.
    ClusterStarting,
    /// Cluster is ready, the job is being submitted.
    Submitting,
    /// Job runs on the new cluster, previous generations are being removed.
    DeletingOldCluster,
    /// Job is running on the cluster matching the desired spec.
    Running,
    /// Spec changed, a cancel-with-savepoint is being requested.
    Savepointing,
    /// Waiting for the engine to finish the savepoint.
    SavepointInProgress,
    /// Savepoint location recorded.
    SavepointComplete,
    /// Waiting for the old job to leave the active set.
    Cancelling,
    /// Old job is gone, the new generation can be created.
    Cancelled,
    /// Unrecoverable error, waiting for a spec change.
    Failed,
    /// Application is being deleted.
    Deleting,
}

impl ApplicationPhase {
    /// Every phase, in lifecycle order.
    pub const ALL: [ApplicationPhase; 12] = [
        ApplicationPhase::New,
        ApplicationPhase::ClusterStarting,
        ApplicationPhase::Submitting,
        ApplicationPhase::DeletingOldCluster,
        ApplicationPhase::Running,
        ApplicationPhase::Savepointing,
        ApplicationPhase::SavepointInProgress,
        ApplicationPhase::SavepointComplete,
        ApplicationPhase::Cancelling,
        ApplicationPhase::Cancelled,
        ApplicationPhase::Failed,
        ApplicationPhase::Deleting,
    ];

    /// Phases in which the controller is waiting on an external system and
    /// should poll again soon.
    pub fn is_transitional(&self) -> bool {
        !matches!(
            self,
            ApplicationPhase::Running | ApplicationPhase::Failed | ApplicationPhase::Deleting
        )
    }
}

impl std::fmt::Display for ApplicationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplicationPhase::New => write!(f, "New"),
            ApplicationPhase::ClusterStarting => write!(f, "ClusterStarting"),
            ApplicationPhase::Submitting => write!(f, "Submitting"),
            ApplicationPhase::DeletingOldCluster => write!(f, "DeletingOldCluster"),
            ApplicationPhase::Running => write!(f, "Running"),
            ApplicationPhase::Savepointing => write!(f, "Savepointing"),
            ApplicationPhase::SavepointInProgress => write!(f, "SavepointInProgress"),
            ApplicationPhase::SavepointComplete => write!(f, "SavepointComplete"),
            ApplicationPhase::Cancelling => write!(f, "Cancelling"),
            ApplicationPhase::Cancelled => write!(f, "Cancelled"),
            ApplicationPhase::Failed => write!(f, "Failed"),
            ApplicationPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition describes the state of an application at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Degraded", degraded, reason, message, generation)
    }
}

/// Default task slots per task manager when the spec leaves it unset.
pub const DEFAULT_TASK_SLOTS: i32 = 16;

/// Task managers needed for `parallelism`: ceil(parallelism / task_slots), at least 1.
pub fn task_manager_replicas(parallelism: i32, task_slots: i32) -> i32 {
    if task_slots <= 0 || parallelism <= 0 {
        return 1;
    }
    let full = parallelism / task_slots;
    if parallelism % task_slots == 0 {
        full
    } else {
        full + 1
    }
}
