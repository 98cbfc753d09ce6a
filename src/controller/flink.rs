//! Application lifecycle operations.
//!
//! [`FlinkController`] answers the questions the phase handlers ask about one
//! application (has the spec changed, is the cluster ready, which job is
//! active) and performs the one-shot actions they request. It keeps no state
//! between calls: everything is derived from the application, the live
//! deployments and the job manager.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::error::{Error, Result};
use super::k8s::K8sCluster;
use crate::client::{
    ClusterOverviewResponse, FlinkApi, FlinkJob, SavepointStatus, SubmitJobRequest,
    TaskManagerStats,
};
use crate::config::ControllerConfig;
use crate::crd::{ClusterHealth, FlinkApplication, FlinkClusterStatus};
use crate::resources::common::{TASK_MANAGER, app_selector, generation_selector, job_manager_url};
use crate::resources::task_manager::{deployment_hash, deployment_role};
use crate::resources::{
    ClusterComponent, JobManagerController, TaskManagerController, task_manager_fingerprint,
};

/// Lifecycle operations for Flink applications.
pub struct FlinkController {
    k8s: Arc<dyn K8sCluster>,
    flink: Arc<dyn FlinkApi>,
    job_manager: Arc<dyn ClusterComponent>,
    task_manager: Arc<dyn ClusterComponent>,
    heartbeat_threshold: Duration,
}

impl FlinkController {
    /// Controller using the standard job manager and task manager builders.
    pub fn new(k8s: Arc<dyn K8sCluster>, flink: Arc<dyn FlinkApi>, config: &ControllerConfig) -> Self {
        Self {
            job_manager: Arc::new(JobManagerController::new(k8s.clone())),
            task_manager: Arc::new(TaskManagerController::new(k8s.clone())),
            k8s,
            flink,
            heartbeat_threshold: config.heartbeat_threshold,
        }
    }

    /// Controller with explicit cluster components.
    pub fn with_components(
        k8s: Arc<dyn K8sCluster>,
        flink: Arc<dyn FlinkApi>,
        job_manager: Arc<dyn ClusterComponent>,
        task_manager: Arc<dyn ClusterComponent>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            k8s,
            flink,
            job_manager,
            task_manager,
            heartbeat_threshold: config.heartbeat_threshold,
        }
    }

    // ========================================================================
    // Change detection
    // ========================================================================

    /// Whether the desired generation still has to be deployed.
    ///
    /// Live deployments are listed by the stable `app` label. The spec has
    /// changed when no task manager carries the desired fingerprint, or when
    /// the one that does runs a different replica count.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn has_application_changed(&self, app: &FlinkApplication) -> Result<bool> {
        let desired_hash = task_manager_fingerprint(app)?;
        let desired_replicas = app.spec.task_manager_replicas();
        let deployments = self
            .k8s
            .get_deployments_with_label(&namespace(app), &app_selector(app))
            .await?;

        let changed = match deployments
            .iter()
            .filter(|d| deployment_role(d).is_none_or(|role| role == TASK_MANAGER))
            .find(|d| deployment_hash(d) == Some(desired_hash.as_str()))
        {
            None => true,
            Some(live) => {
                let live_replicas = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                live_replicas != desired_replicas
            }
        };

        debug!(hash = %desired_hash, changed, "Checked application for changes");
        Ok(changed)
    }

    /// Scale the desired generation's task managers back to the replica
    /// count derived from the spec.
    ///
    /// Returns `Ok(true)` when a deployment was patched. A missing task
    /// manager deployment is left to the phase that creates it.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn restore_task_manager_replicas(&self, app: &FlinkApplication) -> Result<bool> {
        let desired_hash = task_manager_fingerprint(app)?;
        let desired_replicas = app.spec.task_manager_replicas();
        let deployments = self
            .k8s
            .get_deployments_with_label(&namespace(app), &app_selector(app))
            .await?;

        let Some(live) = deployments.iter().find(|d| {
            deployment_role(d) == Some(TASK_MANAGER)
                && deployment_hash(d) == Some(desired_hash.as_str())
        }) else {
            return Ok(false);
        };
        let live_replicas = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if live_replicas == desired_replicas {
            return Ok(false);
        }

        info!(
            hash = %desired_hash,
            live = live_replicas,
            desired = desired_replicas,
            "Restoring task manager replicas"
        );
        self.k8s.scale_deployment(live, desired_replicas).await?;
        Ok(true)
    }

    // ========================================================================
    // Cluster lifecycle
    // ========================================================================

    /// All pods of the desired generation are running. No pods is not ready.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn is_cluster_ready(&self, app: &FlinkApplication) -> Result<bool> {
        let hash = task_manager_fingerprint(app)?;
        let pods = self
            .k8s
            .get_pods_with_label(&namespace(app), &generation_selector(&hash))
            .await?;

        if pods.is_empty() {
            return Ok(false);
        }
        let running = pods
            .iter()
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .count();
        debug!(%hash, running, total = pods.len(), "Checked cluster pods");
        Ok(running == pods.len())
    }

    /// The job manager REST endpoint answers.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn is_service_ready(&self, app: &FlinkApplication) -> Result<bool> {
        self.flink
            .get_cluster_overview(&job_manager_url(app))
            .await?;
        Ok(true)
    }

    /// Create the job manager and task managers of the desired generation.
    ///
    /// A job manager failure stops before the task managers are attempted.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn create_cluster(&self, app: &FlinkApplication) -> Result<()> {
        self.job_manager.create_if_not_exist(app).await?;
        self.task_manager.create_if_not_exist(app).await?;
        info!("Cluster resources ensured");
        Ok(())
    }

    /// Delete every deployment of the application that belongs to a
    /// generation other than the desired one.
    ///
    /// Returns `Ok(true)` when nothing is left to delete, including when
    /// nothing needed deleting.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn delete_old_cluster(&self, app: &FlinkApplication) -> Result<bool> {
        let current_hash = task_manager_fingerprint(app)?;
        let deployments = self
            .k8s
            .get_deployments_with_label(&namespace(app), &app_selector(app))
            .await?;

        let stale = stale_deployments(deployments, &current_hash);
        if stale.is_empty() {
            debug!(hash = %current_hash, "No old cluster to delete");
            return Ok(true);
        }

        let names: Vec<String> = stale.iter().map(|d| d.name_any()).collect();
        info!(hash = %current_hash, deployments = ?names, "Deleting old cluster");
        self.k8s.delete_deployments(stale).await?;
        Ok(true)
    }

    // ========================================================================
    // Job lifecycle
    // ========================================================================

    /// All jobs known to the application's job manager.
    pub async fn get_jobs_for_application(&self, app: &FlinkApplication) -> Result<Vec<FlinkJob>> {
        Ok(self.flink.get_jobs(&job_manager_url(app)).await?)
    }

    /// The active job of the application, if any.
    pub async fn get_active_job(&self, app: &FlinkApplication) -> Result<Option<FlinkJob>> {
        let jobs = self.get_jobs_for_application(app).await?;
        select_active_job(&jobs)
    }

    /// Submit the job described by the spec, optionally restoring from
    /// `savepoint_path`. Returns the new job id.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn start_flink_job(
        &self,
        app: &FlinkApplication,
        savepoint_path: Option<String>,
    ) -> Result<String> {
        let request = SubmitJobRequest {
            parallelism: app.spec.parallelism,
            program_args: app.spec.program_args.clone(),
            entry_class: app.spec.entry_class.clone(),
            savepoint_path,
        };
        let response = self
            .flink
            .submit_job(&job_manager_url(app), &app.spec.jar_name, request)
            .await?;

        if response.job_id.is_empty() {
            error!("Job submission returned an empty job id");
            return Err(Error::InvalidJobId);
        }
        info!(job_id = %response.job_id, "Submitted job");
        Ok(response.job_id)
    }

    /// Cancel `job_id` with a savepoint. Returns the trigger id to poll.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn cancel_with_savepoint(&self, app: &FlinkApplication, job_id: &str) -> Result<String> {
        let trigger_id = self
            .flink
            .cancel_job_with_savepoint(&job_manager_url(app), job_id)
            .await?;
        info!(%trigger_id, "Triggered cancel with savepoint");
        Ok(trigger_id)
    }

    /// Cancel `job_id` without a savepoint.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn cancel_job(&self, app: &FlinkApplication, job_id: &str) -> Result<()> {
        self.flink.cancel_job(&job_manager_url(app), job_id).await?;
        info!("Cancelled job");
        Ok(())
    }

    /// One-shot poll of a savepoint trigger.
    pub async fn get_savepoint_status(
        &self,
        app: &FlinkApplication,
        job_id: &str,
        trigger_id: &str,
    ) -> Result<SavepointStatus> {
        Ok(self
            .flink
            .check_savepoint_status(&job_manager_url(app), job_id, trigger_id)
            .await?)
    }

    /// External path of the latest completed checkpoint of `job_id`.
    ///
    /// `None` means there is nothing to restore from.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn find_externalized_checkpoint(
        &self,
        app: &FlinkApplication,
        job_id: &str,
    ) -> Result<Option<String>> {
        let checkpoint = self
            .flink
            .get_latest_checkpoint(&job_manager_url(app), job_id)
            .await?;
        match checkpoint {
            Some(c) if !c.external_path.is_empty() => {
                debug!(path = %c.external_path, timestamp = c.trigger_timestamp, "Found checkpoint");
                Ok(Some(c.external_path))
            }
            _ => Ok(None),
        }
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Fresh health snapshot of the application's cluster.
    #[instrument(skip(self, app), fields(name = %app.name_any()))]
    pub async fn get_cluster_status(&self, app: &FlinkApplication) -> Result<FlinkClusterStatus> {
        let url = job_manager_url(app);
        let overview = self.flink.get_cluster_overview(&url).await?;
        let task_managers = self.flink.get_task_managers(&url).await?;
        Ok(aggregate_cluster_health(
            &overview,
            &task_managers,
            jiff::Timestamp::now().as_millisecond(),
            self.heartbeat_threshold,
        ))
    }
}

fn namespace(app: &FlinkApplication) -> String {
    app.namespace().unwrap_or_else(|| "default".to_string())
}

// ============================================================================
// Pure Logic Functions
// ============================================================================

/// Deployments whose fingerprint differs from `current_hash`.
pub fn stale_deployments(deployments: Vec<Deployment>, current_hash: &str) -> Vec<Deployment> {
    deployments
        .into_iter()
        .filter(|d| deployment_hash(d) != Some(current_hash))
        .collect()
}

/// The single active job in `jobs`.
///
/// No active job is `Ok(None)`. More than one is an error: an application
/// runs at most one job.
pub fn select_active_job(jobs: &[FlinkJob]) -> Result<Option<FlinkJob>> {
    let active: Vec<&FlinkJob> = jobs.iter().filter(|j| j.status.is_active()).collect();
    match active.as_slice() {
        [] => Ok(None),
        [job] => Ok(Some((*job).clone())),
        many => {
            let ids: Vec<String> = many.iter().map(|j| j.job_id.clone()).collect();
            error!(jobs = ?ids, "More than one active job");
            Err(Error::AmbiguousActiveJob(ids))
        }
    }
}

/// Project the job manager's view of the cluster into a health snapshot.
///
/// `now_ms` and each heartbeat are epoch milliseconds. Totals are taken from
/// the overview as reported.
pub fn aggregate_cluster_health(
    overview: &ClusterOverviewResponse,
    task_managers: &[TaskManagerStats],
    now_ms: i64,
    threshold: Duration,
) -> FlinkClusterStatus {
    let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
    let healthy = task_managers
        .iter()
        .filter(|tm| now_ms.saturating_sub(tm.time_since_last_heartbeat) <= threshold_ms)
        .count();
    let healthy = i32::try_from(healthy).unwrap_or(i32::MAX);

    FlinkClusterStatus {
        number_of_task_managers: overview.task_manager_count,
        healthy_task_managers: healthy,
        number_of_task_slots: overview.number_of_task_slots,
        available_task_slots: overview.slots_available,
        health: health_verdict(healthy, overview.task_manager_count),
    }
}

/// Green when every reported task manager is healthy, Red when none is (or
/// none are reported), Yellow otherwise.
pub fn health_verdict(healthy: i32, total: i32) -> ClusterHealth {
    if total <= 0 || healthy <= 0 {
        ClusterHealth::Red
    } else if healthy >= total {
        ClusterHealth::Green
    } else {
        ClusterHealth::Yellow
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use kube::api::ObjectMeta;

    use super::*;
    use crate::client::{
        CheckpointStatistics, FlinkClientError, JobState, MockFlinkApi, SubmitJobResponse,
    };
    use crate::controller::k8s::MockK8sCluster;
    use crate::crd::{FlinkApplicationSpec, TaskManagerConfig};
    use crate::resources::MockClusterComponent;
    use crate::resources::common::{APP_HASH_LABEL, DEPLOYMENT_TYPE_LABEL, JOB_MANAGER};

    const APP_NAME: &str = "app-name";
    const NAMESPACE: &str = "ns";
    const JOB_ID: &str = "j1";
    const URL: &str = "http://app-name-jm.ns:8081";

    fn test_app() -> FlinkApplication {
        FlinkApplication {
            metadata: ObjectMeta {
                name: Some(APP_NAME.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: FlinkApplicationSpec {
                image: "flink:1.7".to_string(),
                jar_name: "job.jar".to_string(),
                entry_class: "org.example.Main".to_string(),
                program_args: "--input s3://in".to_string(),
                parallelism: 8,
                ..Default::default()
            },
            status: None,
        }
    }

    fn live_deployment(app: &FlinkApplication, role: &str, hash: &str, replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(format!("{}-{hash}-{role}", app.name_any())),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), APP_NAME.to_string()),
                    (DEPLOYMENT_TYPE_LABEL.to_string(), role.to_string()),
                    (APP_HASH_LABEL.to_string(), hash.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn controller(k8s: MockK8sCluster, flink: MockFlinkApi) -> FlinkController {
        controller_with(k8s, flink, MockClusterComponent::new(), MockClusterComponent::new())
    }

    fn controller_with(
        k8s: MockK8sCluster,
        flink: MockFlinkApi,
        jm: MockClusterComponent,
        tm: MockClusterComponent,
    ) -> FlinkController {
        FlinkController::with_components(
            Arc::new(k8s),
            Arc::new(flink),
            Arc::new(jm),
            Arc::new(tm),
            &ControllerConfig::default(),
        )
    }

    fn api_error(message: &str) -> FlinkClientError {
        FlinkClientError::Api {
            status: 500,
            message: message.to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // Change detection
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_is_cluster_ready_all_running() {
        let app = test_app();
        let hash = task_manager_fingerprint(&app).unwrap();
        let mut k8s = MockK8sCluster::new();
        let expected = hash.clone();
        k8s.expect_get_pods_with_label()
            .withf(move |ns, labels| {
                ns == NAMESPACE && labels.get(APP_HASH_LABEL) == Some(&expected) && labels.len() == 1
            })
            .returning(|_, _| Ok(vec![pod("Running"), pod("Running")]));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.is_cluster_ready(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_cluster_ready_pending_pod() {
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_pods_with_label()
            .returning(|_, _| Ok(vec![pod("Running"), pod("Pending")]));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(!controller.is_cluster_ready(&test_app()).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_cluster_ready_no_pods() {
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_pods_with_label().returning(|_, _| Ok(vec![]));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(!controller.is_cluster_ready(&test_app()).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_application_changed_no_deployments() {
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .withf(|ns, labels| {
                ns == NAMESPACE && labels.get("app").map(String::as_str) == Some(APP_NAME)
            })
            .returning(|_, _| Ok(vec![]));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.has_application_changed(&test_app()).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_application_changed_same_spec() {
        let app = test_app();
        let hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![
            live_deployment(&app, JOB_MANAGER, &hash, 1),
            live_deployment(&app, TASK_MANAGER, &hash, 1),
        ];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(!controller.has_application_changed(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_application_changed_different_parallelism() {
        let mut app = test_app();
        app.spec.task_manager_config = TaskManagerConfig {
            task_slots: Some(16),
            ..Default::default()
        };
        app.spec.parallelism = 8;
        let old_hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![live_deployment(&app, TASK_MANAGER, &old_hash, 1)];

        app.spec.parallelism = 10;
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.has_application_changed(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_application_changed_replica_mismatch() {
        let mut app = test_app();
        app.spec.task_manager_config = TaskManagerConfig {
            task_slots: Some(2),
            ..Default::default()
        };
        app.spec.parallelism = 5;
        let hash = task_manager_fingerprint(&app).unwrap();
        // desired is ceil(5 / 2) = 3
        let live = vec![live_deployment(&app, TASK_MANAGER, &hash, 2)];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.has_application_changed(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_application_changed_ignores_job_manager_hash() {
        let app = test_app();
        let hash = task_manager_fingerprint(&app).unwrap();
        // only the job manager of the desired generation exists
        let live = vec![live_deployment(&app, JOB_MANAGER, &hash, 1)];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.has_application_changed(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_application_changed_list_error() {
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(|_, _| Err(Error::MissingField("list failed".to_string())));

        let controller = controller(k8s, MockFlinkApi::new());
        let err = controller
            .has_application_changed(&test_app())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing required field: list failed");
    }

    #[tokio::test]
    async fn test_restore_task_manager_replicas_scales_drifted_deployment() {
        let mut app = test_app();
        app.spec.task_manager_config = TaskManagerConfig {
            task_slots: Some(2),
            ..Default::default()
        };
        app.spec.parallelism = 5;
        let hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![
            live_deployment(&app, JOB_MANAGER, &hash, 1),
            live_deployment(&app, TASK_MANAGER, &hash, 7),
        ];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .times(1)
            .returning(move |_, _| Ok(live.clone()));
        k8s.expect_scale_deployment()
            .withf(|deployment, replicas| {
                deployment_role(deployment) == Some(TASK_MANAGER) && *replicas == 3
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.restore_task_manager_replicas(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_task_manager_replicas_leaves_matching_deployment() {
        let app = test_app();
        let hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![live_deployment(&app, TASK_MANAGER, &hash, 1)];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));
        k8s.expect_scale_deployment().never();

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(!controller.restore_task_manager_replicas(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_task_manager_replicas_ignores_other_generations() {
        let mut app = test_app();
        let old_hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![live_deployment(&app, TASK_MANAGER, &old_hash, 9)];
        app.spec.image = "flink:1.8".to_string();
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));
        k8s.expect_scale_deployment().never();

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(!controller.restore_task_manager_replicas(&app).await.unwrap());
    }

    // ------------------------------------------------------------------------
    // Cluster lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_is_service_ready() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_cluster_overview()
            .withf(|url| url == URL)
            .returning(|_| Ok(ClusterOverviewResponse::default()));

        let controller = controller(MockK8sCluster::new(), flink);
        assert!(controller.is_service_ready(&test_app()).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_service_ready_err() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_cluster_overview()
            .returning(|_| Err(api_error("Get cluster failed")));

        let controller = controller(MockK8sCluster::new(), flink);
        let err = controller.is_service_ready(&test_app()).await.unwrap_err();
        assert!(err.to_string().contains("Get cluster failed"));
    }

    #[tokio::test]
    async fn test_create_cluster() {
        let mut jm = MockClusterComponent::new();
        jm.expect_create_if_not_exist().times(1).returning(|_| Ok(()));
        let mut tm = MockClusterComponent::new();
        tm.expect_create_if_not_exist().times(1).returning(|_| Ok(()));

        let controller = controller_with(MockK8sCluster::new(), MockFlinkApi::new(), jm, tm);
        controller.create_cluster(&test_app()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_cluster_job_manager_error() {
        let mut jm = MockClusterComponent::new();
        jm.expect_create_if_not_exist()
            .times(1)
            .returning(|_| Err(Error::Validation("jm create error".to_string())));
        let mut tm = MockClusterComponent::new();
        tm.expect_create_if_not_exist().times(0);

        let controller = controller_with(MockK8sCluster::new(), MockFlinkApi::new(), jm, tm);
        let err = controller.create_cluster(&test_app()).await.unwrap_err();
        assert!(err.to_string().contains("jm create error"));
    }

    #[tokio::test]
    async fn test_create_cluster_task_manager_error() {
        let mut jm = MockClusterComponent::new();
        jm.expect_create_if_not_exist().times(1).returning(|_| Ok(()));
        let mut tm = MockClusterComponent::new();
        tm.expect_create_if_not_exist()
            .times(1)
            .returning(|_| Err(Error::Validation("tm create error".to_string())));

        let controller = controller_with(MockK8sCluster::new(), MockFlinkApi::new(), jm, tm);
        let err = controller.create_cluster(&test_app()).await.unwrap_err();
        assert!(err.to_string().contains("tm create error"));
    }

    #[tokio::test]
    async fn test_delete_old_cluster() {
        let app = test_app();
        let hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![
            live_deployment(&app, JOB_MANAGER, &hash, 1),
            live_deployment(&app, TASK_MANAGER, &hash, 1),
            live_deployment(&app, JOB_MANAGER, "0ld0ld00", 1),
            live_deployment(&app, TASK_MANAGER, "0ld0ld00", 1),
        ];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));
        k8s.expect_delete_deployments()
            .withf(|deployments| {
                deployments.len() == 2
                    && deployments
                        .iter()
                        .all(|d| deployment_hash(d) == Some("0ld0ld00"))
            })
            .times(1)
            .returning(|_| Ok(()));

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.delete_old_cluster(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_old_cluster_nothing_stale() {
        let app = test_app();
        let hash = task_manager_fingerprint(&app).unwrap();
        let live = vec![live_deployment(&app, TASK_MANAGER, &hash, 1)];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));
        k8s.expect_delete_deployments().times(0);

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.delete_old_cluster(&app).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_old_cluster_empty() {
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(|_, _| Ok(vec![]));
        k8s.expect_delete_deployments().times(0);

        let controller = controller(k8s, MockFlinkApi::new());
        assert!(controller.delete_old_cluster(&test_app()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_old_cluster_delete_error() {
        let app = test_app();
        let live = vec![live_deployment(&app, TASK_MANAGER, "0ld0ld00", 1)];
        let mut k8s = MockK8sCluster::new();
        k8s.expect_get_deployments_with_label()
            .returning(move |_, _| Ok(live.clone()));
        k8s.expect_delete_deployments()
            .times(1)
            .returning(|_| Err(Error::Validation("Delete error".to_string())));

        let controller = controller(k8s, MockFlinkApi::new());
        let err = controller.delete_old_cluster(&app).await.unwrap_err();
        assert!(err.to_string().contains("Delete error"));
    }

    // ------------------------------------------------------------------------
    // Job lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_get_active_job_running() {
        let mut flink = MockFlinkApi::new();
        flink.expect_get_jobs().withf(|url| url == URL).returning(|_| {
            Ok(vec![
                FlinkJob::new("old", JobState::Canceled),
                FlinkJob::new(JOB_ID, JobState::Running),
            ])
        });

        let controller = controller(MockK8sCluster::new(), flink);
        let job = controller.get_active_job(&test_app()).await.unwrap().unwrap();
        assert_eq!(job.job_id, JOB_ID);
    }

    #[tokio::test]
    async fn test_get_active_job_cancelling() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_jobs()
            .returning(|_| Ok(vec![FlinkJob::new(JOB_ID, JobState::Cancelling)]));

        let controller = controller(MockK8sCluster::new(), flink);
        assert!(controller.get_active_job(&test_app()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_active_job_empty() {
        let mut flink = MockFlinkApi::new();
        flink.expect_get_jobs().returning(|_| Ok(vec![]));

        let controller = controller(MockK8sCluster::new(), flink);
        assert!(controller.get_active_job(&test_app()).await.unwrap().is_none());
    }

    #[test]
    fn test_select_active_job_ambiguous() {
        let jobs = vec![
            FlinkJob::new("j1", JobState::Running),
            FlinkJob::new("j2", JobState::Restarting),
        ];
        match select_active_job(&jobs) {
            Err(Error::AmbiguousActiveJob(ids)) => assert_eq!(ids, vec!["j1", "j2"]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_jobs_for_application() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_jobs()
            .returning(|_| Ok(vec![FlinkJob::new(JOB_ID, JobState::Running)]));

        let controller = controller(MockK8sCluster::new(), flink);
        let jobs = controller.get_jobs_for_application(&test_app()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, JOB_ID);
    }

    #[tokio::test]
    async fn test_start_flink_job() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_submit_job()
            .withf(|url, jar, request| {
                url == URL
                    && jar == "job.jar"
                    && request.parallelism == 8
                    && request.entry_class == "org.example.Main"
                    && request.program_args == "--input s3://in"
                    && request.savepoint_path.as_deref() == Some("s3://sp/1")
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(SubmitJobResponse {
                    job_id: JOB_ID.to_string(),
                })
            });

        let controller = controller(MockK8sCluster::new(), flink);
        let job_id = controller
            .start_flink_job(&test_app(), Some("s3://sp/1".to_string()))
            .await
            .unwrap();
        assert_eq!(job_id, JOB_ID);
    }

    #[tokio::test]
    async fn test_start_flink_job_empty_job_id() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_submit_job()
            .returning(|_, _, _| Ok(SubmitJobResponse::default()));

        let controller = controller(MockK8sCluster::new(), flink);
        let err = controller.start_flink_job(&test_app(), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidJobId));
        assert_eq!(err.to_string(), "unable to submit job: invalid job id");
    }

    #[tokio::test]
    async fn test_start_flink_job_err() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_submit_job()
            .returning(|_, _, _| Err(api_error("submit error")));

        let controller = controller(MockK8sCluster::new(), flink);
        let err = controller.start_flink_job(&test_app(), None).await.unwrap_err();
        assert_eq!(err.to_string(), api_error("submit error").to_string());
    }

    #[tokio::test]
    async fn test_cancel_with_savepoint() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_cancel_job_with_savepoint()
            .withf(|url, job_id| url == URL && job_id == JOB_ID)
            .returning(|_, _| Ok("t1".to_string()));

        let controller = controller(MockK8sCluster::new(), flink);
        let trigger = controller
            .cancel_with_savepoint(&test_app(), JOB_ID)
            .await
            .unwrap();
        assert_eq!(trigger, "t1");
    }

    #[tokio::test]
    async fn test_cancel_with_savepoint_err() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_cancel_job_with_savepoint()
            .returning(|_, _| Err(api_error("cancel error")));

        let controller = controller(MockK8sCluster::new(), flink);
        let err = controller
            .cancel_with_savepoint(&test_app(), JOB_ID)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancel error"));
    }

    #[tokio::test]
    async fn test_get_savepoint_status() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_check_savepoint_status()
            .withf(|url, job_id, trigger| url == URL && job_id == JOB_ID && trigger == "t1")
            .returning(|_, _, _| {
                Ok(SavepointStatus::Completed {
                    location: "s3://sp/1".to_string(),
                })
            });

        let controller = controller(MockK8sCluster::new(), flink);
        let status = controller
            .get_savepoint_status(&test_app(), JOB_ID, "t1")
            .await
            .unwrap();
        assert_eq!(
            status,
            SavepointStatus::Completed {
                location: "s3://sp/1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_get_savepoint_status_err() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_check_savepoint_status()
            .returning(|_, _, _| Err(api_error("Savepoint error")));

        let controller = controller(MockK8sCluster::new(), flink);
        let err = controller
            .get_savepoint_status(&test_app(), JOB_ID, "t1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Savepoint error"));
    }

    #[tokio::test]
    async fn test_find_externalized_checkpoint() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_latest_checkpoint()
            .withf(|url, job_id| url == URL && job_id == JOB_ID)
            .returning(|_, _| {
                Ok(Some(CheckpointStatistics {
                    trigger_timestamp: 1_550_000_000_000,
                    external_path: "/tmp/checkpoint".to_string(),
                    ..Default::default()
                }))
            });

        let controller = controller(MockK8sCluster::new(), flink);
        let path = controller
            .find_externalized_checkpoint(&test_app(), JOB_ID)
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Some("/tmp/checkpoint"));
    }

    #[tokio::test]
    async fn test_find_externalized_checkpoint_none() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_latest_checkpoint()
            .returning(|_, _| Ok(None));

        let controller = controller(MockK8sCluster::new(), flink);
        let path = controller
            .find_externalized_checkpoint(&test_app(), JOB_ID)
            .await
            .unwrap();
        assert!(path.is_none());
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    fn overview(task_managers: i32) -> ClusterOverviewResponse {
        ClusterOverviewResponse {
            task_manager_count: task_managers,
            number_of_task_slots: 1,
            slots_available: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_cluster_status_healthy() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_cluster_overview()
            .returning(|_| Ok(overview(1)));
        flink.expect_get_task_managers().returning(|_| {
            Ok(vec![TaskManagerStats {
                time_since_last_heartbeat: jiff::Timestamp::now().as_millisecond(),
                slots_number: 1,
                free_slots: 0,
                ..Default::default()
            }])
        });

        let controller = controller(MockK8sCluster::new(), flink);
        let status = controller.get_cluster_status(&test_app()).await.unwrap();
        assert_eq!(status.healthy_task_managers, 1);
        assert_eq!(status.number_of_task_slots, 1);
        assert_eq!(status.available_task_slots, 0);
        assert_eq!(status.health, ClusterHealth::Green);
    }

    #[tokio::test]
    async fn test_get_cluster_status_stale_heartbeat() {
        let day_ms = 24 * 60 * 60 * 1000;
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_cluster_overview()
            .returning(|_| Ok(overview(1)));
        flink.expect_get_task_managers().returning(move |_| {
            Ok(vec![TaskManagerStats {
                time_since_last_heartbeat: jiff::Timestamp::now().as_millisecond() - day_ms,
                slots_number: 1,
                free_slots: 0,
                ..Default::default()
            }])
        });

        let controller = controller(MockK8sCluster::new(), flink);
        let status = controller.get_cluster_status(&test_app()).await.unwrap();
        assert_eq!(status.healthy_task_managers, 0);
        assert_eq!(status.number_of_task_managers, 1);
        assert_eq!(status.number_of_task_slots, 1);
        assert_eq!(status.available_task_slots, 0);
        assert_eq!(status.health, ClusterHealth::Red);
    }

    #[tokio::test]
    async fn test_get_cluster_status_overview_error() {
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_cluster_overview()
            .returning(|_| Err(api_error("overview error")));
        flink.expect_get_task_managers().times(0);

        let controller = controller(MockK8sCluster::new(), flink);
        assert!(controller.get_cluster_status(&test_app()).await.is_err());
    }

    #[test]
    fn test_aggregate_partial_health() {
        let now = 1_000_000_000;
        let tms = vec![
            TaskManagerStats {
                time_since_last_heartbeat: now - 1_000,
                ..Default::default()
            },
            TaskManagerStats {
                time_since_last_heartbeat: now - 120_000,
                ..Default::default()
            },
        ];
        let status = aggregate_cluster_health(&overview(2), &tms, now, Duration::from_secs(30));
        assert_eq!(status.healthy_task_managers, 1);
        assert_eq!(status.health, ClusterHealth::Yellow);
    }

    #[test]
    fn test_health_verdict() {
        assert_eq!(health_verdict(1, 1), ClusterHealth::Green);
        assert_eq!(health_verdict(2, 3), ClusterHealth::Yellow);
        assert_eq!(health_verdict(0, 3), ClusterHealth::Red);
        assert_eq!(health_verdict(0, 0), ClusterHealth::Red);
        // healthy reports without a registered count are still Red
        assert_eq!(health_verdict(1, 0), ClusterHealth::Red);
    }
}
