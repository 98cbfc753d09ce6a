//! Phase handlers for FlinkApplication reconciliation.
//!
//! Each handler runs the step for one phase against the cluster and the job
//! manager, records what it learned in the status, and reports the event
//! that should move the application forward. Handlers are idempotent: any of
//! them may run again after a crash between its external call and the status
//! write.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use super::flink::FlinkController;
use super::state_machine::{
    ApplicationEvent, ApplicationStateMachine, TransitionContext, TransitionResult,
};
use super::validation::validate_spec;
use crate::client::SavepointStatus;
use crate::crd::{ApplicationPhase, FlinkApplication, FlinkApplicationStatus};
use crate::resources::task_manager_fingerprint;

/// Result of a phase handler execution.
#[derive(Debug, Default)]
pub struct PhaseResult {
    /// Event to apply, `None` to stay in the current phase.
    pub event: Option<ApplicationEvent>,
    /// Optional message describing what happened.
    pub message: Option<String>,
    /// Cluster pods are running and the job manager answers.
    pub cluster_ready: bool,
}

impl PhaseResult {
    /// Stay in the current phase.
    pub fn wait(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Apply `event`.
    pub fn new(event: ApplicationEvent) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }

    /// Apply `event` with a message.
    pub fn with_message(event: ApplicationEvent, message: impl Into<String>) -> Self {
        Self {
            event: Some(event),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

impl From<ApplicationEvent> for PhaseResult {
    fn from(event: ApplicationEvent) -> Self {
        Self::new(event)
    }
}

/// What one reconciliation step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub from: ApplicationPhase,
    pub to: ApplicationPhase,
    pub event: Option<ApplicationEvent>,
    pub message: Option<String>,
}

impl StepOutcome {
    pub fn transitioned(&self) -> bool {
        self.from != self.to
    }
}

// ============================================================================
// Step driver
// ============================================================================

/// Run the handler for the current phase and apply its event.
///
/// Retryable errors are returned unchanged and leave the status as the
/// handler left it. Non-retryable errors move the application to `Failed`
/// and record the reason.
pub async fn advance(
    flink: &FlinkController,
    sm: &ApplicationStateMachine,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<StepOutcome> {
    let from = status.phase;

    let result = match from {
        ApplicationPhase::Failed | ApplicationPhase::Deleting => {
            run_phase(flink, app, status).await
        }
        _ => match validate_spec(app) {
            Ok(()) => run_phase(flink, app, status).await,
            Err(e) => Err(e),
        },
    };

    let result = match result {
        Ok(result) => result,
        Err(e) if !e.is_retryable() => {
            let message = e.to_string();
            status.failure_reason = Some(message.clone());
            let ctx = transition_context(app, status, false).with_error(message.clone());
            apply_event(sm, status, ApplicationEvent::ReconcileError, &ctx);
            return Ok(StepOutcome {
                from,
                to: status.phase,
                event: Some(ApplicationEvent::ReconcileError),
                message: Some(message),
            });
        }
        Err(e) => return Err(e),
    };

    if let Some(event) = result.event {
        let ctx = transition_context(app, status, result.cluster_ready);
        apply_event(sm, status, event, &ctx);
    }

    Ok(StepOutcome {
        from,
        to: status.phase,
        event: result.event,
        message: result.message,
    })
}

fn transition_context(
    app: &FlinkApplication,
    status: &FlinkApplicationStatus,
    cluster_ready: bool,
) -> TransitionContext {
    TransitionContext::new(app.spec.savepoint_info.savepoint_on_update)
        .with_cluster_ready(cluster_ready)
        .with_job_id(status.job_id.clone())
}

/// Apply `event` to `status.phase`. Invalid or guarded transitions keep the phase.
pub fn apply_event(
    sm: &ApplicationStateMachine,
    status: &mut FlinkApplicationStatus,
    event: ApplicationEvent,
    ctx: &TransitionContext,
) -> bool {
    match sm.transition(&status.phase, event, ctx) {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } => {
            if from != to {
                info!(%from, %to, %event, "{}", description);
            }
            status.phase = to;
            true
        }
        TransitionResult::InvalidTransition { current, event } => {
            warn!(phase = %current, %event, "Ignoring invalid transition");
            false
        }
        TransitionResult::GuardFailed {
            from, to, reason, ..
        } => {
            warn!(%from, %to, %event, %reason, "Transition guard failed");
            false
        }
    }
}

/// Dispatch to the handler of the current phase.
pub async fn run_phase(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    match status.phase {
        ApplicationPhase::New => handle_new(flink, app, status).await,
        ApplicationPhase::ClusterStarting => handle_cluster_starting(flink, app, status).await,
        ApplicationPhase::Submitting => handle_submitting(flink, app, status).await,
        ApplicationPhase::DeletingOldCluster => {
            handle_deleting_old_cluster(flink, app, status).await
        }
        ApplicationPhase::Running => handle_running(flink, app, status).await,
        ApplicationPhase::Savepointing => handle_savepointing(flink, app, status).await,
        ApplicationPhase::SavepointInProgress => {
            handle_savepoint_in_progress(flink, app, status).await
        }
        ApplicationPhase::SavepointComplete => Ok(PhaseResult::new(
            ApplicationEvent::CancelRequested,
        )),
        ApplicationPhase::Cancelling => handle_cancelling(flink, app, status).await,
        ApplicationPhase::Cancelled => handle_cancelled(flink, app, status).await,
        ApplicationPhase::Failed => Ok(PhaseResult::wait(
            status
                .failure_reason
                .clone()
                .unwrap_or_else(|| "Waiting for a spec update".to_string()),
        )),
        ApplicationPhase::Deleting => Ok(PhaseResult::default()),
    }
}

// ============================================================================
// Phase handlers
// ============================================================================

/// New: remove stale generations and create the desired one.
pub async fn handle_new(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    // Restarting after a failure: keep whatever state the old job left behind.
    if let (Some(job_id), None) = (status.job_id.clone(), &status.savepoint_location) {
        match flink.find_externalized_checkpoint(app, &job_id).await {
            Ok(path) => status.savepoint_location = path,
            Err(e) => warn!(%job_id, error = %e, "Could not look up checkpoint of previous job"),
        }
    }
    // savepointInfo.savepointLocation only seeds a fresh deploy
    if status.savepoint_location.is_none() {
        status
            .savepoint_location
            .clone_from(&app.spec.savepoint_info.savepoint_location);
    }

    if flink.has_application_changed(app).await? {
        flink.delete_old_cluster(app).await?;
    }
    flink.create_cluster(app).await?;

    let hash = task_manager_fingerprint(app)?;
    status.deploy_hash = Some(hash.clone());
    status.job_id = None;
    status.savepoint_trigger_id = None;
    status.failure_reason = None;
    Ok(PhaseResult::with_message(
        ApplicationEvent::ClusterCreated,
        format!("Created cluster {hash}"),
    ))
}

/// ClusterStarting: wait for pods and the job manager of the desired generation.
pub async fn handle_cluster_starting(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    let desired = task_manager_fingerprint(app)?;
    if status.deploy_hash.as_deref() != Some(desired.as_str()) {
        flink.create_cluster(app).await?;
        status.deploy_hash = Some(desired.clone());
        return Ok(PhaseResult::with_message(
            ApplicationEvent::SpecChanged,
            format!("Created cluster {desired}"),
        ));
    }

    if !flink.is_cluster_ready(app).await? {
        return Ok(PhaseResult::wait("Waiting for cluster pods"));
    }
    if let Err(e) = flink.is_service_ready(app).await {
        debug!(error = %e, "Job manager not reachable yet");
        return Ok(PhaseResult::wait("Waiting for job manager"));
    }

    Ok(PhaseResult {
        cluster_ready: true,
        ..PhaseResult::with_message(ApplicationEvent::ClusterReady, "Cluster is ready")
    })
}

/// Submitting: adopt an already running job or submit a new one.
pub async fn handle_submitting(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    let desired = task_manager_fingerprint(app)?;
    if status.deploy_hash.as_deref() != Some(desired.as_str()) {
        return Ok(PhaseResult::new(ApplicationEvent::SpecChanged));
    }

    if let Some(job) = flink.get_active_job(app).await? {
        info!(job_id = %job.job_id, "Adopting running job");
        status.job_id = Some(job.job_id);
        return Ok(PhaseResult::with_message(
            ApplicationEvent::JobSubmitted,
            "Adopted running job",
        ));
    }

    let restore = status.savepoint_location.clone();
    let job_id = flink.start_flink_job(app, restore.clone()).await?;
    status.job_id = Some(job_id.clone());
    // a restore source is used by one submission only
    status.savepoint_location = None;
    let message = match restore {
        Some(path) => format!("Submitted job {job_id} from {path}"),
        None => format!("Submitted job {job_id}"),
    };
    Ok(PhaseResult::with_message(ApplicationEvent::JobSubmitted, message))
}

/// DeletingOldCluster: remove every generation but the one the job runs on.
pub async fn handle_deleting_old_cluster(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    let desired = task_manager_fingerprint(app)?;
    if status.deploy_hash.as_deref() != Some(desired.as_str()) {
        // the job runs on deploy_hash, deleting by the new fingerprint would remove it
        return Ok(PhaseResult::new(ApplicationEvent::SpecChanged));
    }

    flink.delete_old_cluster(app).await?;
    Ok(PhaseResult::with_message(
        ApplicationEvent::OldClusterDeleted,
        "Old cluster deleted",
    ))
}

/// Running: refresh health, then watch for spec changes and lost jobs.
pub async fn handle_running(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    status.cluster_status = match flink.get_cluster_status(app).await {
        Ok(cluster_status) => Some(cluster_status),
        Err(e) => {
            warn!(error = %e, "Failed to read cluster health");
            None
        }
    };

    let desired = task_manager_fingerprint(app)?;
    if status.deploy_hash.as_deref() != Some(desired.as_str()) {
        return start_migration(flink, app, status).await;
    }
    // same fingerprint, so only the replica count can differ
    flink.restore_task_manager_replicas(app).await?;

    let Some(job_id) = status.job_id.clone() else {
        return Ok(PhaseResult::with_message(
            ApplicationEvent::JobLost,
            "No job recorded",
        ));
    };

    match flink.get_active_job(app).await? {
        Some(job) if job.job_id == job_id => Ok(PhaseResult::default()),
        Some(job) => {
            warn!(recorded = %job_id, active = %job.job_id, "Active job differs from status");
            status.job_id = Some(job.job_id);
            Ok(PhaseResult::default())
        }
        None => {
            status.savepoint_location = flink.find_externalized_checkpoint(app, &job_id).await?;
            status.job_id = None;
            Ok(PhaseResult::with_message(
                ApplicationEvent::JobLost,
                format!("Job {job_id} is no longer running"),
            ))
        }
    }
}

async fn start_migration(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    let Some(job_id) = status.job_id.clone() else {
        return Ok(PhaseResult::with_message(
            ApplicationEvent::JobLost,
            "No job recorded",
        ));
    };

    if app.spec.savepoint_info.savepoint_on_update {
        return Ok(PhaseResult::with_message(
            ApplicationEvent::SpecChanged,
            "Spec changed, savepointing job",
        ));
    }

    status.savepoint_location = flink.find_externalized_checkpoint(app, &job_id).await?;
    Ok(PhaseResult::with_message(
        ApplicationEvent::CancelRequested,
        "Spec changed, cancelling job",
    ))
}

/// Savepointing: request cancel-with-savepoint once and record the trigger.
pub async fn handle_savepointing(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    if status.savepoint_trigger_id.is_some() {
        return Ok(PhaseResult::new(ApplicationEvent::SavepointTriggered));
    }
    let job_id = status
        .job_id
        .clone()
        .ok_or_else(|| Error::MissingField("status.jobId".to_string()))?;

    let jobs = flink.get_jobs_for_application(app).await?;
    let recorded_active = jobs
        .iter()
        .any(|j| j.job_id == job_id && j.status.is_active());
    if !recorded_active {
        status.savepoint_location = flink.find_externalized_checkpoint(app, &job_id).await?;
        return Ok(PhaseResult::with_message(
            ApplicationEvent::SavepointFailed,
            format!("Job {job_id} stopped before the savepoint was taken"),
        ));
    }

    let trigger_id = flink.cancel_with_savepoint(app, &job_id).await?;
    status.savepoint_trigger_id = Some(trigger_id.clone());
    Ok(PhaseResult::with_message(
        ApplicationEvent::SavepointTriggered,
        format!("Savepoint triggered ({trigger_id})"),
    ))
}

/// SavepointInProgress: poll the trigger once.
pub async fn handle_savepoint_in_progress(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    let job_id = status
        .job_id
        .clone()
        .ok_or_else(|| Error::MissingField("status.jobId".to_string()))?;
    let trigger_id = status
        .savepoint_trigger_id
        .clone()
        .ok_or_else(|| Error::MissingField("status.savepointTriggerId".to_string()))?;

    match flink.get_savepoint_status(app, &job_id, &trigger_id).await? {
        SavepointStatus::InProgress => Ok(PhaseResult::wait("Savepoint in progress")),
        SavepointStatus::Completed { location } => {
            status.savepoint_location = Some(location.clone());
            status.savepoint_trigger_id = None;
            Ok(PhaseResult::with_message(
                ApplicationEvent::SavepointCompleted,
                format!("Savepoint stored at {location}"),
            ))
        }
        SavepointStatus::Failed { cause } => {
            warn!(%job_id, %trigger_id, %cause, "Savepoint failed");
            status.savepoint_location = flink.find_externalized_checkpoint(app, &job_id).await?;
            status.savepoint_trigger_id = None;
            Ok(PhaseResult::with_message(
                ApplicationEvent::SavepointFailed,
                format!("Savepoint failed: {cause}"),
            ))
        }
    }
}

/// Cancelling: wait until no active job remains, cancelling any that run.
pub async fn handle_cancelling(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    let active: Vec<String> = flink
        .get_jobs_for_application(app)
        .await?
        .into_iter()
        .filter(|j| j.status.is_active())
        .map(|j| j.job_id)
        .collect();

    if active.is_empty() {
        status.job_id = None;
        return Ok(PhaseResult::with_message(
            ApplicationEvent::JobCancelled,
            "Job cancelled",
        ));
    }
    // every active job goes, including strays the old cluster picked up
    for job_id in &active {
        flink.cancel_job(app, job_id).await?;
    }
    Ok(PhaseResult::wait(format!(
        "Waiting for jobs {} to cancel",
        active.join(", ")
    )))
}

/// Cancelled: bring up the next generation.
pub async fn handle_cancelled(
    flink: &FlinkController,
    app: &FlinkApplication,
    status: &mut FlinkApplicationStatus,
) -> Result<PhaseResult> {
    flink.create_cluster(app).await?;
    let hash = task_manager_fingerprint(app)?;
    status.deploy_hash = Some(hash.clone());
    debug!(name = %app.name_any(), %hash, "Next generation created");
    Ok(PhaseResult::with_message(
        ApplicationEvent::ClusterCreated,
        format!("Created cluster {hash}"),
    ))
}

/// Best-effort cancellation of the application's job before deletion.
pub async fn cleanup(flink: &FlinkController, app: &FlinkApplication) {
    let Some(job_id) = app.status.as_ref().and_then(|s| s.job_id.clone()) else {
        return;
    };
    if let Err(e) = flink.cancel_job(app, &job_id).await {
        warn!(%job_id, error = %e, "Failed to cancel job during deletion");
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
    use std::sync::Arc;

    use kube::api::ObjectMeta;

    use super::*;
    use crate::client::{FlinkClientError, FlinkJob, JobState, MockFlinkApi, SubmitJobResponse};
    use crate::config::ControllerConfig;
    use crate::controller::k8s::MockK8sCluster;
    use crate::crd::FlinkApplicationSpec;
    use crate::resources::MockClusterComponent;

    fn test_app() -> FlinkApplication {
        FlinkApplication {
            metadata: ObjectMeta {
                name: Some("app-name".to_string()),
                namespace: Some("ns".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: FlinkApplicationSpec {
                image: "flink:1.7".to_string(),
                jar_name: "job.jar".to_string(),
                parallelism: 8,
                ..Default::default()
            },
            status: None,
        }
    }

    fn controller(flink: MockFlinkApi) -> FlinkController {
        FlinkController::with_components(
            Arc::new(MockK8sCluster::new()),
            Arc::new(flink),
            Arc::new(MockClusterComponent::new()),
            Arc::new(MockClusterComponent::new()),
            &ControllerConfig::default(),
        )
    }

    fn status_on_current_cluster(app: &FlinkApplication, phase: ApplicationPhase) -> FlinkApplicationStatus {
        FlinkApplicationStatus {
            phase,
            deploy_hash: Some(task_manager_fingerprint(app).unwrap()),
            job_id: Some("j1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submitting_adopts_active_job() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_jobs()
            .returning(|_| Ok(vec![FlinkJob::new("j9", JobState::Running)]));
        flink.expect_submit_job().times(0);

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Submitting);
        status.job_id = None;
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert_eq!(outcome.to, ApplicationPhase::DeletingOldCluster);
        assert_eq!(status.job_id.as_deref(), Some("j9"));
    }

    #[tokio::test]
    async fn test_submitting_restores_from_status_savepoint() {
        let mut app = test_app();
        app.spec.savepoint_info.savepoint_location = Some("s3://spec".to_string());
        let mut flink = MockFlinkApi::new();
        flink.expect_get_jobs().returning(|_| Ok(vec![]));
        flink
            .expect_submit_job()
            .withf(|_, _, request| request.savepoint_path.as_deref() == Some("s3://sp/2"))
            .times(1)
            .returning(|_, _, _| {
                Ok(SubmitJobResponse {
                    job_id: "j2".to_string(),
                })
            });

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Submitting);
        status.job_id = None;
        status.savepoint_location = Some("s3://sp/2".to_string());
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert_eq!(outcome.event, Some(ApplicationEvent::JobSubmitted));
        assert_eq!(status.job_id.as_deref(), Some("j2"));
        assert!(status.savepoint_location.is_none());
    }

    #[tokio::test]
    async fn test_submitting_ignores_spec_restore_path_after_fresh_deploy() {
        let mut app = test_app();
        app.spec.savepoint_info.savepoint_location = Some("s3://spec".to_string());
        let mut flink = MockFlinkApi::new();
        flink.expect_get_jobs().returning(|_| Ok(vec![]));
        flink
            .expect_submit_job()
            .withf(|_, _, request| request.savepoint_path.is_none())
            .times(1)
            .returning(|_, _, _| {
                Ok(SubmitJobResponse {
                    job_id: "j3".to_string(),
                })
            });

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Submitting);
        status.job_id = None;
        advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();
        assert_eq!(status.job_id.as_deref(), Some("j3"));
    }

    #[tokio::test]
    async fn test_submitting_empty_job_id_is_retried() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink.expect_get_jobs().returning(|_| Ok(vec![]));
        flink
            .expect_submit_job()
            .returning(|_, _, _| Ok(SubmitJobResponse::default()));

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Submitting);
        status.job_id = None;
        let err = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::InvalidJobId));
        assert_eq!(status.phase, ApplicationPhase::Submitting);
        assert!(status.job_id.is_none());
    }

    #[tokio::test]
    async fn test_savepointing_reuses_trigger() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink.expect_cancel_job_with_savepoint().times(0);

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Savepointing);
        status.savepoint_trigger_id = Some("t1".to_string());
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert_eq!(outcome.to, ApplicationPhase::SavepointInProgress);
    }

    #[tokio::test]
    async fn test_savepointing_triggers_once() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_jobs()
            .returning(|_| Ok(vec![FlinkJob::new("j1", JobState::Running)]));
        flink
            .expect_cancel_job_with_savepoint()
            .times(1)
            .returning(|_, _| Ok("t1".to_string()));

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Savepointing);
        advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert_eq!(status.phase, ApplicationPhase::SavepointInProgress);
        assert_eq!(status.savepoint_trigger_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_savepoint_in_progress_waits() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink
            .expect_check_savepoint_status()
            .returning(|_, _, _| Ok(SavepointStatus::InProgress));

        let mut status = status_on_current_cluster(&app, ApplicationPhase::SavepointInProgress);
        status.savepoint_trigger_id = Some("t1".to_string());
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert!(!outcome.transitioned());
        assert_eq!(status.savepoint_trigger_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_savepoint_failure_falls_back_to_checkpoint() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink.expect_check_savepoint_status().returning(|_, _, _| {
            Ok(SavepointStatus::Failed {
                cause: "timeout".to_string(),
            })
        });
        flink.expect_get_latest_checkpoint().returning(|_, _| {
            Ok(Some(crate::client::CheckpointStatistics {
                external_path: "s3://cp/7".to_string(),
                ..Default::default()
            }))
        });

        let mut status = status_on_current_cluster(&app, ApplicationPhase::SavepointInProgress);
        status.savepoint_trigger_id = Some("t1".to_string());
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert_eq!(outcome.to, ApplicationPhase::Cancelling);
        assert_eq!(status.savepoint_location.as_deref(), Some("s3://cp/7"));
        assert!(status.savepoint_trigger_id.is_none());
    }

    #[tokio::test]
    async fn test_cancelling_cancels_remaining_job() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_jobs()
            .returning(|_| Ok(vec![FlinkJob::new("j1", JobState::Running)]));
        flink
            .expect_cancel_job()
            .withf(|_, job_id| job_id == "j1")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Cancelling);
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();
        assert_eq!(outcome.to, ApplicationPhase::Cancelling);
    }

    #[tokio::test]
    async fn test_cancelling_cancels_every_active_job() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink.expect_get_jobs().returning(|_| {
            Ok(vec![
                FlinkJob::new("j1", JobState::Running),
                FlinkJob::new("j7", JobState::Restarting),
                FlinkJob::new("j0", JobState::Canceled),
            ])
        });
        flink
            .expect_cancel_job()
            .withf(|_, job_id| job_id == "j1" || job_id == "j7")
            .times(2)
            .returning(|_, _| Ok(()));

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Cancelling);
        let outcome = advance(
            &controller(flink),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();
        assert!(!outcome.transitioned());
    }

    #[tokio::test]
    async fn test_running_job_lost_recovers_from_checkpoint() {
        let app = test_app();
        let mut flink = MockFlinkApi::new();
        flink
            .expect_get_cluster_overview()
            .returning(|_| Err(FlinkClientError::Decode("bad".to_string())));
        flink
            .expect_get_jobs()
            .returning(|_| Ok(vec![FlinkJob::new("j1", JobState::Failed)]));
        flink.expect_get_latest_checkpoint().returning(|_, _| {
            Ok(Some(crate::client::CheckpointStatistics {
                external_path: "s3://cp/3".to_string(),
                ..Default::default()
            }))
        });
        let mut k8s = MockK8sCluster::new();
        let app_for_live = app.clone();
        k8s.expect_get_deployments_with_label().returning(move |_, _| {
            Ok(vec![
                crate::resources::task_manager::generate_task_manager_deployment(&app_for_live)
                    .unwrap(),
            ])
        });
        let controller = FlinkController::with_components(
            Arc::new(k8s),
            Arc::new(flink),
            Arc::new(MockClusterComponent::new()),
            Arc::new(MockClusterComponent::new()),
            &ControllerConfig::default(),
        );

        let mut status = status_on_current_cluster(&app, ApplicationPhase::Running);
        let outcome = advance(&controller, &ApplicationStateMachine::new(), &app, &mut status)
            .await
            .unwrap();

        assert_eq!(outcome.to, ApplicationPhase::Submitting);
        assert!(status.job_id.is_none());
        assert_eq!(status.savepoint_location.as_deref(), Some("s3://cp/3"));
        assert!(status.cluster_status.is_none());
    }

    #[tokio::test]
    async fn test_invalid_spec_fails() {
        let mut app = test_app();
        app.spec.parallelism = 0;

        let mut status = FlinkApplicationStatus::default();
        let outcome = advance(
            &controller(MockFlinkApi::new()),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();

        assert_eq!(outcome.to, ApplicationPhase::Failed);
        assert_eq!(outcome.event, Some(ApplicationEvent::ReconcileError));
        assert!(status.failure_reason.unwrap().contains("parallelism"));
    }

    #[tokio::test]
    async fn test_failed_stays_failed() {
        let app = test_app();
        let mut status = FlinkApplicationStatus {
            phase: ApplicationPhase::Failed,
            failure_reason: Some("boom".to_string()),
            ..Default::default()
        };
        let outcome = advance(
            &controller(MockFlinkApi::new()),
            &ApplicationStateMachine::new(),
            &app,
            &mut status,
        )
        .await
        .unwrap();
        assert_eq!(outcome.to, ApplicationPhase::Failed);
        assert_eq!(outcome.message.as_deref(), Some("boom"));
    }
}
