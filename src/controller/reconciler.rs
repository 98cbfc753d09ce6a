//! Reconciliation loop for FlinkApplication.
//!
//! Each cycle runs one phase step, then writes the resulting status with a
//! merge patch. The persisted phase is the only memory between cycles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, instrument, warn};

use super::context::{Context, FIELD_MANAGER};
use super::error::Error;
use super::phases::{self, StepOutcome};
use super::state_machine::{ApplicationEvent, TransitionContext, determine_event};
use super::status::conditions_for;
use super::validation::generation_changed;
use crate::config::ControllerConfig;
use crate::crd::{ApplicationPhase, FlinkApplication, FlinkApplicationStatus};

/// Finalizer name for graceful deletion
pub const FINALIZER: &str = "flink.k8s.io/finalizer";

/// Requeue interval for applications in `Failed`
const FAILED_REQUEUE: Duration = Duration::from_secs(300);

/// Reconcile a FlinkApplication
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = ?obj.namespace()))]
pub async fn reconcile(obj: Arc<FlinkApplication>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<FlinkApplication> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &api).await;
    }

    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!("Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut status = obj.status.clone().unwrap_or_default();

    // A failed application restarts once a new generation arrives.
    if let Some(event) = determine_event(&status.phase, false, generation_changed(&obj)) {
        let ctx_t = TransitionContext::new(obj.spec.savepoint_info.savepoint_on_update);
        if phases::apply_event(&ctx.state_machine, &mut status, event, &ctx_t)
            && event == ApplicationEvent::RecoveryInitiated
        {
            status.failure_reason = None;
            ctx.publish_normal_event(
                &obj,
                "Recovering",
                "Reconciling",
                Some("New spec generation after failure".to_string()),
            )
            .await;
        }
    }

    let step = phases::advance(&ctx.flink, &ctx.state_machine, &obj, &mut status).await;
    let outcome = match step {
        Ok(outcome) => outcome,
        Err(e) => {
            // keep what the handler learned before failing, e.g. a submitted job id
            if has_unsaved_status(&obj, &status) {
                if let Err(patch_err) = patch_status(&api, &obj, status).await {
                    warn!(error = %patch_err, "Failed to persist partial status");
                }
            }
            if matches!(e, Error::AmbiguousActiveJob(_)) {
                ctx.publish_warning_event(&obj, "AmbiguousActiveJob", "Reconciling", Some(e.to_string()))
                    .await;
            }
            return Err(e);
        }
    };

    debug!(
        from = %outcome.from,
        to = %outcome.to,
        message = outcome.message.as_deref().unwrap_or(""),
        "Phase step complete"
    );
    publish_outcome(&obj, &ctx, &outcome).await;

    let next_phase = status.phase;
    let cluster_status = status.cluster_status.clone();
    patch_status(&api, &obj, status).await?;

    if let Some(ref health_state) = ctx.health_state {
        let metrics = &health_state.metrics;
        metrics.record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
        if outcome.transitioned() {
            metrics.record_transition(&outcome.from.to_string(), &next_phase.to_string());
        }
        if let Some(cluster) = cluster_status {
            metrics.set_task_managers(
                &namespace,
                &name,
                i64::from(cluster.number_of_task_managers),
                i64::from(cluster.healthy_task_managers),
            );
        }
    }

    Ok(Action::requeue(requeue_interval(next_phase, &ctx.config)))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<FlinkApplication>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// Whether a failed step left status the API server has not seen yet.
fn has_unsaved_status(obj: &FlinkApplication, status: &FlinkApplicationStatus) -> bool {
    obj.status.as_ref() != Some(status)
}

/// Requeue interval after a successful step in `phase`.
pub fn requeue_interval(phase: ApplicationPhase, config: &ControllerConfig) -> Duration {
    match phase {
        ApplicationPhase::Running => config.requeue_interval,
        ApplicationPhase::Failed => FAILED_REQUEUE,
        ApplicationPhase::Deleting => config.requeue_interval,
        _ => config.transition_requeue,
    }
}

/// Reason and action of the Kubernetes event for a step, if it deserves one.
pub fn event_for(outcome: &StepOutcome) -> Option<(&'static str, &'static str, bool)> {
    let event = outcome.event?;
    if !outcome.transitioned() {
        return None;
    }
    let (reason, action, warning) = match event {
        ApplicationEvent::ClusterCreated => ("ClusterCreated", "CreateCluster", false),
        ApplicationEvent::ClusterReady => ("ClusterReady", "WaitForCluster", false),
        ApplicationEvent::JobSubmitted => ("JobSubmitted", "SubmitJob", false),
        ApplicationEvent::OldClusterDeleted => ("OldClusterDeleted", "DeleteOldCluster", false),
        ApplicationEvent::SpecChanged => ("SpecChanged", "Migrate", false),
        ApplicationEvent::SavepointTriggered => ("SavepointTriggered", "Savepoint", false),
        ApplicationEvent::SavepointCompleted => ("SavepointCompleted", "Savepoint", false),
        ApplicationEvent::SavepointFailed => ("SavepointFailed", "Savepoint", true),
        ApplicationEvent::CancelRequested => ("CancelRequested", "CancelJob", false),
        ApplicationEvent::JobCancelled => ("JobCancelled", "CancelJob", false),
        ApplicationEvent::JobLost => ("JobLost", "RecoverJob", true),
        ApplicationEvent::ReconcileError => ("ReconciliationFailed", "Reconciling", true),
        ApplicationEvent::RecoveryInitiated => ("Recovering", "Reconciling", false),
        ApplicationEvent::DeletionRequested => ("Deleting", "Delete", false),
    };
    Some((reason, action, warning))
}

async fn publish_outcome(obj: &FlinkApplication, ctx: &Context, outcome: &StepOutcome) {
    let Some((reason, action, warning)) = event_for(outcome) else {
        return;
    };
    let note = outcome.message.clone();
    if warning {
        ctx.publish_warning_event(obj, reason, action, note).await;
    } else {
        ctx.publish_normal_event(obj, reason, action, note).await;
    }
}

/// Handle deletion of a FlinkApplication
async fn handle_deletion(
    obj: &FlinkApplication,
    ctx: &Context,
    api: &Api<FlinkApplication>,
) -> Result<Action, Error> {
    let name = obj.name_any();
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Action::await_change());
    }
    info!(name = %name, "Handling deletion");

    let mut status = obj.status.clone().unwrap_or_default();
    if let Some(event) = determine_event(&status.phase, true, false) {
        let ctx_t = TransitionContext::new(obj.spec.savepoint_info.savepoint_on_update);
        if phases::apply_event(&ctx.state_machine, &mut status, event, &ctx_t) {
            // best effort, the finalizer goes either way
            if let Err(e) = patch_status(api, obj, status).await {
                debug!(error = %e, "Failed to record Deleting phase");
            }
        }
    }

    // Deployments and the service go with the owner reference.
    phases::cleanup(&ctx.flink, obj).await;
    ctx.publish_normal_event(
        obj,
        "Deleting",
        "Delete",
        Some("Cancelled job and released finalizer".to_string()),
    )
    .await;

    remove_finalizer(api, &name).await?;
    Ok(Action::await_change())
}

async fn add_finalizer(api: &Api<FlinkApplication>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<FlinkApplication>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": null
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Write `status` with observed generation, timestamp and conditions.
async fn patch_status(
    api: &Api<FlinkApplication>,
    obj: &FlinkApplication,
    mut status: FlinkApplicationStatus,
) -> Result<(), Error> {
    let generation = obj.metadata.generation;
    status.observed_generation = generation;
    status.last_updated_at = Some(jiff::Timestamp::now().to_string());
    status.conditions = conditions_for(&status, generation);

    // A merge patch leaves absent keys alone; cleared fields go out as null.
    let mut value = serde_json::to_value(&status)?;
    if let Some(map) = value.as_object_mut() {
        for field in [
            "jobId",
            "savepointTriggerId",
            "savepointLocation",
            "failureReason",
            "clusterStatus",
        ] {
            map.entry(field).or_insert(serde_json::Value::Null);
        }
    }
    let patch = serde_json::json!({ "status": value });

    api.patch_status(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
