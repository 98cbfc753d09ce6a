//! Lost jobs, failed applications and steps re-run after an operator restart.

use flink_operator::client::JobState;
use flink_operator::controller::Error;
use flink_operator::controller::phases::apply_event;
use flink_operator::controller::state_machine::{
    ApplicationEvent, TransitionContext, determine_event,
};
use flink_operator::crd::{ApplicationPhase, FlinkApplicationStatus};
use flink_operator::resources::task_manager_fingerprint;

use crate::Harness;
use crate::common::fixtures::{FlinkApplicationBuilder, test_app};

#[tokio::test]
async fn test_lost_job_resubmitted_from_checkpoint() {
    let mut h = Harness::new(test_app("app-name"));
    h.run_until(ApplicationPhase::Running, 10).await;

    h.flink.set_checkpoint(Some("s3://checkpoints/chk-17"));
    h.flink.set_job_state("job-1", JobState::Failed);

    let outcome = h.step().await.unwrap();
    assert_eq!(outcome.event, Some(ApplicationEvent::JobLost));
    assert_eq!(h.phase(), ApplicationPhase::Submitting);
    assert!(h.status.job_id.is_none());

    h.run_until(ApplicationPhase::Running, 5).await;
    let submissions = h.flink.submissions();
    assert_eq!(
        submissions[1].1.savepoint_path.as_deref(),
        Some("s3://checkpoints/chk-17")
    );
    assert_eq!(h.status.job_id.as_deref(), Some("job-2"));
}

#[tokio::test]
async fn test_lost_job_without_checkpoint_starts_fresh() {
    let mut h = Harness::new(test_app("app-name"));
    h.run_until(ApplicationPhase::Running, 10).await;
    h.flink.set_job_state("job-1", JobState::Canceled);

    h.run_until(ApplicationPhase::Running, 5).await;
    assert_eq!(h.flink.submissions()[1].1.savepoint_path, None);
}

#[tokio::test]
async fn test_two_active_jobs_block_progress() {
    let mut h = Harness::new(test_app("app-name"));
    h.run_until(ApplicationPhase::Running, 10).await;
    h.flink.add_job("job-stray", JobState::Running);

    let err = h.step().await.unwrap_err();
    assert!(matches!(err, Error::AmbiguousActiveJob(_)));
    assert!(err.is_retryable());
    assert_eq!(h.phase(), ApplicationPhase::Running);
}

#[tokio::test]
async fn test_failed_application_recovers_on_new_generation() {
    let app = FlinkApplicationBuilder::new("app-name")
        .namespace("ns")
        .generation(3)
        .build();
    let mut h = Harness::new(app);
    h.status = FlinkApplicationStatus {
        phase: ApplicationPhase::Failed,
        failure_reason: Some("image must not be empty".to_string()),
        observed_generation: Some(3),
        ..Default::default()
    };
    h.app.status = Some(h.status.clone());

    // same generation: nothing to do
    assert_eq!(
        determine_event(&h.status.phase, false, false),
        None
    );
    h.step().await.unwrap();
    assert_eq!(h.phase(), ApplicationPhase::Failed);

    h.update_app(|app| app.spec.image = "flink:1.9".to_string());
    let event = determine_event(&h.status.phase, false, true).unwrap();
    assert_eq!(event, ApplicationEvent::RecoveryInitiated);
    let ctx = TransitionContext::new(true);
    assert!(apply_event(&h.state_machine, &mut h.status, event, &ctx));
    assert_eq!(h.phase(), ApplicationPhase::New);

    h.run_until(ApplicationPhase::Running, 10).await;
    assert!(h.status.failure_reason.is_none());
}

#[tokio::test]
async fn test_restart_in_savepointing_reuses_trigger() {
    let app = test_app("app-name");
    let hash = task_manager_fingerprint(&app).unwrap();
    let mut h = Harness::new(app);
    h.run_until(ApplicationPhase::Running, 10).await;

    // the trigger was requested but the phase write was lost
    h.status = FlinkApplicationStatus {
        phase: ApplicationPhase::Savepointing,
        deploy_hash: Some(hash),
        job_id: Some("job-1".to_string()),
        savepoint_trigger_id: Some("trigger-0".to_string()),
        ..Default::default()
    };
    h.step().await.unwrap();

    assert_eq!(h.phase(), ApplicationPhase::SavepointInProgress);
    assert!(h.flink.triggers().is_empty());
}

#[tokio::test]
async fn test_restart_in_cancelled_does_not_duplicate_cluster() {
    let mut h = Harness::new(test_app("app-name"));
    h.run_until(ApplicationPhase::Running, 10).await;
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());
    h.run_until(ApplicationPhase::Cancelled, 10).await;

    // run the Cancelled step twice, as after a crash before the status write
    let saved = h.status.clone();
    h.step().await.unwrap();
    let names = h.cluster.deployment_names();
    h.status = saved;
    h.step().await.unwrap();

    assert_eq!(h.cluster.deployment_names(), names);
    assert_eq!(h.phase(), ApplicationPhase::ClusterStarting);
}

#[tokio::test]
async fn test_new_after_failure_keeps_previous_job_state() {
    let mut h = Harness::new(test_app("app-name"));
    h.flink.set_checkpoint(Some("s3://checkpoints/chk-5"));
    h.status = FlinkApplicationStatus {
        phase: ApplicationPhase::New,
        job_id: Some("job-old".to_string()),
        ..Default::default()
    };

    h.run_until(ApplicationPhase::Running, 10).await;
    assert_eq!(
        h.flink.submissions()[0].1.savepoint_path.as_deref(),
        Some("s3://checkpoints/chk-5")
    );
}

#[tokio::test]
async fn test_spec_change_while_cluster_starting() {
    let mut h = Harness::new(test_app("app-name"));
    h.cluster.hold_pods();
    h.step().await.unwrap();
    assert_eq!(h.phase(), ApplicationPhase::ClusterStarting);
    let first = h.status.deploy_hash.clone().unwrap();

    h.update_app(|app| app.spec.parallelism = 64);
    let second = task_manager_fingerprint(&h.app).unwrap();
    h.step().await.unwrap();
    assert_eq!(h.status.deploy_hash.as_deref(), Some(second.as_str()));
    assert_eq!(h.phase(), ApplicationPhase::ClusterStarting);

    h.cluster.start_pods();
    h.run_until(ApplicationPhase::Running, 5).await;
    // the never-used first generation is cleaned up with the rest
    assert!(!h.cluster.generations().contains(&first));
}

#[tokio::test]
async fn test_lost_job_after_migration_does_not_rewind_to_old_savepoint() {
    let mut h = Harness::new(test_app("app-name"));
    h.run_until(ApplicationPhase::Running, 10).await;
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());
    h.run_until(ApplicationPhase::Running, 15).await;
    assert_eq!(
        h.flink.submissions()[1].1.savepoint_path.as_deref(),
        Some("s3://savepoints/sp-1")
    );
    assert!(h.status.savepoint_location.is_none());

    // no checkpoint since the migration
    h.flink.set_job_state("job-2", JobState::Failed);
    h.run_until(ApplicationPhase::Running, 10).await;

    let submissions = h.flink.submissions();
    assert_eq!(submissions.len(), 3);
    assert_eq!(submissions[2].1.savepoint_path, None);
    assert_eq!(h.status.job_id.as_deref(), Some("job-3"));
}

#[tokio::test]
async fn test_cancelling_stops_every_active_job() {
    let mut h = Harness::new(test_app("app-name"));
    h.run_until(ApplicationPhase::Running, 10).await;
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());
    h.run_until(ApplicationPhase::Cancelling, 10).await;

    // the savepoint stopped job-1, but it came back next to a stray
    h.flink.set_job_state("job-1", JobState::Running);
    h.flink.add_job("job-stray", JobState::Restarting);

    let outcome = h.step().await.unwrap();
    assert!(!outcome.transitioned());
    let mut cancelled = h.flink.cancelled();
    cancelled.sort();
    assert_eq!(cancelled, vec!["job-1".to_string(), "job-stray".to_string()]);
    assert!(h.flink.active_jobs().is_empty());

    h.run_until(ApplicationPhase::Running, 10).await;
    assert_eq!(h.flink.active_jobs(), vec!["job-2".to_string()]);
    assert_eq!(
        h.flink.submissions()[1].1.savepoint_path.as_deref(),
        Some("s3://savepoints/sp-1")
    );
}
