//! Spec changes on a running application: the job moves to a new cluster
//! generation through a savepoint, or through the latest checkpoint when
//! the savepoint is skipped or fails.

use flink_operator::client::JobState;
use flink_operator::crd::ApplicationPhase;
use flink_operator::resources::task_manager_fingerprint;

use crate::common::fixtures::FlinkApplicationBuilder;
use crate::{Harness, SavepointBehavior};

async fn running(builder: FlinkApplicationBuilder) -> Harness {
    let mut h = Harness::new(builder.namespace("ns").generation(1).build());
    h.run_until(ApplicationPhase::Running, 10).await;
    h
}

fn app() -> FlinkApplicationBuilder {
    FlinkApplicationBuilder::new("app-name").parallelism(4)
}

#[tokio::test]
async fn test_image_change_migrates_through_savepoint() {
    let mut h = running(app()).await;
    let old_hash = h.status.deploy_hash.clone().unwrap();

    h.update_app(|app| app.spec.image = "flink:1.8".to_string());
    let new_hash = task_manager_fingerprint(&h.app).unwrap();
    assert_ne!(old_hash, new_hash);

    let phases = h.run_until(ApplicationPhase::Running, 15).await;
    assert_eq!(
        phases,
        vec![
            ApplicationPhase::Savepointing,
            ApplicationPhase::SavepointInProgress,
            ApplicationPhase::SavepointComplete,
            ApplicationPhase::Cancelling,
            ApplicationPhase::Cancelled,
            ApplicationPhase::ClusterStarting,
            ApplicationPhase::Submitting,
            ApplicationPhase::DeletingOldCluster,
            ApplicationPhase::Running,
        ]
    );

    assert_eq!(h.flink.triggers(), vec![("job-1".to_string(), "trigger-1".to_string())]);
    let submissions = h.flink.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(
        submissions[1].1.savepoint_path.as_deref(),
        Some("s3://savepoints/sp-1")
    );

    assert_eq!(h.status.job_id.as_deref(), Some("job-2"));
    assert_eq!(h.status.deploy_hash.as_deref(), Some(new_hash.as_str()));
    assert!(h.status.savepoint_trigger_id.is_none());
    assert_eq!(h.cluster.generations(), vec![new_hash]);
    assert_eq!(h.flink.active_jobs(), vec!["job-2".to_string()]);
}

#[tokio::test]
async fn test_old_cluster_serves_until_new_job_submitted() {
    let mut h = running(app()).await;
    let old_hash = h.status.deploy_hash.clone().unwrap();
    h.update_app(|app| app.spec.parallelism = 40);
    let new_hash = task_manager_fingerprint(&h.app).unwrap();

    h.run_until(ApplicationPhase::Submitting, 10).await;
    let mut generations = vec![old_hash, new_hash.clone()];
    generations.sort();
    assert_eq!(h.cluster.generations(), generations);

    h.run_until(ApplicationPhase::Running, 5).await;
    assert_eq!(h.cluster.generations(), vec![new_hash]);
}

#[tokio::test]
async fn test_savepoint_polled_until_complete() {
    let mut h = running(app()).await;
    h.flink.set_savepoint(SavepointBehavior::Pending);
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());

    h.run_until(ApplicationPhase::SavepointInProgress, 5).await;
    for _ in 0..3 {
        let outcome = h.step().await.unwrap();
        assert!(!outcome.transitioned());
    }
    // trigger requested once and kept
    assert_eq!(h.flink.triggers().len(), 1);
    assert_eq!(h.status.savepoint_trigger_id.as_deref(), Some("trigger-1"));

    h.flink
        .set_savepoint(SavepointBehavior::Complete("s3://savepoints/late".to_string()));
    h.run_until(ApplicationPhase::Running, 10).await;
    assert_eq!(
        h.flink.submissions()[1].1.savepoint_path.as_deref(),
        Some("s3://savepoints/late")
    );
}

#[tokio::test]
async fn test_savepoint_failure_falls_back_to_checkpoint() {
    let mut h = running(app()).await;
    h.flink
        .set_savepoint(SavepointBehavior::Fail("Checkpoint expired".to_string()));
    h.flink.set_checkpoint(Some("s3://checkpoints/chk-42"));
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());

    let phases = h.run_until(ApplicationPhase::Running, 15).await;
    assert_eq!(
        phases,
        vec![
            ApplicationPhase::Savepointing,
            ApplicationPhase::SavepointInProgress,
            ApplicationPhase::Cancelling,
            ApplicationPhase::Cancelled,
            ApplicationPhase::ClusterStarting,
            ApplicationPhase::Submitting,
            ApplicationPhase::DeletingOldCluster,
            ApplicationPhase::Running,
        ]
    );

    // the savepoint left the job running, so it was cancelled outright
    assert_eq!(h.flink.cancelled(), vec!["job-1".to_string()]);
    assert_eq!(
        h.flink.submissions()[1].1.savepoint_path.as_deref(),
        Some("s3://checkpoints/chk-42")
    );
}

#[tokio::test]
async fn test_migration_without_savepoint_uses_checkpoint() {
    let mut h = running(app().savepoint_on_update(false)).await;
    h.flink.set_checkpoint(Some("s3://checkpoints/chk-9"));
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());

    let phases = h.run_until(ApplicationPhase::Running, 10).await;
    assert_eq!(phases[0], ApplicationPhase::Cancelling);
    assert!(!phases.contains(&ApplicationPhase::Savepointing));
    assert!(h.flink.triggers().is_empty());
    assert_eq!(
        h.flink.submissions()[1].1.savepoint_path.as_deref(),
        Some("s3://checkpoints/chk-9")
    );
}

#[tokio::test]
async fn test_job_finishing_during_savepointing() {
    let mut h = running(app()).await;
    h.flink.set_checkpoint(Some("s3://checkpoints/chk-3"));
    h.update_app(|app| app.spec.image = "flink:1.8".to_string());

    // Running -> Savepointing
    h.step().await.unwrap();
    assert_eq!(h.phase(), ApplicationPhase::Savepointing);

    h.flink.set_job_state("job-1", JobState::Failed);
    h.step().await.unwrap();
    assert_eq!(h.phase(), ApplicationPhase::Cancelling);
    assert!(h.flink.triggers().is_empty());
    assert_eq!(
        h.status.savepoint_location.as_deref(),
        Some("s3://checkpoints/chk-3")
    );
}

#[tokio::test]
async fn test_replica_drift_does_not_migrate() {
    let mut h = running(app()).await;
    let hash = h.status.deploy_hash.clone().unwrap();
    let name = format!("app-name-{hash}-tm");
    let mut tm = h.cluster.deployment(&name).unwrap();
    tm.spec.as_mut().unwrap().replicas = Some(5);
    h.cluster.insert(tm);

    let outcome = h.step().await.unwrap();
    assert!(!outcome.transitioned());
    assert_eq!(h.flink.submissions().len(), 1);
    assert!(h.flink.triggers().is_empty());

    // parallelism 4 fits in one task manager with the default slots
    let restored = h.cluster.deployment(&name).unwrap();
    assert_eq!(restored.spec.unwrap().replicas, Some(1));
    assert_eq!(h.cluster.generations(), vec![hash]);
    assert!(h.cluster.deleted().is_empty());
}
