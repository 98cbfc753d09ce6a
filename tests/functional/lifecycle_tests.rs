//! First deployment of an application: cluster creation, readiness gating,
//! submission and adoption of an already running job.

use flink_operator::client::JobState;
use flink_operator::controller::state_machine::ApplicationEvent;
use flink_operator::crd::{ApplicationPhase, ClusterHealth};
use flink_operator::resources::common::{APP_HASH_LABEL, job_manager_service_name};
use flink_operator::resources::job_manager::generate_job_manager_deployment;
use flink_operator::resources::task_manager::generate_task_manager_deployment;
use flink_operator::resources::task_manager_fingerprint;

use crate::Harness;
use crate::common::fixtures::FlinkApplicationBuilder;

fn wordcount() -> FlinkApplicationBuilder {
    FlinkApplicationBuilder::new("wordcount")
        .namespace("streaming")
        .generation(1)
        .uid("uid-wordcount")
}

/// A fresh deploy at parallelism 8 replaces a leftover generation, waits for
/// the new pods, and submits the job with the spec's jar, class and args.
#[tokio::test]
async fn test_fresh_deploy_replaces_stale_cluster() {
    let app = wordcount()
        .parallelism(8)
        .task_slots(4)
        .entry_class("org.example.WordCount")
        .program_args("--input s3://in --output s3://out")
        .jar_name("wordcount.jar")
        .savepoint_location("s3://savepoints/initial")
        .build();

    let stale_app = wordcount().parallelism(2).task_slots(4).build();
    let stale_hash = task_manager_fingerprint(&stale_app).unwrap();
    let desired_hash = task_manager_fingerprint(&app).unwrap();
    assert_ne!(stale_hash, desired_hash);

    let mut h = Harness::new(app);
    h.cluster
        .insert(generate_task_manager_deployment(&stale_app).unwrap());
    h.cluster
        .insert(generate_job_manager_deployment(&stale_app, &stale_hash));
    h.cluster.hold_pods();

    // New: stale generation removed, desired generation created
    let outcome = h.step().await.unwrap();
    assert_eq!(outcome.event, Some(ApplicationEvent::ClusterCreated));
    assert_eq!(h.phase(), ApplicationPhase::ClusterStarting);
    assert_eq!(h.cluster.generations(), vec![desired_hash.clone()]);
    assert_eq!(h.cluster.deleted().len(), 2);
    assert_eq!(h.status.deploy_hash.as_deref(), Some(desired_hash.as_str()));

    // 8 / 4 slots = 2 task managers
    let tm = h
        .cluster
        .deployment(&format!("wordcount-{desired_hash}-tm"))
        .unwrap();
    assert_eq!(tm.spec.unwrap().replicas, Some(2));

    // Pods pending: stay
    let outcome = h.step().await.unwrap();
    assert!(!outcome.transitioned());
    assert_eq!(h.phase(), ApplicationPhase::ClusterStarting);

    // Pods running but the job manager does not answer yet: stay
    h.cluster.start_pods();
    h.flink.set_reachable(false);
    h.step().await.unwrap();
    assert_eq!(h.phase(), ApplicationPhase::ClusterStarting);

    h.flink.set_reachable(true);
    let phases = h.run_until(ApplicationPhase::Running, 5).await;
    assert_eq!(
        phases,
        vec![
            ApplicationPhase::Submitting,
            ApplicationPhase::DeletingOldCluster,
            ApplicationPhase::Running,
        ]
    );

    let submissions = h.flink.submissions();
    assert_eq!(submissions.len(), 1);
    let (jar, request) = &submissions[0];
    assert_eq!(jar, "wordcount.jar");
    assert_eq!(request.parallelism, 8);
    assert_eq!(request.entry_class, "org.example.WordCount");
    assert_eq!(request.program_args, "--input s3://in --output s3://out");
    assert_eq!(
        request.savepoint_path.as_deref(),
        Some("s3://savepoints/initial")
    );
    assert_eq!(h.status.job_id.as_deref(), Some("job-1"));
}

#[tokio::test]
async fn test_service_points_at_current_generation() {
    let app = wordcount().build();
    let hash = task_manager_fingerprint(&app).unwrap();
    let mut h = Harness::new(app.clone());
    h.step().await.unwrap();

    let service = h.cluster.service(&job_manager_service_name(&app)).unwrap();
    let selector = service.spec.unwrap().selector.unwrap();
    assert_eq!(selector.get(APP_HASH_LABEL), Some(&hash));
}

#[tokio::test]
async fn test_running_reports_health() {
    let mut h = Harness::new(wordcount().build());
    h.run_until(ApplicationPhase::Running, 10).await;

    // first Running cycle refreshes the snapshot
    let outcome = h.step().await.unwrap();
    assert!(!outcome.transitioned());
    let cluster = h.status.cluster_status.clone().unwrap();
    assert_eq!(cluster.number_of_task_managers, 2);
    assert_eq!(cluster.healthy_task_managers, 2);
    assert_eq!(cluster.health, ClusterHealth::Green);

    // unreachable job manager clears it instead of keeping stale numbers
    h.flink.set_reachable(false);
    let result = h.step().await;
    assert!(result.is_err());
    assert!(h.status.cluster_status.is_none());
    assert_eq!(h.phase(), ApplicationPhase::Running);
}

#[tokio::test]
async fn test_submitting_adopts_job_after_lost_status_write() {
    let mut h = Harness::new(wordcount().build());
    h.run_until(ApplicationPhase::Submitting, 5).await;

    // a previous cycle submitted but crashed before writing the job id
    h.flink.add_job("job-orphan", JobState::Running);
    h.step().await.unwrap();

    assert_eq!(h.phase(), ApplicationPhase::DeletingOldCluster);
    assert_eq!(h.status.job_id.as_deref(), Some("job-orphan"));
    assert!(h.flink.submissions().is_empty());
}

#[tokio::test]
async fn test_steady_state_is_stable() {
    let mut h = Harness::new(wordcount().build());
    h.run_until(ApplicationPhase::Running, 10).await;
    let deployments = h.cluster.deployment_names();

    for _ in 0..3 {
        let outcome = h.step().await.unwrap();
        assert!(!outcome.transitioned());
    }
    assert_eq!(h.cluster.deployment_names(), deployments);
    assert_eq!(h.flink.submissions().len(), 1);
    assert_eq!(h.flink.active_jobs(), vec!["job-1".to_string()]);
}

#[tokio::test]
async fn test_invalid_spec_fails_before_creating_anything() {
    let mut h = Harness::new(wordcount().jar_name("").build());
    let outcome = h.step().await.unwrap();

    assert_eq!(outcome.to, ApplicationPhase::Failed);
    assert!(h.cluster.deployment_names().is_empty());
    assert!(
        h.status
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("jarName")
    );
}
