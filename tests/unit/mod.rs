// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for flink-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation through the public API.

#[path = "../common/mod.rs"]
mod common;

mod crd_tests {
    use flink_operator::crd::{
        ApplicationPhase, ClusterHealth, Condition, FlinkApplication, task_manager_replicas,
    };
    use kube::CustomResourceExt;

    #[test]
    fn test_phase_display() {
        assert_eq!(ApplicationPhase::New.to_string(), "New");
        assert_eq!(ApplicationPhase::ClusterStarting.to_string(), "ClusterStarting");
        assert_eq!(ApplicationPhase::Running.to_string(), "Running");
        assert_eq!(
            ApplicationPhase::SavepointInProgress.to_string(),
            "SavepointInProgress"
        );
        assert_eq!(ApplicationPhase::Failed.to_string(), "Failed");
        assert_eq!(ApplicationPhase::Deleting.to_string(), "Deleting");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(ApplicationPhase::default(), ApplicationPhase::New);
        assert_eq!(ClusterHealth::default(), ClusterHealth::Red);
    }

    #[test]
    fn test_transitional_phases() {
        assert!(ApplicationPhase::ClusterStarting.is_transitional());
        assert!(ApplicationPhase::Cancelling.is_transitional());
        assert!(!ApplicationPhase::Running.is_transitional());
        assert!(!ApplicationPhase::Failed.is_transitional());
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "JobRunning", "Job is running", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_replicas_round_up() {
        assert_eq!(task_manager_replicas(8, 4), 2);
        assert_eq!(task_manager_replicas(9, 4), 3);
        assert_eq!(task_manager_replicas(1, 16), 1);
        assert_eq!(task_manager_replicas(0, 16), 1);
    }

    #[test]
    fn test_crd_definition() {
        let crd = FlinkApplication::crd();
        assert_eq!(crd.spec.group, "flink.k8s.io");
        assert_eq!(crd.spec.names.kind, "FlinkApplication");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
        assert!(crd.spec.versions[0].subresources.is_some());
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let app: FlinkApplication = serde_json::from_value(serde_json::json!({
            "apiVersion": "flink.k8s.io/v1alpha1",
            "kind": "FlinkApplication",
            "metadata": { "name": "wordcount", "namespace": "ns" },
            "spec": { "image": "flink:1.7", "jarName": "wordcount.jar" }
        }))
        .unwrap();

        assert_eq!(app.spec.parallelism, 1);
        assert!(app.spec.savepoint_info.savepoint_on_update);
        assert_eq!(app.spec.task_manager_replicas(), 1);
        assert!(app.status.is_none());
    }
}

mod state_machine_tests {
    use flink_operator::controller::state_machine::{
        ApplicationEvent, ApplicationStateMachine, TransitionContext, TransitionResult,
    };
    use flink_operator::crd::ApplicationPhase;

    #[test]
    fn test_valid_events_from_new() {
        let sm = ApplicationStateMachine::new();
        let events = sm.valid_events(&ApplicationPhase::New);
        assert!(events.contains(&&ApplicationEvent::ClusterCreated));
        assert!(events.contains(&&ApplicationEvent::ReconcileError));
        assert!(!events.contains(&&ApplicationEvent::JobSubmitted));
    }

    #[test]
    fn test_valid_events_from_running() {
        let sm = ApplicationStateMachine::new();
        let events = sm.valid_events(&ApplicationPhase::Running);
        assert!(events.contains(&&ApplicationEvent::SpecChanged));
        assert!(events.contains(&&ApplicationEvent::CancelRequested));
        assert!(events.contains(&&ApplicationEvent::JobLost));
    }

    #[test]
    fn test_deleting_is_terminal() {
        let sm = ApplicationStateMachine::new();
        assert!(sm.valid_events(&ApplicationPhase::Deleting).is_empty());
    }

    #[test]
    fn test_deletion_from_all_live_phases() {
        let sm = ApplicationStateMachine::new();
        for phase in [
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
        ] {
            assert!(
                sm.can_transition(&phase, &ApplicationEvent::DeletionRequested),
                "{phase} should accept deletion"
            );
        }
    }

    #[test]
    fn test_savepoint_guard_follows_spec() {
        let sm = ApplicationStateMachine::new();
        let ctx = TransitionContext::new(false).with_job_id(Some("j1".to_string()));
        let result = sm.transition(
            &ApplicationPhase::Running,
            ApplicationEvent::SpecChanged,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let result = sm.transition(
            &ApplicationPhase::Running,
            ApplicationEvent::CancelRequested,
            &ctx,
        );
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: ApplicationPhase::Cancelling,
                ..
            }
        ));
    }
}

mod error_tests {
    use std::time::Duration;

    use flink_operator::client::FlinkClientError;
    use flink_operator::controller::Error;

    #[test]
    fn test_error_is_retryable() {
        let flink = Error::from(FlinkClientError::Api {
            status: 500,
            message: "boom".to_string(),
        });
        assert!(flink.is_retryable());
        assert!(Error::InvalidJobId.is_retryable());
        assert!(!Error::Validation("bad".to_string()).is_retryable());
        assert!(!Error::MissingField("status.jobId".to_string()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::InvalidJobId.to_string(),
            "unable to submit job: invalid job id"
        );
        let err = Error::AmbiguousActiveJob(vec!["a".to_string(), "b".to_string()]);
        assert!(err.to_string().contains("a, b"));
        // transparent
        let err = Error::from(FlinkClientError::Decode("oops".to_string()));
        assert_eq!(err.to_string(), "Flink response decode error: oops");
    }

    #[test]
    fn test_requeue_after() {
        assert_eq!(Error::InvalidJobId.requeue_after(), Duration::from_secs(30));
        assert_eq!(
            Error::Validation("bad".to_string()).requeue_after(),
            Duration::from_secs(300)
        );
    }
}

mod status_tests {
    use flink_operator::controller::status::{
        ConditionBuilder, conditions_for, get_condition_reason, is_condition_true,
    };
    use flink_operator::crd::{ApplicationPhase, FlinkApplicationStatus};

    #[test]
    fn test_condition_builder_updates_existing() {
        let mut builder = ConditionBuilder::new();
        builder.ready(false, "Starting", "Starting", Some(1));
        builder.ready(true, "JobRunning", "Job is running", Some(1));
        let conditions = builder.build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(get_condition_reason(&conditions, "Ready"), Some("JobRunning"));
    }

    #[test]
    fn test_is_condition_true_missing() {
        assert!(!is_condition_true(&[], "Ready"));
    }

    #[test]
    fn test_conditions_for_migration_phase() {
        let status = FlinkApplicationStatus {
            phase: ApplicationPhase::Cancelling,
            ..Default::default()
        };
        let conditions = conditions_for(&status, Some(4));
        assert!(!is_condition_true(&conditions, "Ready"));
        assert!(is_condition_true(&conditions, "Progressing"));
    }
}

mod resource_tests {
    use flink_operator::resources::common::{
        APP_HASH_LABEL, DEPLOYMENT_TYPE_LABEL, JOB_MANAGER, TASK_MANAGER, job_manager_url,
    };
    use flink_operator::resources::job_manager::{
        generate_job_manager_deployment, generate_job_manager_service,
    };
    use flink_operator::resources::task_manager::{
        deployment_hash, deployment_role, generate_task_manager_deployment,
    };
    use flink_operator::resources::task_manager_fingerprint;

    use crate::common::fixtures::{FlinkApplicationBuilder, test_app};

    #[test]
    fn test_job_manager_url() {
        let app = test_app("wordcount");
        assert_eq!(job_manager_url(&app), "http://wordcount-jm.ns:8081");
    }

    #[test]
    fn test_task_manager_generation_labels() {
        let app = FlinkApplicationBuilder::new("wordcount")
            .namespace("ns")
            .uid("uid-1")
            .parallelism(10)
            .task_slots(4)
            .build();
        let hash = task_manager_fingerprint(&app).unwrap();
        let deployment = generate_task_manager_deployment(&app).unwrap();

        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some(format!("wordcount-{hash}-tm").as_str())
        );
        assert_eq!(deployment_hash(&deployment), Some(hash.as_str()));
        assert_eq!(deployment_role(&deployment), Some(TASK_MANAGER));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.selector.match_labels.unwrap().get(APP_HASH_LABEL),
            Some(&hash)
        );
    }

    #[test]
    fn test_job_manager_resources() {
        let app = test_app("wordcount");
        let deployment = generate_job_manager_deployment(&app, "abcd1234");
        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("wordcount-abcd1234-jm")
        );
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));

        let service = generate_job_manager_service(&app, "abcd1234");
        assert_eq!(service.metadata.name.as_deref(), Some("wordcount-jm"));
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get(DEPLOYMENT_TYPE_LABEL).map(String::as_str), Some(JOB_MANAGER));
        assert_eq!(selector.get(APP_HASH_LABEL).map(String::as_str), Some("abcd1234"));
    }

    #[test]
    fn test_fingerprint_ignores_job_fields() {
        let app = test_app("wordcount");
        let mut other = app.clone();
        other.spec.program_args = "--other".to_string();
        other.spec.entry_class = "org.example.Other".to_string();
        assert_eq!(
            task_manager_fingerprint(&app).unwrap(),
            task_manager_fingerprint(&other).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_tracks_config() {
        let app = test_app("wordcount");
        let mut other = app.clone();
        other
            .spec
            .flink_config
            .insert("state.backend".to_string(), "rocksdb".to_string());
        assert_ne!(
            task_manager_fingerprint(&app).unwrap(),
            task_manager_fingerprint(&other).unwrap()
        );
    }
}

mod health_tests {
    use std::time::Duration;

    use flink_operator::client::{ClusterOverviewResponse, TaskManagerStats};
    use flink_operator::controller::flink::{aggregate_cluster_health, health_verdict};
    use flink_operator::crd::ClusterHealth;

    fn tm(heartbeat: i64) -> TaskManagerStats {
        TaskManagerStats {
            time_since_last_heartbeat: heartbeat,
            ..Default::default()
        }
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(health_verdict(3, 3), ClusterHealth::Green);
        assert_eq!(health_verdict(2, 3), ClusterHealth::Yellow);
        assert_eq!(health_verdict(0, 3), ClusterHealth::Red);
        assert_eq!(health_verdict(0, 0), ClusterHealth::Red);
    }

    #[test]
    fn test_stale_heartbeat_is_unhealthy() {
        let now = 1_000_000;
        let overview = ClusterOverviewResponse {
            task_manager_count: 2,
            number_of_task_slots: 8,
            slots_available: 2,
            ..Default::default()
        };
        let status = aggregate_cluster_health(
            &overview,
            &[tm(now - 1_000), tm(now - 60_000)],
            now,
            Duration::from_secs(30),
        );
        assert_eq!(status.healthy_task_managers, 1);
        assert_eq!(status.health, ClusterHealth::Yellow);
        assert_eq!(status.available_task_slots, 2);
    }
}
