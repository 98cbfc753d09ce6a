// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for flink-operator.
//!
//! Fingerprints, replica derivation, job selection, health verdicts and the
//! phase transition table, checked over generated inputs.

use std::collections::BTreeMap;
use std::time::Duration;

use proptest::prelude::*;

use flink_operator::client::{ClusterOverviewResponse, FlinkJob, JobState, TaskManagerStats};
use flink_operator::controller::flink::{aggregate_cluster_health, select_active_job};
use flink_operator::controller::state_machine::{ApplicationEvent, ApplicationStateMachine};
use flink_operator::crd::{
    ApplicationPhase, ClusterHealth, FlinkApplication, FlinkApplicationSpec,
    task_manager_replicas,
};
use flink_operator::resources::hash::{FINGERPRINT_LEN, canonical_json, fingerprint};
use flink_operator::resources::task_manager_fingerprint;

/// Strategy for generating random phases.
fn any_phase() -> impl Strategy<Value = ApplicationPhase> {
    prop_oneof![
        Just(ApplicationPhase::New),
        Just(ApplicationPhase::ClusterStarting),
        Just(ApplicationPhase::Submitting),
        Just(ApplicationPhase::DeletingOldCluster),
        Just(ApplicationPhase::Running),
        Just(ApplicationPhase::Savepointing),
        Just(ApplicationPhase::SavepointInProgress),
        Just(ApplicationPhase::SavepointComplete),
        Just(ApplicationPhase::Cancelling),
        Just(ApplicationPhase::Cancelled),
        Just(ApplicationPhase::Failed),
        Just(ApplicationPhase::Deleting),
    ]
}

/// Strategy for generating random events.
fn any_event() -> impl Strategy<Value = ApplicationEvent> {
    prop_oneof![
        Just(ApplicationEvent::ClusterCreated),
        Just(ApplicationEvent::ClusterReady),
        Just(ApplicationEvent::JobSubmitted),
        Just(ApplicationEvent::OldClusterDeleted),
        Just(ApplicationEvent::SpecChanged),
        Just(ApplicationEvent::SavepointTriggered),
        Just(ApplicationEvent::SavepointCompleted),
        Just(ApplicationEvent::SavepointFailed),
        Just(ApplicationEvent::CancelRequested),
        Just(ApplicationEvent::JobCancelled),
        Just(ApplicationEvent::JobLost),
        Just(ApplicationEvent::ReconcileError),
        Just(ApplicationEvent::RecoveryInitiated),
        Just(ApplicationEvent::DeletionRequested),
    ]
}

fn any_job_state() -> impl Strategy<Value = JobState> {
    prop_oneof![
        Just(JobState::Created),
        Just(JobState::Running),
        Just(JobState::Failing),
        Just(JobState::Failed),
        Just(JobState::Cancelling),
        Just(JobState::Canceled),
        Just(JobState::Finished),
        Just(JobState::Restarting),
        Just(JobState::Suspended),
    ]
}

fn app(image: &str, parallelism: i32, slots: i32) -> FlinkApplication {
    let mut spec = FlinkApplicationSpec {
        image: image.to_string(),
        jar_name: "job.jar".to_string(),
        parallelism,
        ..Default::default()
    };
    spec.task_manager_config.task_slots = Some(slots);
    let mut app = FlinkApplication::new("app-name", spec);
    app.metadata.namespace = Some("ns".to_string());
    app
}

proptest! {
    /// Property: Replica count covers the requested parallelism with the
    /// fewest task managers, never fewer than one.
    #[test]
    fn test_replicas_cover_parallelism(parallelism in 1..=1000i32, slots in 1..=64i32) {
        let replicas = task_manager_replicas(parallelism, slots);
        prop_assert!(replicas >= 1);
        prop_assert!(replicas * slots >= parallelism);
        prop_assert!((replicas - 1) * slots < parallelism);
    }

    /// Property: Parallelism near the top of the i32 range still yields the
    /// exact ceiling without wrapping.
    #[test]
    fn test_replicas_at_i32_limit(parallelism in (i32::MAX - 4096)..=i32::MAX, slots in 1..=64i32) {
        let replicas = i64::from(task_manager_replicas(parallelism, slots));
        let (parallelism, slots) = (i64::from(parallelism), i64::from(slots));
        prop_assert!(replicas >= 1);
        prop_assert!(replicas * slots >= parallelism);
        prop_assert!((replicas - 1) * slots < parallelism);
    }

    /// Property: Degenerate inputs still yield one task manager.
    #[test]
    fn test_replicas_degenerate(parallelism in -10..=0i32, slots in -10..=64i32) {
        prop_assert_eq!(task_manager_replicas(parallelism, slots), 1);
    }

    /// Property: Fingerprints are short lowercase hex and stable across calls.
    #[test]
    fn test_fingerprint_deterministic(
        image in "[a-z]{1,12}:[0-9]\\.[0-9]{1,2}",
        parallelism in 1..=256i32,
        slots in 1..=32i32
    ) {
        let app = app(&image, parallelism, slots);
        let first = task_manager_fingerprint(&app).unwrap();
        let second = task_manager_fingerprint(&app.clone()).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), FINGERPRINT_LEN);
        prop_assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Property: Any image change moves the fingerprint.
    #[test]
    fn test_fingerprint_sensitive_to_image(
        a in "[a-z]{1,12}:[0-9]\\.[0-9]",
        b in "[a-z]{1,12}:[0-9]\\.[0-9]"
    ) {
        prop_assume!(a != b);
        let left = task_manager_fingerprint(&app(&a, 4, 4)).unwrap();
        let right = task_manager_fingerprint(&app(&b, 4, 4)).unwrap();
        prop_assert_ne!(left, right);
    }

    /// Property: Map insertion order never affects the canonical form.
    #[test]
    fn test_canonical_json_ignores_order(
        entries in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,8}"), 0..10)
    ) {
        let forward: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let mut deduped = BTreeMap::new();
        for (k, v) in &entries {
            deduped.insert(k.clone(), v.clone());
        }
        let reverse: serde_json::Map<String, serde_json::Value> = deduped
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        prop_assert_eq!(
            canonical_json(&forward).unwrap(),
            canonical_json(&reverse).unwrap()
        );
        prop_assert_eq!(fingerprint(&forward).unwrap(), fingerprint(&reverse).unwrap());
    }

    /// Property: More than one active job is always an error, otherwise the
    /// active job (if any) is returned.
    #[test]
    fn test_active_job_selection(states in proptest::collection::vec(any_job_state(), 0..6)) {
        let jobs: Vec<FlinkJob> = states
            .iter()
            .enumerate()
            .map(|(i, s)| FlinkJob::new(format!("job-{i}"), s.clone()))
            .collect();
        let active = states.iter().filter(|s| s.is_active()).count();
        match select_active_job(&jobs) {
            Ok(None) => prop_assert_eq!(active, 0),
            Ok(Some(job)) => {
                prop_assert_eq!(active, 1);
                prop_assert!(job.status.is_active());
            }
            Err(_) => prop_assert!(active > 1),
        }
    }

    /// Property: Health verdict matches the heartbeat counts.
    #[test]
    fn test_health_verdict_consistent(ages in proptest::collection::vec(0i64..120_000, 0..8)) {
        let now = 10_000_000;
        let tms: Vec<TaskManagerStats> = ages
            .iter()
            .map(|age| TaskManagerStats {
                time_since_last_heartbeat: now - age,
                ..Default::default()
            })
            .collect();
        let overview = ClusterOverviewResponse {
            task_manager_count: i32::try_from(tms.len()).unwrap(),
            ..Default::default()
        };
        let status = aggregate_cluster_health(&overview, &tms, now, Duration::from_secs(30));
        let fresh = ages.iter().filter(|a| **a <= 30_000).count();

        prop_assert_eq!(status.healthy_task_managers, i32::try_from(fresh).unwrap());
        let expected = if tms.is_empty() || fresh == 0 {
            ClusterHealth::Red
        } else if fresh == tms.len() {
            ClusterHealth::Green
        } else {
            ClusterHealth::Yellow
        };
        prop_assert_eq!(status.health, expected);
    }

    /// Property: State machine transition checks are deterministic.
    #[test]
    fn test_state_transitions_deterministic(
        phase in any_phase(),
        event in any_event()
    ) {
        let sm = ApplicationStateMachine::new();
        prop_assert_eq!(sm.can_transition(&phase, &event), sm.can_transition(&phase, &event));
    }

    /// Property: Deleting phase cannot transition to anything.
    #[test]
    fn test_deleting_is_terminal(event in any_event()) {
        let sm = ApplicationStateMachine::new();
        prop_assert!(!sm.can_transition(&ApplicationPhase::Deleting, &event));
    }

    /// Property: Every phase but Deleting accepts deletion.
    #[test]
    fn test_all_can_delete(phase in any_phase()) {
        let sm = ApplicationStateMachine::new();
        let can_delete = sm.can_transition(&phase, &ApplicationEvent::DeletionRequested);
        prop_assert_eq!(can_delete, phase != ApplicationPhase::Deleting);
    }

    /// Property: Phase can be serialized and deserialized.
    #[test]
    fn test_phase_roundtrip(phase in any_phase()) {
        let serialized = serde_json::to_string(&phase).unwrap();
        let deserialized: ApplicationPhase = serde_json::from_str(&serialized).unwrap();
        prop_assert_eq!(phase, deserialized);
    }
}
