//! Formal finite state machine for the FlinkApplication lifecycle.
//!
//! The phase stored in the status is the saga position: create a cluster,
//! submit the job, and on a spec change savepoint the job, cancel it, bring
//! up the next generation and remove the previous one. Only transitions in
//! the table below are applied; anything else keeps the current phase.

use std::fmt;

use crate::crd::ApplicationPhase;

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationEvent {
    /// Cluster resources of the desired generation exist
    ClusterCreated,
    /// All pods are running and the job manager answers
    ClusterReady,
    /// A job id is known for the current cluster
    JobSubmitted,
    /// Deployments of previous generations are gone
    OldClusterDeleted,
    /// The desired fingerprint moved away from the deployed one
    SpecChanged,
    /// Cancel-with-savepoint accepted, trigger id recorded
    SavepointTriggered,
    /// Savepoint location recorded
    SavepointCompleted,
    /// Savepoint failed, falling back to the latest checkpoint
    SavepointFailed,
    /// Job is being cancelled without (further) savepointing
    CancelRequested,
    /// No active job remains on the old cluster
    JobCancelled,
    /// The running job disappeared
    JobLost,
    /// An unrecoverable error occurred
    ReconcileError,
    /// A new spec generation arrived after a failure
    RecoveryInitiated,
    /// Deletion timestamp has been set on the resource
    DeletionRequested,
}

impl fmt::Display for ApplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationEvent::ClusterCreated => write!(f, "ClusterCreated"),
            ApplicationEvent::ClusterReady => write!(f, "ClusterReady"),
            ApplicationEvent::JobSubmitted => write!(f, "JobSubmitted"),
            ApplicationEvent::OldClusterDeleted => write!(f, "OldClusterDeleted"),
            ApplicationEvent::SpecChanged => write!(f, "SpecChanged"),
            ApplicationEvent::SavepointTriggered => write!(f, "SavepointTriggered"),
            ApplicationEvent::SavepointCompleted => write!(f, "SavepointCompleted"),
            ApplicationEvent::SavepointFailed => write!(f, "SavepointFailed"),
            ApplicationEvent::CancelRequested => write!(f, "CancelRequested"),
            ApplicationEvent::JobCancelled => write!(f, "JobCancelled"),
            ApplicationEvent::JobLost => write!(f, "JobLost"),
            ApplicationEvent::ReconcileError => write!(f, "ReconcileError"),
            ApplicationEvent::RecoveryInitiated => write!(f, "RecoveryInitiated"),
            ApplicationEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Cluster pods are running and the job manager answers
    pub cluster_ready: bool,
    /// Job id currently recorded or just obtained
    pub job_id: Option<String>,
    /// Migration goes through a savepoint
    pub savepoint_on_update: bool,
    /// Error message if moving to Failed
    pub error_message: Option<String>,
}

impl TransitionContext {
    /// Create a new transition context
    pub fn new(savepoint_on_update: bool) -> Self {
        Self {
            savepoint_on_update,
            ..Default::default()
        }
    }

    /// Set cluster readiness
    pub fn with_cluster_ready(mut self, ready: bool) -> Self {
        self.cluster_ready = ready;
        self
    }

    /// Set job id
    pub fn with_job_id(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    /// Set error message
    pub fn with_error(mut self, message: String) -> Self {
        self.error_message = Some(message);
        self
    }
}

/// A state transition definition with optional guard
#[derive(Debug)]
pub struct Transition {
    /// Source phase
    pub from: ApplicationPhase,
    /// Target phase
    pub to: ApplicationPhase,
    /// Event that triggers this transition
    pub event: ApplicationEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    /// Create a new transition
    const fn new(
        from: ApplicationPhase,
        to: ApplicationPhase,
        event: ApplicationEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: ApplicationPhase,
        to: ApplicationPhase,
        event: ApplicationEvent,
        description: &'static str,
    },
    /// Transition was not valid for current phase
    InvalidTransition {
        current: ApplicationPhase,
        event: ApplicationEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: ApplicationPhase,
        to: ApplicationPhase,
        event: ApplicationEvent,
        reason: String,
    },
}

/// Phases that can fail or be deleted.
const LIVE_PHASES: [ApplicationPhase; 10] = [
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
];

/// Formal state machine for the FlinkApplication lifecycle
pub struct ApplicationStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ApplicationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use ApplicationEvent as E;
        use ApplicationPhase as P;

        let mut transitions = vec![
            // === First deployment ===
            Transition::new(
                P::New,
                P::ClusterStarting,
                E::ClusterCreated,
                "Cluster resources created",
            ),
            Transition::new(
                P::ClusterStarting,
                P::ClusterStarting,
                E::SpecChanged,
                "Spec changed while starting, creating the new generation",
            ),
            Transition::new(
                P::ClusterStarting,
                P::Submitting,
                E::ClusterReady,
                "Cluster is ready, submitting job",
            ),
            Transition::new(
                P::Submitting,
                P::ClusterStarting,
                E::SpecChanged,
                "Spec changed before submission",
            ),
            Transition::new(
                P::Submitting,
                P::DeletingOldCluster,
                E::JobSubmitted,
                "Job submitted, removing previous generations",
            ),
            Transition::new(
                P::DeletingOldCluster,
                P::Running,
                E::OldClusterDeleted,
                "Previous generations removed",
            ),
            Transition::new(
                P::DeletingOldCluster,
                P::Running,
                E::SpecChanged,
                "Spec changed before cleanup, migrating first",
            ),
            // === Running ===
            Transition::new(
                P::Running,
                P::Savepointing,
                E::SpecChanged,
                "Spec changed, taking a savepoint before migrating",
            ),
            Transition::new(
                P::Running,
                P::Cancelling,
                E::CancelRequested,
                "Spec changed, cancelling without savepoint",
            ),
            Transition::new(
                P::Running,
                P::Submitting,
                E::JobLost,
                "Job is gone, resubmitting from the latest checkpoint",
            ),
            // === Savepoint migration ===
            Transition::new(
                P::Savepointing,
                P::SavepointInProgress,
                E::SavepointTriggered,
                "Cancel with savepoint triggered",
            ),
            Transition::new(
                P::Savepointing,
                P::Cancelling,
                E::SavepointFailed,
                "Job no longer running, restoring from checkpoint",
            ),
            Transition::new(
                P::SavepointInProgress,
                P::SavepointComplete,
                E::SavepointCompleted,
                "Savepoint completed",
            ),
            Transition::new(
                P::SavepointInProgress,
                P::Cancelling,
                E::SavepointFailed,
                "Savepoint failed, cancelling and restoring from checkpoint",
            ),
            Transition::new(
                P::SavepointComplete,
                P::Cancelling,
                E::CancelRequested,
                "Waiting for the job to leave the cluster",
            ),
            Transition::new(
                P::Cancelling,
                P::Cancelled,
                E::JobCancelled,
                "Job cancelled",
            ),
            Transition::new(
                P::Cancelled,
                P::ClusterStarting,
                E::ClusterCreated,
                "New generation created",
            ),
            // === Failed ===
            Transition::new(
                P::Failed,
                P::New,
                E::RecoveryInitiated,
                "Spec updated after failure, starting over",
            ),
            Transition::new(
                P::Failed,
                P::Deleting,
                E::DeletionRequested,
                "Application deletion requested while failed",
            ),
            // === Deleting is terminal ===
        ];

        for phase in LIVE_PHASES {
            transitions.push(Transition::new(
                phase,
                P::Failed,
                E::ReconcileError,
                "Unrecoverable error",
            ));
            transitions.push(Transition::new(
                phase,
                P::Deleting,
                E::DeletionRequested,
                "Application deletion requested",
            ));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new phase based on an event
    pub fn transition(
        &self,
        current: &ApplicationPhase,
        event: ApplicationEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ApplicationPhase, event: &ApplicationEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given phase
    pub fn valid_events(&self, phase: &ApplicationPhase) -> Vec<&ApplicationEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *phase)
            .map(|t| &t.event)
            .collect()
    }

    /// Check guard conditions for a transition
    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        use ApplicationEvent as E;
        use ApplicationPhase as P;

        match (&transition.from, &transition.to, &transition.event) {
            (_, P::Submitting, E::ClusterReady) if !ctx.cluster_ready => {
                Some("Cluster is not ready".to_string())
            }
            (_, _, E::JobSubmitted) if ctx.job_id.as_deref().is_none_or(str::is_empty) => {
                Some("No job id for the submitted job".to_string())
            }
            (P::Running, P::Savepointing, E::SpecChanged) if !ctx.savepoint_on_update => {
                Some("Savepoint on update is disabled".to_string())
            }
            (P::Running, P::Cancelling, E::CancelRequested) if ctx.savepoint_on_update => {
                Some("Savepoint on update is enabled".to_string())
            }
            (P::Running, P::Savepointing, E::SpecChanged) if ctx.job_id.is_none() => {
                Some("No running job to savepoint".to_string())
            }
            _ => None,
        }
    }
}

/// Event that preempts the phase handler, if any.
///
/// Deletion always wins. A failed application recovers only once its spec
/// generation moved past the one that failed.
pub fn determine_event(
    current_phase: &ApplicationPhase,
    has_deletion_timestamp: bool,
    generation_changed: bool,
) -> Option<ApplicationEvent> {
    if has_deletion_timestamp {
        return Some(ApplicationEvent::DeletionRequested);
    }
    if *current_phase == ApplicationPhase::Failed && generation_changed {
        return Some(ApplicationEvent::RecoveryInitiated);
    }
    None
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    #[test]
    fn test_new_to_cluster_starting() {
        let sm = ApplicationStateMachine::new();
        let ctx = TransitionContext::new(true);

        let result = sm.transition(&ApplicationPhase::New, ApplicationEvent::ClusterCreated, &ctx);

        match result {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, ApplicationPhase::New);
                assert_eq!(to, ApplicationPhase::ClusterStarting);
            }
            _ => panic!("Expected successful transition"),
        }
    }

    #[test]
    fn test_cluster_ready_guard() {
        let sm = ApplicationStateMachine::new();

        let ctx = TransitionContext::new(true);
        let result = sm.transition(
            &ApplicationPhase::ClusterStarting,
            ApplicationEvent::ClusterReady,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let ctx = TransitionContext::new(true).with_cluster_ready(true);
        let result = sm.transition(
            &ApplicationPhase::ClusterStarting,
            ApplicationEvent::ClusterReady,
            &ctx,
        );
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: ApplicationPhase::Submitting,
                ..
            }
        ));
    }

    #[test]
    fn test_job_submitted_requires_job_id() {
        let sm = ApplicationStateMachine::new();

        let ctx = TransitionContext::new(true).with_job_id(Some(String::new()));
        let result = sm.transition(
            &ApplicationPhase::Submitting,
            ApplicationEvent::JobSubmitted,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let ctx = TransitionContext::new(true).with_job_id(Some("j1".to_string()));
        let result = sm.transition(
            &ApplicationPhase::Submitting,
            ApplicationEvent::JobSubmitted,
            &ctx,
        );
        assert!(matches!(result, TransitionResult::Success { .. }));
    }

    #[test]
    fn test_spec_change_follows_savepoint_setting() {
        let sm = ApplicationStateMachine::new();
        let with_job = |savepoint| {
            TransitionContext::new(savepoint).with_job_id(Some("j1".to_string()))
        };

        let result = sm.transition(
            &ApplicationPhase::Running,
            ApplicationEvent::SpecChanged,
            &with_job(true),
        );
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: ApplicationPhase::Savepointing,
                ..
            }
        ));

        let result = sm.transition(
            &ApplicationPhase::Running,
            ApplicationEvent::SpecChanged,
            &with_job(false),
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let result = sm.transition(
            &ApplicationPhase::Running,
            ApplicationEvent::CancelRequested,
            &with_job(false),
        );
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: ApplicationPhase::Cancelling,
                ..
            }
        ));
    }

    #[test]
    fn test_full_migration_path() {
        let sm = ApplicationStateMachine::new();
        let ctx = TransitionContext::new(true)
            .with_cluster_ready(true)
            .with_job_id(Some("j1".to_string()));

        let path = [
            (ApplicationPhase::Running, ApplicationEvent::SpecChanged),
            (ApplicationPhase::Savepointing, ApplicationEvent::SavepointTriggered),
            (ApplicationPhase::SavepointInProgress, ApplicationEvent::SavepointCompleted),
            (ApplicationPhase::SavepointComplete, ApplicationEvent::CancelRequested),
            (ApplicationPhase::Cancelling, ApplicationEvent::JobCancelled),
            (ApplicationPhase::Cancelled, ApplicationEvent::ClusterCreated),
            (ApplicationPhase::ClusterStarting, ApplicationEvent::ClusterReady),
            (ApplicationPhase::Submitting, ApplicationEvent::JobSubmitted),
            (ApplicationPhase::DeletingOldCluster, ApplicationEvent::OldClusterDeleted),
        ];

        let mut phase = ApplicationPhase::Running;
        for (expected_from, event) in path {
            assert_eq!(phase, expected_from);
            match sm.transition(&phase, event, &ctx) {
                TransitionResult::Success { to, .. } => phase = to,
                other => panic!("{event} from {phase} failed: {other:?}"),
            }
        }
        assert_eq!(phase, ApplicationPhase::Running);
    }

    #[test]
    fn test_savepoint_failure_goes_to_cancelling() {
        let sm = ApplicationStateMachine::new();
        let result = sm.transition(
            &ApplicationPhase::SavepointInProgress,
            ApplicationEvent::SavepointFailed,
            &TransitionContext::default(),
        );
        assert!(matches!(
            result,
            TransitionResult::Success {
                to: ApplicationPhase::Cancelling,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_transition() {
        let sm = ApplicationStateMachine::new();
        let ctx = TransitionContext::new(true);

        // a running job cannot be "submitted" again
        let result = sm.transition(&ApplicationPhase::Running, ApplicationEvent::JobSubmitted, &ctx);
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));
    }

    #[test]
    fn test_deleting_is_terminal() {
        let sm = ApplicationStateMachine::new();
        assert!(sm.valid_events(&ApplicationPhase::Deleting).is_empty());
    }

    #[test]
    fn test_deletion_and_failure_from_live_phases() {
        let sm = ApplicationStateMachine::new();
        for phase in LIVE_PHASES {
            assert!(
                sm.can_transition(&phase, &ApplicationEvent::DeletionRequested),
                "Should be able to delete from {phase}"
            );
            assert!(
                sm.can_transition(&phase, &ApplicationEvent::ReconcileError),
                "Should be able to fail from {phase}"
            );
        }
        assert!(sm.can_transition(&ApplicationPhase::Failed, &ApplicationEvent::DeletionRequested));
        assert!(!sm.can_transition(&ApplicationPhase::Failed, &ApplicationEvent::ReconcileError));
    }

    #[test]
    fn test_determine_event() {
        assert_eq!(
            determine_event(&ApplicationPhase::Running, true, true),
            Some(ApplicationEvent::DeletionRequested)
        );
        assert_eq!(
            determine_event(&ApplicationPhase::Failed, false, true),
            Some(ApplicationEvent::RecoveryInitiated)
        );
        assert_eq!(determine_event(&ApplicationPhase::Failed, false, false), None);
        assert_eq!(determine_event(&ApplicationPhase::Running, false, true), None);
    }
}
