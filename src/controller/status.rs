//! Status management utilities.
//!
//! Conditions are derived from the phase and the latest health snapshot.
//! A condition keeps its transition time while its status does not change.

use crate::crd::{ApplicationPhase, ClusterHealth, Condition, FlinkApplicationStatus};

/// Builder for managing conditions list
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Start from an empty list
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from previously written conditions
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            let last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..condition
            };
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Progressing condition
    pub fn progressing(
        &mut self,
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::progressing(
            progressing,
            reason,
            message,
            generation,
        ))
    }

    /// Set Degraded condition
    pub fn degraded(
        &mut self,
        degraded: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::degraded(degraded, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Conditions for `status` observed at `generation`.
pub fn conditions_for(status: &FlinkApplicationStatus, generation: Option<i64>) -> Vec<Condition> {
    let mut builder = ConditionBuilder::from_existing(&status.conditions);
    let phase = status.phase.to_string();

    match status.phase {
        ApplicationPhase::Running => {
            builder
                .ready(true, "JobRunning", "Job is running", generation)
                .progressing(false, "JobRunning", "Job is running", generation);
        }
        ApplicationPhase::Failed => {
            let reason = status
                .failure_reason
                .as_deref()
                .unwrap_or("Application failed");
            builder
                .ready(false, "ReconciliationFailed", reason, generation)
                .progressing(false, "ReconciliationFailed", reason, generation);
        }
        ApplicationPhase::Deleting => {
            builder.ready(false, "Deleting", "Application is being deleted", generation);
        }
        _ => {
            builder
                .ready(false, &phase, &format!("Phase: {phase}"), generation)
                .progressing(true, &phase, &format!("Phase: {phase}"), generation);
        }
    }

    let health = status.cluster_status.as_ref().map(|c| c.health);
    match health {
        Some(ClusterHealth::Green) => {
            builder.degraded(false, "Healthy", "All task managers are heartbeating", generation);
        }
        Some(h) => {
            let message = status
                .cluster_status
                .as_ref()
                .map(|c| {
                    format!(
                        "{}/{} task managers healthy",
                        c.healthy_task_managers, c.number_of_task_managers
                    )
                })
                .unwrap_or_default();
            builder.degraded(true, &h.to_string(), &message, generation);
        }
        None => {}
    }

    builder.build()
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Get the reason for a condition
pub fn get_condition_reason<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.reason.as_str())
}
