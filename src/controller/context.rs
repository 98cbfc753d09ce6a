//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the Kubernetes client, the event reporter and the lifecycle operations.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use super::error::Result;
use super::flink::FlinkController;
use super::k8s::KubeCluster;
use super::state_machine::ApplicationStateMachine;
use crate::client::FlinkRestClient;
use crate::config::ControllerConfig;
use crate::crd::FlinkApplication;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "flink-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Lifecycle operations against the cluster and the job manager
    pub flink: Arc<FlinkController>,
    /// Transition table
    pub state_machine: Arc<ApplicationStateMachine>,
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context talking to the real cluster and job managers.
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let rest = FlinkRestClient::new(config.flink_request_timeout)?;
        let flink = FlinkController::new(
            Arc::new(KubeCluster::new(client.clone())),
            Arc::new(rest),
            &config,
        );
        Ok(Self::with_controller(client, health_state, config, Arc::new(flink)))
    }

    /// Create a context around an existing controller.
    pub fn with_controller(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        config: ControllerConfig,
        flink: Arc<FlinkController>,
    ) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            flink,
            state_machine: Arc::new(ApplicationStateMachine::new()),
            config,
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(
        &self,
        resource: &FlinkApplication,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for an application
    pub async fn publish_normal_event(
        &self,
        resource: &FlinkApplication,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for an application
    pub async fn publish_warning_event(
        &self,
        resource: &FlinkApplication,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }
}
