//! Task manager Deployment generation.
//!
//! The task manager deployment is also the reference object for change
//! detection: its fingerprint names the generation of every resource the
//! operator creates for a given spec.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use tracing::debug;

use super::ClusterComponent;
use super::common::{
    APP_HASH_LABEL, DEPLOYMENT_TYPE_LABEL, QUERY_PORT, TASK_MANAGER, TASK_MANAGER_DATA_PORT,
    TASK_MANAGER_RPC_PORT, flink_env, owner_reference, resource_requirements, standard_annotations,
    standard_labels, task_manager_name,
};
use super::hash::fingerprint;
use crate::controller::error::Result;
use crate::controller::k8s::K8sCluster;
use crate::crd::FlinkApplication;

/// Render the task manager deployment without generation naming.
///
/// This is the hashed form: no name, no fingerprint label, no owner
/// reference. Everything derived from the spec is present.
pub fn render_task_manager(app: &FlinkApplication) -> Deployment {
    let mut labels = standard_labels(app);
    labels.insert(DEPLOYMENT_TYPE_LABEL.to_string(), TASK_MANAGER.to_string());
    let annotations = standard_annotations(app);

    Deployment {
        metadata: ObjectMeta {
            namespace: app.namespace(),
            labels: Some(labels.clone()),
            annotations: annotations.clone(),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.spec.task_manager_replicas()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![task_manager_container(app)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn task_manager_container(app: &FlinkApplication) -> Container {
    Container {
        name: TASK_MANAGER.to_string(),
        image: Some(app.spec.image.clone()),
        image_pull_policy: Some(app.spec.image_pull_policy.clone()),
        args: Some(vec![TASK_MANAGER.to_string()]),
        ports: Some(vec![
            container_port("data", TASK_MANAGER_DATA_PORT),
            container_port("rpc", TASK_MANAGER_RPC_PORT),
            container_port("query", QUERY_PORT),
        ]),
        env: Some(flink_env(app)),
        resources: resource_requirements(&app.spec.task_manager_config.resources),
        ..Default::default()
    }
}

pub(crate) fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

/// Fingerprint of the desired task manager deployment.
pub fn task_manager_fingerprint(app: &FlinkApplication) -> Result<String> {
    Ok(fingerprint(&render_task_manager(app))?)
}

/// Stamp a rendered deployment with its generation: name, fingerprint label
/// on the object, selector and pod template, and the owner reference.
pub(crate) fn with_generation(
    mut deployment: Deployment,
    app: &FlinkApplication,
    name: String,
    hash: &str,
) -> Deployment {
    deployment.metadata.name = Some(name);
    deployment.metadata.owner_references = Some(vec![owner_reference(app)]);
    deployment
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(APP_HASH_LABEL.to_string(), hash.to_string());

    if let Some(spec) = deployment.spec.as_mut() {
        spec.selector
            .match_labels
            .get_or_insert_with(Default::default)
            .insert(APP_HASH_LABEL.to_string(), hash.to_string());
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default)
            .insert(APP_HASH_LABEL.to_string(), hash.to_string());
    }
    deployment
}

/// Generate the task manager deployment for the desired generation.
pub fn generate_task_manager_deployment(app: &FlinkApplication) -> Result<Deployment> {
    let rendered = render_task_manager(app);
    let hash = fingerprint(&rendered)?;
    let name = task_manager_name(app, &hash);
    Ok(with_generation(rendered, app, name, &hash))
}

/// Fingerprint label of a live deployment.
pub fn deployment_hash(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(APP_HASH_LABEL))
        .map(String::as_str)
}

/// Role label of a live deployment.
pub fn deployment_role(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(DEPLOYMENT_TYPE_LABEL))
        .map(String::as_str)
}

/// Creates the task manager deployment of the desired generation.
pub struct TaskManagerController {
    k8s: Arc<dyn K8sCluster>,
}

impl TaskManagerController {
    pub fn new(k8s: Arc<dyn K8sCluster>) -> Self {
        Self { k8s }
    }
}

#[async_trait]
impl ClusterComponent for TaskManagerController {
    async fn create_if_not_exist(&self, app: &FlinkApplication) -> Result<()> {
        let deployment = generate_task_manager_deployment(app)?;
        debug!(
            name = %deployment.name_any(),
            replicas = app.spec.task_manager_replicas(),
            "Ensuring task manager deployment"
        );
        self.k8s.create_deployment_if_not_exists(&deployment).await
    }
}
