//! Job manager Deployment and Service generation.
//!
//! The job manager deployment carries the task manager fingerprint so both
//! roles of a generation share one `flink-app-hash` label. The service is
//! stable across generations and its selector is pinned to the generation
//! most recently created.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::debug;

use super::ClusterComponent;
use super::common::{
    DEPLOYMENT_TYPE_LABEL, JOB_MANAGER, JOB_MANAGER_BLOB_PORT, JOB_MANAGER_RPC_PORT,
    JOB_MANAGER_UI_PORT, QUERY_PORT, flink_env, job_manager_name, job_manager_service_name,
    owner_reference, resource_requirements, role_labels, standard_annotations, standard_labels,
};
use super::task_manager::{container_port, task_manager_fingerprint, with_generation};
use crate::controller::error::Result;
use crate::controller::k8s::K8sCluster;
use crate::crd::FlinkApplication;

/// Generate the job manager deployment for the generation `hash`.
pub fn generate_job_manager_deployment(app: &FlinkApplication, hash: &str) -> Deployment {
    let mut labels = standard_labels(app);
    labels.insert(DEPLOYMENT_TYPE_LABEL.to_string(), JOB_MANAGER.to_string());
    let annotations = standard_annotations(app);

    let rendered = Deployment {
        metadata: ObjectMeta {
            namespace: app.namespace(),
            labels: Some(labels.clone()),
            annotations: annotations.clone(),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
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
                    containers: vec![job_manager_container(app)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    with_generation(rendered, app, job_manager_name(app, hash), hash)
}

fn job_manager_container(app: &FlinkApplication) -> Container {
    Container {
        name: JOB_MANAGER.to_string(),
        image: Some(app.spec.image.clone()),
        image_pull_policy: Some(app.spec.image_pull_policy.clone()),
        args: Some(vec![JOB_MANAGER.to_string()]),
        ports: Some(vec![
            container_port("rpc", JOB_MANAGER_RPC_PORT),
            container_port("blob", JOB_MANAGER_BLOB_PORT),
            container_port("query", QUERY_PORT),
            container_port("ui", JOB_MANAGER_UI_PORT),
        ]),
        env: Some(flink_env(app)),
        resources: resource_requirements(&app.spec.job_manager_config.resources),
        ..Default::default()
    }
}

/// Generate the `<app>-jm` service, routing to the job manager of `hash`.
pub fn generate_job_manager_service(app: &FlinkApplication, hash: &str) -> Service {
    let selector: BTreeMap<String, String> = role_labels(app, JOB_MANAGER, hash);

    Service {
        metadata: ObjectMeta {
            name: Some(job_manager_service_name(app)),
            namespace: app.namespace(),
            labels: Some(standard_labels(app)),
            annotations: standard_annotations(app),
            owner_references: Some(vec![owner_reference(app)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![
                service_port("rpc", JOB_MANAGER_RPC_PORT),
                service_port("blob", JOB_MANAGER_BLOB_PORT),
                service_port("query", QUERY_PORT),
                service_port("ui", JOB_MANAGER_UI_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Creates the job manager deployment and points the service at it.
pub struct JobManagerController {
    k8s: Arc<dyn K8sCluster>,
}

impl JobManagerController {
    pub fn new(k8s: Arc<dyn K8sCluster>) -> Self {
        Self { k8s }
    }
}

#[async_trait]
impl ClusterComponent for JobManagerController {
    async fn create_if_not_exist(&self, app: &FlinkApplication) -> Result<()> {
        let hash = task_manager_fingerprint(app)?;
        let deployment = generate_job_manager_deployment(app, &hash);
        debug!(name = %deployment.name_any(), %hash, "Ensuring job manager deployment");
        self.k8s.create_deployment_if_not_exists(&deployment).await?;
        self.k8s
            .apply_service(&generate_job_manager_service(app, &hash))
            .await
    }
}
