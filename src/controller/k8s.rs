//! Kubernetes access used by the controller.
//!
//! [`K8sCluster`] covers the handful of calls the lifecycle logic makes so the
//! logic can be exercised against mocks; [`KubeCluster`] is the `kube`
//! implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::context::FIELD_MANAGER;
use super::error::{Error, Result};

/// Cluster resource operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait K8sCluster: Send + Sync {
    /// List pods in `namespace` matching every label in `labels`.
    async fn get_pods_with_label(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    /// List deployments in `namespace` matching every label in `labels`.
    async fn get_deployments_with_label(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>>;

    /// Delete the given deployments. Already deleted ones are skipped.
    async fn delete_deployments(&self, deployments: Vec<Deployment>) -> Result<()>;

    /// Create a deployment unless one with the same name exists.
    async fn create_deployment_if_not_exists(&self, deployment: &Deployment) -> Result<()>;

    /// Create or update a service with server-side apply.
    async fn apply_service(&self, service: &Service) -> Result<()>;

    /// Set `spec.replicas` of an existing deployment.
    async fn scale_deployment(&self, deployment: &Deployment, replicas: i32) -> Result<()>;
}

/// Render a label map as an equality selector: `a=1,b=2`.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`K8sCluster`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespace_of<K: ResourceExt>(resource: &K) -> Result<String> {
        resource
            .namespace()
            .ok_or_else(|| Error::MissingField(format!("{}.metadata.namespace", resource.name_any())))
    }
}

#[async_trait]
impl K8sCluster for KubeCluster {
    async fn get_pods_with_label(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&label_selector(labels)))
            .await?;
        Ok(pods.items)
    }

    async fn get_deployments_with_label(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployments = api
            .list(&ListParams::default().labels(&label_selector(labels)))
            .await?;
        Ok(deployments.items)
    }

    async fn delete_deployments(&self, deployments: Vec<Deployment>) -> Result<()> {
        for deployment in deployments {
            let name = deployment.name_any();
            let namespace = Self::namespace_of(&deployment)?;
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => info!(%name, %namespace, "Deleted deployment"),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(%name, %namespace, "Deployment already deleted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn create_deployment_if_not_exists(&self, deployment: &Deployment) -> Result<()> {
        let name = deployment.name_any();
        let namespace = Self::namespace_of(deployment)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), deployment).await {
            Ok(_) => {
                info!(%name, %namespace, "Created deployment");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(%name, %namespace, "Deployment already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_service(&self, service: &Service) -> Result<()> {
        let name = service.name_any();
        let namespace = Self::namespace_of(service)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(service),
        )
        .await?;
        debug!(%name, %namespace, "Applied service");
        Ok(())
    }

    async fn scale_deployment(&self, deployment: &Deployment, replicas: i32) -> Result<()> {
        let name = deployment.name_any();
        let namespace = Self::namespace_of(deployment)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(%name, %namespace, replicas, "Scaled deployment");
        Ok(())
    }
}
