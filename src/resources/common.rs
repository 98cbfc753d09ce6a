//! Common resource generation utilities.
//!
//! Label conventions, names and owner references shared by the job manager
//! and task manager builders.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{FlinkApplication, ResourceSpec};

/// Stable application identity label.
pub const APP_LABEL: &str = "app";
/// Cluster role label (`jobmanager` / `taskmanager`).
pub const DEPLOYMENT_TYPE_LABEL: &str = "flink-deployment-type";
/// Generation fingerprint label.
pub const APP_HASH_LABEL: &str = "flink-app-hash";

pub const JOB_MANAGER: &str = "jobmanager";
pub const TASK_MANAGER: &str = "taskmanager";

/// Job manager REST port.
pub const JOB_MANAGER_UI_PORT: i32 = 8081;
/// Job manager RPC port.
pub const JOB_MANAGER_RPC_PORT: i32 = 6123;
/// Job manager blob server port.
pub const JOB_MANAGER_BLOB_PORT: i32 = 6124;
/// Queryable state port, on both roles.
pub const QUERY_PORT: i32 = 6125;
/// Task manager data port.
pub const TASK_MANAGER_DATA_PORT: i32 = 6121;
/// Task manager RPC port.
pub const TASK_MANAGER_RPC_PORT: i32 = 6122;

const MANAGED_BY: &str = "flink-operator";

/// Standard labels applied to all managed resources.
///
/// Contains the stable `app` label plus the recommended
/// `app.kubernetes.io/*` set, merged with user labels. User labels cannot
/// override `app`.
pub fn standard_labels(app: &FlinkApplication) -> BTreeMap<String, String> {
    let name = app.name_any();
    let mut labels = BTreeMap::new();

    for (key, value) in &app.spec.labels {
        labels.insert(key.clone(), value.clone());
    }

    labels.insert("app.kubernetes.io/name".to_string(), name.clone());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(APP_LABEL.to_string(), name);
    labels
}

/// Labels for one role of one generation. Used as the pod selector.
pub fn role_labels(app: &FlinkApplication, role: &str, hash: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), app.name_any());
    labels.insert(DEPLOYMENT_TYPE_LABEL.to_string(), role.to_string());
    labels.insert(APP_HASH_LABEL.to_string(), hash.to_string());
    labels
}

/// Selector matching every resource of the application, any generation.
pub fn app_selector(app: &FlinkApplication) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app.name_any())])
}

/// Selector matching every pod of one generation.
pub fn generation_selector(hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_HASH_LABEL.to_string(), hash.to_string())])
}

/// User annotations, if any.
pub fn standard_annotations(app: &FlinkApplication) -> Option<BTreeMap<String, String>> {
    if app.spec.annotations.is_empty() {
        None
    } else {
        Some(app.spec.annotations.clone())
    }
}

/// Create owner reference for a FlinkApplication.
pub fn owner_reference(app: &FlinkApplication) -> OwnerReference {
    OwnerReference {
        api_version: "flink.k8s.io/v1alpha1".to_string(),
        kind: "FlinkApplication".to_string(),
        name: app.name_any(),
        uid: app.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// `<app>-<hash>-tm`
pub fn task_manager_name(app: &FlinkApplication, hash: &str) -> String {
    format!("{}-{}-tm", app.name_any(), hash)
}

/// `<app>-<hash>-jm`
pub fn job_manager_name(app: &FlinkApplication, hash: &str) -> String {
    format!("{}-{}-jm", app.name_any(), hash)
}

/// `<app>-jm`, stable across generations.
pub fn job_manager_service_name(app: &FlinkApplication) -> String {
    format!("{}-jm", app.name_any())
}

/// Base URL of the job manager REST endpoint: `http://<app>-jm.<namespace>:8081`.
pub fn job_manager_url(app: &FlinkApplication) -> String {
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    format!(
        "http://{}.{}:{}",
        job_manager_service_name(app),
        namespace,
        JOB_MANAGER_UI_PORT
    )
}

/// `FLINK_PROPERTIES` content shared by both roles: the job manager address,
/// the slot count, default parallelism and user properties, one per line.
pub fn flink_properties(app: &FlinkApplication) -> String {
    let mut properties = BTreeMap::new();
    for (key, value) in &app.spec.flink_config {
        properties.insert(key.clone(), value.clone());
    }
    properties.insert(
        "jobmanager.rpc.address".to_string(),
        job_manager_service_name(app),
    );
    properties.insert(
        "taskmanager.numberOfTaskSlots".to_string(),
        app.spec.task_slots().to_string(),
    );
    properties.insert(
        "parallelism.default".to_string(),
        app.spec.parallelism.to_string(),
    );

    properties
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn flink_env(app: &FlinkApplication) -> Vec<EnvVar> {
    vec![EnvVar {
        name: "FLINK_PROPERTIES".to_string(),
        value: Some(flink_properties(app)),
        ..Default::default()
    }]
}

/// Requests (and equal limits) from the CRD resource spec.
pub fn resource_requirements(spec: &ResourceSpec) -> Option<ResourceRequirements> {
    let mut quantities = BTreeMap::new();
    if let Some(cpu) = &spec.cpu {
        quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.memory {
        quantities.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if quantities.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    })
}
