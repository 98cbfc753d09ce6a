//! flink-operator library crate
//!
//! Runs Flink applications declared as `FlinkApplication` resources: creates
//! a job manager and task managers per spec generation, submits the job, and
//! migrates it to a new cluster through a savepoint when the spec changes.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::{Config, ControllerConfig};
pub use health::HealthState;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::{context::Context, reconciler::reconcile};
use crd::FlinkApplication;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Reflector-backed stream of applied objects, filtered to spec changes.
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Count cached applications per phase. Every phase is present, empty ones
/// with zero.
pub fn phase_counts<'a>(
    apps: impl IntoIterator<Item = &'a FlinkApplication>,
) -> BTreeMap<String, i64> {
    let mut counts: BTreeMap<String, i64> = crd::ApplicationPhase::ALL
        .iter()
        .map(|p| (p.to_string(), 0))
        .collect();
    for app in apps {
        let phase = app.status.as_ref().map(|s| s.phase).unwrap_or_default();
        *counts.entry(phase.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Run the FlinkApplication controller.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controller(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: ControllerConfig,
    namespace: Option<&str>,
) -> Result<(), controller::Error> {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(
        "Starting controller for FlinkApplication resources (scope: {})",
        scope_msg
    );

    let ctx = Arc::new(Context::new(client.clone(), health_state.clone(), config)?);

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let applications: Api<FlinkApplication> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);

    let watcher_config = default_watcher_config();
    let (reader, resource_stream) = create_filtered_stream(applications, watcher_config.clone());
    let store = reader.clone();

    // Deployments are read in full for pod template labels; services only
    // need to trigger a reconcile, so metadata is enough.
    Controller::for_stream(resource_stream, reader)
        .owns(deployments, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config).touched_objects())
        .run(reconcile, controller::reconciler::error_policy, ctx)
        .for_each(|result| {
            let store = store.clone();
            let health_state = health_state.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled: {}", obj.name);
                    }
                    Err(e) => {
                        // Deleted objects still get queued by owned-resource events.
                        let is_not_found = match &e {
                            kube::runtime::controller::Error::ObjectNotFound(_) => true,
                            kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                                err.is_not_found()
                            }
                            _ => false,
                        };
                        if is_not_found {
                            debug!("Object no longer exists (likely deleted): {:?}", e);
                        } else {
                            error!("Reconciliation error: {:?}", e);
                        }
                    }
                }
                if let Some(state) = health_state {
                    let apps = store.state();
                    for (phase, count) in phase_counts(apps.iter().map(|a| a.as_ref())) {
                        state.metrics.set_applications_by_phase(&phase, count);
                    }
                }
            }
        })
        .await;

    error!("Controller stream ended unexpectedly");
    Ok(())
}
