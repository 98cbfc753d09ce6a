//! flink-operator - A Kubernetes operator for FlinkApplication resources.
//!
//! This is the main entry point that:
//! - Parses configuration and initializes structured logging
//! - Creates the Kubernetes client
//! - Runs leader election (required for HA deployments)
//! - Starts the controller and the health server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use flink_operator::crd::FlinkApplication;
use flink_operator::health::{HealthState, run_health_server};
use flink_operator::{Config, run_controller};

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

fn init_tracing(json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("flink_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn lease_lock(client: &Client, namespace: &str, holder_id: &str, config: &Config) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: config.lease_name.clone(),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
        },
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    if config.print_crd {
        println!("{}", serde_json::to_string_pretty(&FlinkApplication::crd())?);
        return Ok(());
    }

    init_tracing(config.log_json)?;
    info!("Starting flink-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes must answer even while waiting for leadership.
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease_renewal_handle = if config.leader_election {
        let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        info!(
            holder_id = %pod_name,
            namespace = %namespace,
            lease_name = %config.lease_name,
            "Initializing leader election"
        );

        let renew_interval = Duration::from_secs(config.lease_renew_interval_secs);
        let lock = lease_lock(&client, &namespace, &pod_name, &config);

        info!("Waiting to acquire leadership...");
        loop {
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    break;
                }
                Ok(_) => info!("Another instance is leader, waiting..."),
                Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
            }
            tokio::time::sleep(renew_interval).await;
        }

        Some(tokio::spawn(renew_lease(lock, renew_interval)))
    } else {
        info!("Leader election disabled");
        None
    };

    let controller_handle = {
        let health_state = health_state.clone();
        let controller_client = client.clone();
        let controller_config = config.controller_config();
        let namespace = config.namespace().map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = run_controller(
                controller_client,
                Some(health_state),
                controller_config,
                namespace.as_deref(),
            )
            .await
            {
                error!("Controller failed to start: {}", e);
            }
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Lease renewal only exits via process::exit() or panic
        Err(e) = async {
            match lease_renewal_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Keep the lease, exiting the process once it is lost so Kubernetes
/// restarts us into a fresh election.
#[allow(clippy::exit)]
async fn renew_lease(lock: LeaseLock, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Lost leadership, shutting down");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "Failed to renew lease, shutting down");
                std::process::exit(1);
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
