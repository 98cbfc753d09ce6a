//! Operator configuration.
//!
//! [`Config`] is parsed from the command line with environment fallbacks and
//! converted into the plain [`ControllerConfig`] the controller consumes.

use std::time::Duration;

use clap::Parser;

/// Kubernetes operator for Flink applications
#[derive(Parser, Debug, Clone)]
#[command(name = "flink-operator")]
#[command(about = "Runs Flink applications and migrates them between clusters with savepoints")]
#[command(version)]
pub struct Config {
    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Task managers whose last heartbeat is older than this are unhealthy
    #[arg(long, env = "HEARTBEAT_THRESHOLD_SECS", default_value_t = 30)]
    pub heartbeat_threshold_secs: u64,

    /// Timeout for each job manager REST call
    #[arg(long, env = "FLINK_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub flink_request_timeout_secs: u64,

    /// Requeue interval for applications in a steady state
    #[arg(long, env = "REQUEUE_INTERVAL_SECS", default_value_t = 30)]
    pub requeue_interval_secs: u64,

    /// Requeue interval while waiting on the cluster or the job manager
    #[arg(long, env = "TRANSITION_REQUEUE_SECS", default_value_t = 5)]
    pub transition_requeue_secs: u64,

    /// Port for the health and metrics server
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Enable leader election for high availability
    #[arg(long, env = "LEADER_ELECTION", default_value = "true")]
    pub leader_election: bool,

    /// Name of the leader election lease
    #[arg(long, env = "LEASE_NAME", default_value = "flink-operator-leader")]
    pub lease_name: String,

    /// Lease time-to-live
    #[arg(long, env = "LEASE_TTL_SECS", default_value_t = 15)]
    pub lease_ttl_secs: u64,

    /// Interval between lease renewals
    #[arg(long, env = "LEASE_RENEW_INTERVAL_SECS", default_value_t = 5)]
    pub lease_renew_interval_secs: u64,

    /// Print the CustomResourceDefinition as JSON and exit
    #[arg(long)]
    pub print_crd: bool,
}

impl Config {
    /// Watched namespace, `None` for cluster-wide.
    pub fn namespace(&self) -> Option<&str> {
        if self.watch_namespace.is_empty() {
            None
        } else {
            Some(&self.watch_namespace)
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            heartbeat_threshold: Duration::from_secs(self.heartbeat_threshold_secs),
            flink_request_timeout: Duration::from_secs(self.flink_request_timeout_secs),
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
            transition_requeue: Duration::from_secs(self.transition_requeue_secs),
        }
    }
}

/// Settings consumed by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Heartbeat freshness window for task manager health.
    pub heartbeat_threshold: Duration,
    /// Timeout for each job manager REST call.
    pub flink_request_timeout: Duration,
    /// Requeue interval while `Running`.
    pub requeue_interval: Duration,
    /// Requeue interval in waiting phases.
    pub transition_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold: Duration::from_secs(30),
            flink_request_timeout: Duration::from_secs(10),
            requeue_interval: Duration::from_secs(30),
            transition_requeue: Duration::from_secs(5),
        }
    }
}
