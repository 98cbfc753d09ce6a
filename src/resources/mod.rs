//! Resource generation module.
//!
//! Contains the builders for the Kubernetes resources owned by a FlinkApplication.
//!
//! ## Resources Generated
//!
//! | Resource | Name | Purpose |
//! |----------|------|---------|
//! | Deployment | `<app>-<hash>-jm` | Job manager of one generation |
//! | Deployment | `<app>-<hash>-tm` | Task managers of one generation |
//! | Service | `<app>-jm` | Job manager REST and RPC endpoint |
//!
//! `<hash>` is the fingerprint of the rendered task manager deployment.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::Result;
use crate::crd::FlinkApplication;

pub mod common;
pub mod hash;
pub mod job_manager;
pub mod task_manager;

pub use common::{job_manager_url, owner_reference, standard_labels};
pub use job_manager::JobManagerController;
pub use task_manager::{TaskManagerController, task_manager_fingerprint};

/// One role of a Flink cluster that can be created idempotently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterComponent: Send + Sync {
    /// Ensure the resources of the desired generation exist. Existing
    /// resources are left untouched.
    async fn create_if_not_exist(&self, app: &FlinkApplication) -> Result<()>;
}
