//! Test fixtures and builder patterns for FlinkApplication.

use flink_operator::crd::{
    FlinkApplication, FlinkApplicationSpec, FlinkApplicationStatus, SavepointInfo,
    TaskManagerConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Builder for creating FlinkApplication test fixtures.
///
/// # Example
/// ```ignore
/// let app = FlinkApplicationBuilder::new("wordcount")
///     .namespace("streaming")
///     .parallelism(8)
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct FlinkApplicationBuilder {
    name: String,
    namespace: Option<String>,
    spec: FlinkApplicationSpec,
    generation: Option<i64>,
    uid: Option<String>,
    status: Option<FlinkApplicationStatus>,
}

impl FlinkApplicationBuilder {
    /// Create a new builder with the given application name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            spec: FlinkApplicationSpec {
                image: "flink:1.7".to_string(),
                jar_name: "job.jar".to_string(),
                ..Default::default()
            },
            generation: None,
            uid: None,
            status: None,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.spec.image = image.into();
        self
    }

    pub fn parallelism(mut self, parallelism: i32) -> Self {
        self.spec.parallelism = parallelism;
        self
    }

    pub fn task_slots(mut self, slots: i32) -> Self {
        self.spec.task_manager_config = TaskManagerConfig {
            task_slots: Some(slots),
            ..self.spec.task_manager_config
        };
        self
    }

    pub fn jar_name(mut self, jar_name: impl Into<String>) -> Self {
        self.spec.jar_name = jar_name.into();
        self
    }

    pub fn entry_class(mut self, entry_class: impl Into<String>) -> Self {
        self.spec.entry_class = entry_class.into();
        self
    }

    pub fn program_args(mut self, args: impl Into<String>) -> Self {
        self.spec.program_args = args.into();
        self
    }

    pub fn flink_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.flink_config.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.labels.insert(key.into(), value.into());
        self
    }

    /// Restore source for the first submission.
    pub fn savepoint_location(mut self, location: impl Into<String>) -> Self {
        self.spec.savepoint_info.savepoint_location = Some(location.into());
        self
    }

    pub fn savepoint_on_update(mut self, enabled: bool) -> Self {
        self.spec.savepoint_info = SavepointInfo {
            savepoint_on_update: enabled,
            ..self.spec.savepoint_info
        };
        self
    }

    /// Set the generation (for testing status updates).
    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Set the UID (for testing owner references).
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn status(mut self, status: FlinkApplicationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the FlinkApplication.
    pub fn build(self) -> FlinkApplication {
        FlinkApplication {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: self.namespace,
                generation: self.generation,
                uid: self.uid,
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

impl Default for FlinkApplicationBuilder {
    fn default() -> Self {
        Self::new("app-name")
    }
}

/// Application with common test defaults in namespace `ns`.
pub fn test_app(name: &str) -> FlinkApplication {
    FlinkApplicationBuilder::new(name)
        .namespace("ns")
        .generation(1)
        .uid(format!("test-uid-{}", name))
        .build()
}
