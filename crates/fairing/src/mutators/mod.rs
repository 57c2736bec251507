//! Pod spec mutators
//!
//! A mutator transforms a pod spec in place before it is wrapped into a
//! Deployment or builder Pod. Mutators are small value types holding their
//! construction-time parameters; they carry no other state and can be applied
//! any number of times.
//!
//! Every built-in mutator acts on the first container only and tolerates a
//! pod spec without containers.

use crate::error::Result;
use k8s_openapi::api::core::v1::{Container, PodSpec};

pub mod env;
pub mod resources;
pub mod volumes;

pub use env::{build_env_list, AddEnv, EnvValue, EnvVars, ReferenceType, SkippedEnvEntry};
pub use resources::ResourceLimits;
pub use volumes::MountPvc;

/// Information about the invocation a mutator runs in
#[derive(Debug, Clone, Default)]
pub struct MutatorContext {
    /// Kind of workload being assembled ("serving", "builder")
    pub deployer: String,
    /// Unique identifier of this deploy/build, when one has been assigned
    pub run_id: Option<String>,
}

impl MutatorContext {
    #[must_use]
    pub fn new(deployer: impl Into<String>) -> Self {
        Self {
            deployer: deployer.into(),
            run_id: None,
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// A composable transformation applied to a pod spec
pub trait PodSpecMutator: Send + Sync {
    /// Name used in logs and error reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Mutate `pod_spec` in place. Returning an error aborts the pipeline.
    fn mutate(&self, ctx: &MutatorContext, pod_spec: &mut PodSpec, namespace: &str) -> Result<()>;
}

impl<F> PodSpecMutator for F
where
    F: Fn(&MutatorContext, &mut PodSpec, &str) -> Result<()> + Send + Sync,
{
    fn mutate(&self, ctx: &MutatorContext, pod_spec: &mut PodSpec, namespace: &str) -> Result<()> {
        self(ctx, pod_spec, namespace)
    }
}

/// The container built-in mutators act on
pub(crate) fn first_container_mut(pod_spec: &mut PodSpec) -> Option<&mut Container> {
    pod_spec.containers.first_mut()
}

#[cfg(test)]
pub(crate) mod test_support {
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    /// Pod spec with a single bare container, as most callers start from
    pub fn model_pod_spec() -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "model".to_string(),
                image: Some("image".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}
