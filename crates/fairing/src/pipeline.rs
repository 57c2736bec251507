//! Ordered application of pod spec mutators

use crate::error::Result;
use crate::mutators::{MutatorContext, PodSpecMutator};
use k8s_openapi::api::core::v1::PodSpec;
use std::fmt;
use tracing::{debug, error, instrument};

/// An ordered list of mutators applied to one pod spec.
///
/// Mutators run strictly in insertion order against the same pod spec. The
/// first failure stops the run; changes made by earlier mutators stay.
#[derive(Default)]
pub struct PodSpecPipeline {
    mutators: Vec<Box<dyn PodSpecMutator>>,
}

impl PodSpecPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutator, builder style
    #[must_use]
    pub fn with(mut self, mutator: impl PodSpecMutator + 'static) -> Self {
        self.push(mutator);
        self
    }

    pub fn push(&mut self, mutator: impl PodSpecMutator + 'static) {
        self.mutators.push(Box::new(mutator));
    }

    /// Append every mutator from `other` after the existing ones
    pub fn extend(&mut self, other: PodSpecPipeline) {
        self.mutators.extend(other.mutators);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }

    /// Names of the mutators in application order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.mutators.iter().map(|m| m.name())
    }

    /// Apply every mutator to `pod_spec` in order
    #[instrument(skip(self, ctx, pod_spec), fields(deployer = %ctx.deployer, mutators = self.mutators.len()))]
    pub fn run(&self, ctx: &MutatorContext, pod_spec: &mut PodSpec, namespace: &str) -> Result<()> {
        for mutator in &self.mutators {
            debug!(mutator = mutator.name(), "Applying pod spec mutator");
            if let Err(e) = mutator.mutate(ctx, pod_spec, namespace) {
                error!(mutator = mutator.name(), error = %e, "Pod spec mutator failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PodSpecPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mutators::test_support::model_pod_spec;
    use crate::mutators::{AddEnv, MountPvc, ResourceLimits};
    use k8s_openapi::api::core::v1::EnvVar;

    fn push_env(value: &'static str) -> impl PodSpecMutator {
        move |_: &MutatorContext, pod_spec: &mut PodSpec, _: &str| -> Result<()> {
            pod_spec.containers[0]
                .env
                .get_or_insert_with(Vec::new)
                .push(EnvVar {
                    name: "STEP".to_string(),
                    value: Some(value.to_string()),
                    value_from: None,
                });
            Ok(())
        }
    }

    fn steps(pod_spec: &PodSpec) -> Vec<String> {
        pod_spec.containers[0]
            .env
            .iter()
            .flatten()
            .filter_map(|e| e.value.clone())
            .collect()
    }

    #[test]
    fn runs_mutators_in_insertion_order() {
        let pipeline = PodSpecPipeline::new()
            .with(push_env("first"))
            .with(push_env("second"))
            .with(push_env("third"));

        let mut pod_spec = model_pod_spec();
        pipeline
            .run(&MutatorContext::new("serving"), &mut pod_spec, "default")
            .unwrap();
        assert_eq!(steps(&pod_spec), vec!["first", "second", "third"]);
    }

    #[test]
    fn failure_aborts_remaining_mutators_without_rollback() {
        let fail = |_: &MutatorContext, _: &mut PodSpec, _: &str| -> Result<()> {
            Err(Error::mutator("fail", "boom"))
        };
        let pipeline = PodSpecPipeline::new()
            .with(push_env("applied"))
            .with(fail)
            .with(push_env("never"));

        let mut pod_spec = model_pod_spec();
        let result = pipeline.run(&MutatorContext::default(), &mut pod_spec, "");

        assert!(matches!(result, Err(Error::MutatorFailed { .. })));
        assert_eq!(steps(&pod_spec), vec!["applied"]);
    }

    #[test]
    fn built_in_mutators_compose() {
        let pipeline = PodSpecPipeline::new()
            .with(ResourceLimits::new().cpu(1.0).memory(2.0))
            .with(MountPvc::new("data"))
            .with(AddEnv::default().var("MODEL_DIR", "/mnt/model"));

        let mut pod_spec = model_pod_spec();
        pipeline
            .run(&MutatorContext::default(), &mut pod_spec, "kubeflow")
            .unwrap();

        let container = &pod_spec.containers[0];
        assert!(container.resources.is_some());
        assert_eq!(container.volume_mounts.as_ref().map(Vec::len), Some(1));
        assert_eq!(container.env.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            pipeline.names().collect::<Vec<_>>(),
            vec!["resource-limits", "mount-pvc", "add-env"]
        );
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let pipeline = PodSpecPipeline::new();
        let mut pod_spec = model_pod_spec();
        let before = pod_spec.clone();
        pipeline
            .run(&MutatorContext::default(), &mut pod_spec, "")
            .unwrap();
        assert!(pipeline.is_empty());
        assert_eq!(pod_spec, before);
    }

    #[test]
    fn extend_appends_after_existing() {
        let mut pipeline = PodSpecPipeline::new().with(push_env("a"));
        pipeline.extend(PodSpecPipeline::new().with(push_env("b")));
        assert_eq!(pipeline.len(), 2);

        let mut pod_spec = model_pod_spec();
        pipeline
            .run(&MutatorContext::default(), &mut pod_spec, "")
            .unwrap();
        assert_eq!(steps(&pod_spec), vec!["a", "b"]);
    }
}
