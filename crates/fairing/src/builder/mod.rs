//! In-cluster image builds
//!
//! A [`ClusterBuilder`] runs one kaniko pod per build: the context source
//! stages the archive and describes the builder pod, the pod is created and
//! followed until it exits, then the pod and staged context are cleaned up.

pub mod context;

pub use context::{BuildContext, ContextSource, PvcContextSource};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::mutators::MutatorContext;
use crate::pipeline::PodSpecPipeline;
use fairing_config::constants::{
    BUILDER_DEPLOYER_TYPE, DEFAULT_IMAGE_NAME, KANIKO_BUILDER, LABEL_BUILDER,
};
use fairing_config::FairingConfig;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

pub const BUILDER_GENERATE_NAME: &str = "fairing-builder-";

const DEFAULT_POD_START_TIMEOUT: Duration = Duration::from_secs(300);

/// `<registry>/<image_name>:<tag>`
#[must_use]
pub fn full_image_name(registry: &str, image_name: &str, tag: &str) -> String {
    format!("{}/{image_name}:{tag}", registry.trim_end_matches('/'))
}

/// Builder pod wrapping `pod_spec`
pub fn generate_builder_pod(pod_spec: &PodSpec) -> Result<Pod> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_BUILDER.to_string(), KANIKO_BUILDER.to_string());

    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "generateName": BUILDER_GENERATE_NAME,
            "labels": labels
        },
        "spec": serde_json::to_value(pod_spec)?
    });

    Ok(serde_json::from_value(pod)?)
}

/// Builds container images inside the cluster
pub struct ClusterBuilder {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    registry: String,
    image_name: String,
    push: bool,
    cleanup: bool,
    pod_start_timeout: Duration,
    context_source: Box<dyn ContextSource>,
    pipeline: PodSpecPipeline,
    image_tag: Option<String>,
}

impl ClusterBuilder {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        registry: impl Into<String>,
        context_source: Box<dyn ContextSource>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            registry: registry.into(),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            push: true,
            cleanup: true,
            pod_start_timeout: DEFAULT_POD_START_TIMEOUT,
            context_source,
            pipeline: PodSpecPipeline::new(),
            image_tag: None,
        }
    }

    /// Builder configured from the top-level registry and `builder` section
    pub fn from_config(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        config: &FairingConfig,
        context_source: Box<dyn ContextSource>,
    ) -> Result<Self> {
        let registry = config
            .registry
            .clone()
            .ok_or_else(|| Error::config("a registry is required to build images"))?;
        let builder = &config.builder;
        Ok(Self::new(cluster, namespace, registry, context_source)
            .with_push(builder.push)
            .with_cleanup(builder.cleanup)
            .with_pod_start_timeout(Duration::from_secs(builder.pod_start_timeout_seconds)))
    }

    #[must_use]
    pub fn with_image_name(mut self, image_name: impl Into<String>) -> Self {
        self.image_name = image_name.into();
        self
    }

    #[must_use]
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Delete the builder pod once it finishes
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    #[must_use]
    pub fn with_pod_start_timeout(mut self, timeout: Duration) -> Self {
        self.pod_start_timeout = timeout;
        self
    }

    /// Extra mutators applied to the builder pod spec
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PodSpecPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Tag of the last successful build
    #[must_use]
    pub fn image_tag(&self) -> Option<&str> {
        self.image_tag.as_deref()
    }

    /// Builder pod for `context` without submitting it.
    ///
    /// The staged context is released again if the pod cannot be assembled.
    pub async fn render(&mut self, context: &BuildContext) -> Result<(String, Pod)> {
        let image_tag = full_image_name(&self.registry, &self.image_name, &context.hash);
        self.context_source.prepare(context).await?;

        match self.assemble_pod(&image_tag) {
            Ok(pod) => Ok((image_tag, pod)),
            Err(e) => {
                self.cleanup_context().await;
                Err(e)
            }
        }
    }

    fn assemble_pod(&self, image_tag: &str) -> Result<Pod> {
        let mut pod_spec = self.context_source.generate_pod_spec(image_tag, self.push)?;
        self.pipeline.run(
            &MutatorContext::new(BUILDER_DEPLOYER_TYPE),
            &mut pod_spec,
            &self.namespace,
        )?;
        generate_builder_pod(&pod_spec)
    }

    /// Build and (unless disabled) push the image for `context`.
    ///
    /// Returns the image tag once the builder pod's log stream closes.
    #[instrument(skip(self, context), fields(namespace = %self.namespace, hash = %context.hash))]
    pub async fn build(&mut self, context: &BuildContext) -> Result<String> {
        let (image_tag, pod) = self.render(context).await?;
        info!(image = %image_tag, "Starting in-cluster build");

        let pod_name = match self.submit(&pod).await {
            Ok(name) => name,
            Err(e) => {
                self.cleanup_context().await;
                return Err(e);
            }
        };
        info!(pod = %pod_name, "Created builder pod");

        let outcome = self.follow(&pod_name).await;
        self.cleanup_build(&pod_name).await;
        outcome?;

        info!(image = %image_tag, "Build finished");
        self.image_tag = Some(image_tag.clone());
        Ok(image_tag)
    }

    async fn submit(&self, pod: &Pod) -> Result<String> {
        self.cluster
            .create_pod(&self.namespace, pod)
            .await?
            .metadata
            .name
            .ok_or_else(|| Error::MissingMetadata("builder pod name".to_string()))
    }

    async fn follow(&self, pod_name: &str) -> Result<()> {
        self.cluster
            .wait_for_pod_start(&self.namespace, pod_name, self.pod_start_timeout)
            .await?;
        self.cluster
            .follow_pod_logs(&self.namespace, pod_name)
            .await?;
        Ok(())
    }

    async fn cleanup_context(&mut self) {
        if let Err(e) = self.context_source.cleanup().await {
            warn!(error = %e, "Failed to clean up build context");
        }
    }

    async fn cleanup_build(&mut self, pod_name: &str) {
        self.cleanup_context().await;
        if !self.cleanup {
            info!(pod = %pod_name, "Leaving builder pod in place");
            return;
        }
        match self.cluster.delete_pod(&self.namespace, pod_name).await {
            Ok(()) => info!(pod = %pod_name, "Deleted builder pod"),
            Err(e) => error!(pod = %pod_name, error = %e, "Failed to delete builder pod"),
        }
    }
}
