//! Serving deploy and teardown workflow

use super::spec::{
    cluster_endpoint_url, external_endpoint_url, generate_deployment_spec, generate_service_spec,
    inject_serving_command, serving_labels, SeldonServing,
};
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::mutators::MutatorContext;
use crate::pipeline::PodSpecPipeline;
use fairing_config::constants::{DEFAULT_CLUSTER_DOMAIN, SERVING_DEPLOYER_TYPE};
use fairing_config::{FairingConfig, ServiceType};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PodSpec, Service};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(600);

/// Objects produced for one serving deploy, before submission
#[derive(Debug, Clone)]
pub struct RenderedServing {
    pub run_id: String,
    pub deployment: Deployment,
    pub service: Service,
}

/// Handles to a submitted serving deploy.
///
/// Recorded as soon as the Deployment exists; `service_name` and `url` stay
/// `None` when a later step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedServing {
    pub namespace: String,
    pub run_id: String,
    pub deployment_name: String,
    pub service_name: Option<String>,
    pub url: Option<String>,
}

/// Which teardown deletions succeeded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownOutcome {
    pub service_deleted: bool,
    pub deployment_deleted: bool,
}

impl TeardownOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.service_deleted && self.deployment_deleted
    }
}

/// Deploys a pod spec as a Deployment plus Service and returns its URL
pub struct ServingDeployer {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    labels: BTreeMap<String, String>,
    service_type: ServiceType,
    pipeline: PodSpecPipeline,
    seldon: Option<SeldonServing>,
    cluster_domain: String,
    endpoint_timeout: Duration,
    output: bool,
    deployed: Option<DeployedServing>,
}

impl ServingDeployer {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            service_type: ServiceType::default(),
            pipeline: PodSpecPipeline::new(),
            seldon: None,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            output: false,
            deployed: None,
        }
    }

    /// Deployer configured from the `serving` section.
    ///
    /// With seldon enabled a serving class is required.
    pub fn from_config(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        config: &FairingConfig,
        seldon: Option<SeldonServing>,
    ) -> Result<Self> {
        let serving = &config.serving;
        let seldon = if serving.use_seldon {
            Some(seldon.ok_or_else(|| {
                Error::config("seldon serving is enabled but no serving class was given")
            })?)
        } else {
            None
        };

        let mut deployer = Self::new(cluster, namespace)
            .with_service_type(serving.service_type)
            .with_cluster_domain(serving.cluster_domain.clone())
            .with_endpoint_timeout(Duration::from_secs(serving.endpoint_timeout_seconds));
        deployer.seldon = seldon;
        Ok(deployer)
    }

    #[must_use]
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    #[must_use]
    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    /// Mutators applied to the pod spec before command injection
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PodSpecPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    #[must_use]
    pub fn with_seldon(mut self, seldon: SeldonServing) -> Self {
        self.seldon = Some(seldon);
        self
    }

    #[must_use]
    pub fn with_cluster_domain(mut self, cluster_domain: impl Into<String>) -> Self {
        self.cluster_domain = cluster_domain.into();
        self
    }

    #[must_use]
    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    /// Log the generated objects before submitting them
    #[must_use]
    pub fn with_output(mut self, output: bool) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Objects created by the last deploy, including a partial one
    #[must_use]
    pub fn deployed(&self) -> Option<&DeployedServing> {
        self.deployed.as_ref()
    }

    /// Run the pipeline, inject the serving command and build both objects
    /// under a fresh run id. Nothing is submitted.
    pub fn render(&self, mut pod_spec: PodSpec) -> Result<RenderedServing> {
        let run_id = Uuid::new_v4().to_string();
        let ctx = MutatorContext::new(SERVING_DEPLOYER_TYPE).with_run_id(run_id.clone());
        self.pipeline.run(&ctx, &mut pod_spec, &self.namespace)?;
        inject_serving_command(&mut pod_spec, self.seldon.as_ref());

        let labels = serving_labels(&self.labels, &run_id);
        let deployment = generate_deployment_spec(&pod_spec, &labels)?;
        let service = generate_service_spec(&labels, self.service_type)?;
        Ok(RenderedServing {
            run_id,
            deployment,
            service,
        })
    }

    /// Submit the Deployment, then the Service, and return the prediction URL.
    ///
    /// API errors propagate unretried. Whatever was created before the failure
    /// is left in place and recorded, so [`delete`](Self::delete) can remove it.
    #[instrument(skip(self, pod_spec), fields(namespace = %self.namespace))]
    pub async fn deploy(&mut self, pod_spec: PodSpec) -> Result<String> {
        let rendered = self.render(pod_spec)?;
        if self.output {
            warn!(
                deployment = %serde_json::to_string(&rendered.deployment)?,
                service = %serde_json::to_string(&rendered.service)?,
                "Generated serving objects"
            );
        }

        let deployment = self
            .cluster
            .create_deployment(&self.namespace, &rendered.deployment)
            .await?;
        let deployment_name = deployment
            .metadata
            .name
            .ok_or_else(|| Error::MissingMetadata("deployment name".to_string()))?;
        info!(deployment = %deployment_name, run_id = %rendered.run_id, "Created serving deployment");
        self.deployed = Some(DeployedServing {
            namespace: self.namespace.clone(),
            run_id: rendered.run_id,
            deployment_name,
            service_name: None,
            url: None,
        });

        let service = self
            .cluster
            .create_service(&self.namespace, &rendered.service)
            .await?;
        let service_name = service
            .metadata
            .name
            .ok_or_else(|| Error::MissingMetadata("service name".to_string()))?;
        info!(service = %service_name, "Created serving service");
        if let Some(deployed) = self.deployed.as_mut() {
            deployed.service_name = Some(service_name.clone());
        }

        let url = match self.service_type {
            ServiceType::LoadBalancer => {
                let host = self
                    .cluster
                    .service_external_endpoint(&self.namespace, &service_name, self.endpoint_timeout)
                    .await?;
                external_endpoint_url(&host)
            }
            ServiceType::ClusterIP | ServiceType::NodePort => {
                cluster_endpoint_url(&service_name, &self.namespace, &self.cluster_domain)
            }
        };
        info!(url = %url, "Serving endpoint ready");

        if let Some(deployed) = self.deployed.as_mut() {
            deployed.url = Some(url.clone());
        }
        Ok(url)
    }

    /// Tear down the last deploy.
    ///
    /// A Service that was never created counts as deleted.
    pub async fn delete(&mut self) -> Result<TeardownOutcome> {
        let deployed = self.deployed.take().ok_or(Error::NotDeployed)?;
        let cluster = self.cluster.as_ref();
        let service_deleted = match &deployed.service_name {
            Some(service_name) => delete_service(cluster, &deployed.namespace, service_name).await,
            None => true,
        };
        let deployment_deleted =
            delete_deployment(cluster, &deployed.namespace, &deployed.deployment_name).await;
        Ok(TeardownOutcome {
            service_deleted,
            deployment_deleted,
        })
    }
}

/// Delete a serving Service, then its Deployment with foreground propagation.
///
/// Each failure is logged and does not stop the other deletion.
#[instrument(skip(cluster))]
pub async fn teardown(
    cluster: &dyn ClusterApi,
    namespace: &str,
    deployment_name: &str,
    service_name: &str,
) -> TeardownOutcome {
    TeardownOutcome {
        service_deleted: delete_service(cluster, namespace, service_name).await,
        deployment_deleted: delete_deployment(cluster, namespace, deployment_name).await,
    }
}

async fn delete_service(cluster: &dyn ClusterApi, namespace: &str, service_name: &str) -> bool {
    match cluster.delete_service(namespace, service_name).await {
        Ok(()) => {
            info!(service = %service_name, "Deleted serving service");
            true
        }
        Err(e) => {
            error!(service = %service_name, error = %e, "Failed to delete serving service");
            false
        }
    }
}

async fn delete_deployment(cluster: &dyn ClusterApi, namespace: &str, deployment_name: &str) -> bool {
    match cluster.delete_deployment(namespace, deployment_name).await {
        Ok(()) => {
            info!(deployment = %deployment_name, "Deleted serving deployment");
            true
        }
        Err(e) => {
            error!(deployment = %deployment_name, error = %e, "Failed to delete serving deployment");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::mutators::test_support::model_pod_spec;
    use crate::mutators::ResourceLimits;
    use mockall::Sequence;

    fn not_found() -> Error {
        Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }))
    }

    fn named<K: Clone>(obj: &K, set: impl FnOnce(&mut K)) -> K {
        let mut obj = obj.clone();
        set(&mut obj);
        obj
    }

    fn expect_creates(mock: &mut MockClusterApi, seq: &mut Sequence) {
        mock.expect_create_deployment()
            .times(1)
            .in_sequence(seq)
            .withf(|ns, _| ns == "kubeflow")
            .returning(|_, d| {
                Ok(named(d, |d: &mut Deployment| {
                    d.metadata.name = Some("fairing-deployer-x1".to_string());
                }))
            });
        mock.expect_create_service()
            .times(1)
            .in_sequence(seq)
            .withf(|ns, _| ns == "kubeflow")
            .returning(|_, s| {
                Ok(named(s, |s: &mut Service| {
                    s.metadata.name = Some("fairing-service-x2".to_string());
                }))
            });
    }

    #[tokio::test]
    async fn deploy_creates_deployment_then_service() {
        let mut mock = MockClusterApi::new();
        let mut seq = Sequence::new();
        expect_creates(&mut mock, &mut seq);

        let mut deployer = ServingDeployer::new(Arc::new(mock), "kubeflow")
            .with_seldon(SeldonServing::new("Model"));
        let url = deployer.deploy(model_pod_spec()).await.unwrap();

        assert_eq!(
            url,
            "http://fairing-service-x2.kubeflow.svc.cluster.local:5000/predict"
        );
        let deployed = deployer.deployed().unwrap();
        assert_eq!(deployed.deployment_name, "fairing-deployer-x1");
        assert_eq!(deployed.service_name.as_deref(), Some("fairing-service-x2"));
        assert_eq!(deployed.url.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn load_balancer_waits_for_external_host() {
        let mut mock = MockClusterApi::new();
        let mut seq = Sequence::new();
        expect_creates(&mut mock, &mut seq);
        mock.expect_service_external_endpoint()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, name, _| name == "fairing-service-x2")
            .returning(|_, _, _| Ok("34.1.2.3".to_string()));

        let mut deployer = ServingDeployer::new(Arc::new(mock), "kubeflow")
            .with_service_type(ServiceType::LoadBalancer);
        let url = deployer.deploy(model_pod_spec()).await.unwrap();
        assert_eq!(url, "http://34.1.2.3:5000/predict");
    }

    #[tokio::test]
    async fn deployment_failure_skips_service() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_deployment()
            .times(1)
            .returning(|_, _| Err(not_found()));
        mock.expect_create_service().never();

        let mut deployer = ServingDeployer::new(Arc::new(mock), "kubeflow");
        let result = deployer.deploy(model_pod_spec()).await;
        assert!(matches!(result, Err(Error::KubeError(_))));
        assert!(deployer.deployed().is_none());
    }

    #[tokio::test]
    async fn render_applies_pipeline_and_labels() {
        let deployer = ServingDeployer::new(Arc::new(MockClusterApi::new()), "kubeflow")
            .with_pipeline(PodSpecPipeline::new().with(ResourceLimits::new().cpu(2.0)))
            .with_seldon(SeldonServing::new("Model"));
        let rendered = deployer.render(model_pod_spec()).unwrap();

        let labels = rendered.deployment.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("fairing-id"), Some(&rendered.run_id));
        assert_eq!(rendered.service.spec.as_ref().unwrap().selector.as_ref(), Some(&labels));

        let pod_spec = rendered.deployment.spec.unwrap().template.spec.unwrap();
        let container = &pod_spec.containers[0];
        assert!(container.resources.is_some());
        assert_eq!(container.command.as_ref().unwrap()[0], "sh");
    }

    #[tokio::test]
    async fn each_render_gets_a_new_run_id() {
        let deployer = ServingDeployer::new(Arc::new(MockClusterApi::new()), "default");
        let first = deployer.render(model_pod_spec()).unwrap();
        let second = deployer.render(model_pod_spec()).unwrap();
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn teardown_deletes_service_then_deployment() {
        let mut mock = MockClusterApi::new();
        let mut seq = Sequence::new();
        mock.expect_delete_service()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, name| name == "svc")
            .returning(|_, _| Ok(()));
        mock.expect_delete_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, name| name == "dep")
            .returning(|_, _| Ok(()));

        let outcome = teardown(&mock, "kubeflow", "dep", "svc").await;
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn teardown_swallows_each_failure() {
        let mut mock = MockClusterApi::new();
        mock.expect_delete_service()
            .times(1)
            .returning(|_, _| Err(not_found()));
        mock.expect_delete_deployment()
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = teardown(&mock, "kubeflow", "dep", "svc").await;
        assert_eq!(
            outcome,
            TeardownOutcome {
                service_deleted: false,
                deployment_deleted: true,
            }
        );
    }

    #[tokio::test]
    async fn delete_before_deploy_is_an_error() {
        let mut deployer = ServingDeployer::new(Arc::new(MockClusterApi::new()), "default");
        assert!(matches!(deployer.delete().await, Err(Error::NotDeployed)));
    }

    #[tokio::test]
    async fn delete_tears_down_last_deploy() {
        let mut mock = MockClusterApi::new();
        let mut seq = Sequence::new();
        expect_creates(&mut mock, &mut seq);
        mock.expect_delete_service()
            .times(1)
            .withf(|ns, name| ns == "kubeflow" && name == "fairing-service-x2")
            .returning(|_, _| Ok(()));
        mock.expect_delete_deployment()
            .times(1)
            .withf(|ns, name| ns == "kubeflow" && name == "fairing-deployer-x1")
            .returning(|_, _| Ok(()));

        let mut deployer = ServingDeployer::new(Arc::new(mock), "kubeflow");
        deployer.deploy(model_pod_spec()).await.unwrap();
        assert!(deployer.delete().await.unwrap().is_complete());
        assert!(deployer.deployed().is_none());
    }

    #[tokio::test]
    async fn delete_after_load_balancer_timeout_removes_both_objects() {
        let mut mock = MockClusterApi::new();
        let mut seq = Sequence::new();
        expect_creates(&mut mock, &mut seq);
        mock.expect_service_external_endpoint()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Err(Error::Timeout {
                    what: "lb".to_string(),
                    seconds: 1,
                })
            });
        mock.expect_delete_service()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|ns, name| ns == "kubeflow" && name == "fairing-service-x2")
            .returning(|_, _| Ok(()));
        mock.expect_delete_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|ns, name| ns == "kubeflow" && name == "fairing-deployer-x1")
            .returning(|_, _| Ok(()));

        let mut deployer = ServingDeployer::new(Arc::new(mock), "kubeflow")
            .with_service_type(ServiceType::LoadBalancer);
        let result = deployer.deploy(model_pod_spec()).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));

        let partial = deployer.deployed().unwrap();
        assert_eq!(partial.service_name.as_deref(), Some("fairing-service-x2"));
        assert!(partial.url.is_none());

        assert!(deployer.delete().await.unwrap().is_complete());
        assert!(deployer.deployed().is_none());
    }

    #[tokio::test]
    async fn delete_after_service_failure_removes_deployment_only() {
        let mut mock = MockClusterApi::new();
        mock.expect_create_deployment()
            .times(1)
            .returning(|_, d| {
                Ok(named(d, |d: &mut Deployment| {
                    d.metadata.name = Some("fairing-deployer-x1".to_string());
                }))
            });
        mock.expect_create_service()
            .times(1)
            .returning(|_, _| Err(not_found()));
        mock.expect_delete_service().never();
        mock.expect_delete_deployment()
            .times(1)
            .withf(|_, name| name == "fairing-deployer-x1")
            .returning(|_, _| Ok(()));

        let mut deployer = ServingDeployer::new(Arc::new(mock), "kubeflow");
        assert!(deployer.deploy(model_pod_spec()).await.is_err());
        assert!(deployer.deployed().unwrap().service_name.is_none());
        assert!(deployer.delete().await.unwrap().is_complete());
    }

    #[test]
    fn seldon_requires_serving_class() {
        let config = FairingConfig::default();
        assert!(config.serving.use_seldon);
        let result = ServingDeployer::from_config(
            Arc::new(MockClusterApi::new()),
            "default",
            &config,
            None,
        );
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn seldon_disabled_ignores_serving_class() {
        let mut config = FairingConfig::default();
        config.serving.use_seldon = false;
        let deployer = ServingDeployer::from_config(
            Arc::new(MockClusterApi::new()),
            "default",
            &config,
            Some(SeldonServing::new("Model")),
        )
        .unwrap();
        let rendered = deployer.render(model_pod_spec()).unwrap();
        let pod_spec = rendered.deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod_spec.containers[0].command.is_none());
    }
}
