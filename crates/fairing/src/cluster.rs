//! Kubernetes API boundary
//!
//! Builders and deployers talk to the cluster only through [`ClusterApi`],
//! which is handed to them explicitly. [`KubeClusterApi`] is the production
//! implementation on top of a `kube::Client`; tests substitute a mock.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, LogParams, PostParams, PropagationPolicy};
use kube::runtime::wait::await_condition;
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

/// Operations the orchestration layer needs from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a pod and return the object as stored by the API server
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a deployment and return the stored object
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;

    /// Delete a deployment along with its pods (foreground propagation)
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a service and return the stored object
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    /// Delete a service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Wait until the pod has left the Pending phase
    async fn wait_for_pod_start(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<()>;

    /// Follow the pod's logs until the stream closes, emitting each line.
    /// Returns the number of lines read.
    async fn follow_pod_logs(&self, namespace: &str, name: &str) -> Result<usize>;

    /// Wait for a load balancer ingress on the service and return its host
    async fn service_external_endpoint(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<String>;
}

/// `ClusterApi` backed by a live cluster
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from the ambient kubeconfig or in-cluster service account
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// Namespace of the current kubeconfig context
    #[must_use]
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }
}

/// True once the pod reports Running, Succeeded or Failed
pub(crate) fn pod_started(pod: Option<&Pod>) -> bool {
    pod.and_then(|p| p.status.as_ref())
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| matches!(phase, "Running" | "Succeeded" | "Failed"))
}

/// First load balancer ingress host of a service, IP preferred
pub(crate) fn external_host(service: Option<&Service>) -> Option<String> {
    service?
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
}

async fn bounded<T>(
    timeout: Duration,
    what: String,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout {
            what,
            seconds: timeout.as_secs(),
        })?
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self, pod))]
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    #[instrument(skip(self, deployment))]
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), deployment).await?)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let delete_params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        api.delete(name, &delete_params).await?;
        Ok(())
    }

    #[instrument(skip(self, service))]
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn wait_for_pod_start(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        debug!(pod = %name, "Waiting for pod to start");
        bounded(timeout, format!("pod {namespace}/{name} to start"), async {
            await_condition(api, name, |pod: Option<&Pod>| pod_started(pod)).await?;
            Ok(())
        })
        .await
    }

    async fn follow_pod_logs(&self, namespace: &str, name: &str) -> Result<usize> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let mut lines = api.log_stream(name, &params).await?.lines();
        let mut count = 0;
        while let Some(line) = lines.try_next().await? {
            info!(pod = %name, "{}", line);
            count += 1;
        }
        debug!(pod = %name, lines = count, "Log stream closed");
        Ok(count)
    }

    async fn service_external_endpoint(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<String> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        info!(service = %name, "Waiting for load balancer endpoint");
        let service = bounded(
            timeout,
            format!("service {namespace}/{name} external endpoint"),
            async {
                Ok(await_condition(api, name, |svc: Option<&Service>| {
                    external_host(svc).is_some()
                })
                .await?)
            },
        )
        .await?;

        external_host(service.as_ref())
            .ok_or_else(|| Error::MissingMetadata("load balancer ingress".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, PodStatus, ServiceStatus,
    };

    fn pod_in_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_with_ingress(ingress: Vec<LoadBalancerIngress>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(ingress),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pending_pods_have_not_started() {
        assert!(!pod_started(None));
        assert!(!pod_started(Some(&Pod::default())));
        assert!(!pod_started(Some(&pod_in_phase("Pending"))));
    }

    #[test]
    fn terminal_and_running_pods_have_started() {
        for phase in ["Running", "Succeeded", "Failed"] {
            assert!(pod_started(Some(&pod_in_phase(phase))), "{phase}");
        }
    }

    #[test]
    fn external_host_prefers_ip() {
        let svc = service_with_ingress(vec![LoadBalancerIngress {
            ip: Some("34.1.2.3".to_string()),
            hostname: Some("lb.example.com".to_string()),
            ..Default::default()
        }]);
        assert_eq!(external_host(Some(&svc)).as_deref(), Some("34.1.2.3"));
    }

    #[test]
    fn external_host_falls_back_to_hostname() {
        let svc = service_with_ingress(vec![LoadBalancerIngress {
            hostname: Some("lb.example.com".to_string()),
            ..Default::default()
        }]);
        assert_eq!(external_host(Some(&svc)).as_deref(), Some("lb.example.com"));
    }

    #[test]
    fn no_ingress_means_no_host() {
        assert_eq!(external_host(None), None);
        assert_eq!(external_host(Some(&Service::default())), None);
        assert_eq!(external_host(Some(&service_with_ingress(vec![]))), None);
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let result: Result<()> = bounded(Duration::from_millis(10), "nothing".to_string(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { what, .. }) if what == "nothing"));
    }
}
