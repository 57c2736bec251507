//! Deployment and Service assembly for serving endpoints

use crate::error::Result;
use fairing_config::constants::{
    LABEL_DEPLOYER, LABEL_RUN_ID, SERVING_DEPLOYER_TYPE, SERVING_PORT, SERVING_PORT_NAME,
};
use fairing_config::ServiceType;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PodSpec, Service};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const DEPLOYMENT_GENERATE_NAME: &str = "fairing-deployer-";
pub const SERVICE_GENERATE_NAME: &str = "fairing-service-";

/// Seldon microservice wrapper around a user model class
#[derive(Debug, Clone, PartialEq)]
pub struct SeldonServing {
    pub class_name: String,
    pub parameters: Option<Value>,
}

impl SeldonServing {
    #[must_use]
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            parameters: None,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// `seldon-core-microservice` invocation for this class
    #[must_use]
    pub fn command(&self) -> String {
        let parameters = match &self.parameters {
            Some(params) => format!("['{}']", spaced_json(params)),
            None => "[]".to_string(),
        };
        format!(
            "seldon-core-microservice {} REST --service-type=MODEL --persistence=0 --parameters={parameters}",
            self.class_name
        )
    }
}

/// JSON in Python's `json.dumps` layout: `", "` and `": "` separators,
/// non-ASCII escaped as `\uXXXX`.
fn spaced_json(value: &Value) -> String {
    let mut out = String::new();
    write_spaced(value, &mut out);
    out.chars().fold(String::with_capacity(out.len()), |mut escaped, ch| {
        if ch.is_ascii() {
            escaped.push(ch);
        } else {
            for unit in ch.encode_utf16(&mut [0; 2]).iter() {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
        escaped
    })
}

fn write_spaced(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push_str(": ");
                write_spaced(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_spaced(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Labels identifying one serving deploy: deployer type, caller labels, run id.
///
/// The run id is inserted last and wins over a caller label of the same key.
#[must_use]
pub fn serving_labels(extra: &BTreeMap<String, String>, run_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_DEPLOYER.to_string(), SERVING_DEPLOYER_TYPE.to_string());
    labels.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels.insert(LABEL_RUN_ID.to_string(), run_id.to_string());
    labels
}

/// Shell command line for the serving container.
///
/// The container's prior command comes first, then the seldon invocation
/// joined with `&&`. Returns `None` when there is nothing to run.
#[must_use]
pub fn serving_command(prior: Option<&[String]>, seldon: Option<&SeldonServing>) -> Option<String> {
    let mut parts: Vec<String> = prior.map(<[String]>::to_vec).unwrap_or_default();
    if let Some(seldon) = seldon {
        if !parts.is_empty() {
            parts.push("&&".to_string());
        }
        parts.push(seldon.command());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Rewrite the first container's command to `sh -c "<serving command>"`
pub fn inject_serving_command(pod_spec: &mut PodSpec, seldon: Option<&SeldonServing>) {
    let Some(container) = pod_spec.containers.first_mut() else {
        return;
    };
    if let Some(line) = serving_command(container.command.as_deref(), seldon) {
        container.command = Some(vec!["sh".to_string(), "-c".to_string(), line]);
    }
}

/// Deployment running `pod_spec` under `labels`, one replica
pub fn generate_deployment_spec(
    pod_spec: &PodSpec,
    labels: &BTreeMap<String, String>,
) -> Result<Deployment> {
    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "generateName": DEPLOYMENT_GENERATE_NAME,
            "labels": labels
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": serde_json::to_value(pod_spec)?
            }
        }
    });

    Ok(serde_json::from_value(deployment)?)
}

/// Service exposing the serving port of pods carrying `labels`
pub fn generate_service_spec(
    labels: &BTreeMap<String, String>,
    service_type: ServiceType,
) -> Result<Service> {
    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "generateName": SERVICE_GENERATE_NAME,
            "labels": labels
        },
        "spec": {
            "selector": labels,
            "type": service_type.as_str(),
            "ports": [{
                "name": SERVING_PORT_NAME,
                "port": SERVING_PORT
            }]
        }
    });

    Ok(serde_json::from_value(service)?)
}

/// In-cluster prediction URL of a service
#[must_use]
pub fn cluster_endpoint_url(service_name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("http://{service_name}.{namespace}.svc.{cluster_domain}:{SERVING_PORT}/predict")
}

/// Prediction URL behind a load balancer
#[must_use]
pub fn external_endpoint_url(host: &str) -> String {
    format!("http://{host}:{SERVING_PORT}/predict")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutators::test_support::model_pod_spec;

    fn run_labels() -> BTreeMap<String, String> {
        let mut extra = BTreeMap::new();
        extra.insert("team".to_string(), "ml".to_string());
        serving_labels(&extra, "run-1")
    }

    #[test]
    fn labels_include_deployer_caller_and_run_id() {
        let labels = run_labels();
        assert_eq!(labels.get("fairing-deployer").map(String::as_str), Some("serving"));
        assert_eq!(labels.get("team").map(String::as_str), Some("ml"));
        assert_eq!(labels.get("fairing-id").map(String::as_str), Some("run-1"));
    }

    #[test]
    fn run_id_overrides_caller_label() {
        let mut extra = BTreeMap::new();
        extra.insert("fairing-id".to_string(), "spoofed".to_string());
        let labels = serving_labels(&extra, "real");
        assert_eq!(labels.get("fairing-id").map(String::as_str), Some("real"));
    }

    #[test]
    fn seldon_command_without_parameters() {
        assert_eq!(
            SeldonServing::new("Model").command(),
            "seldon-core-microservice Model REST --service-type=MODEL --persistence=0 --parameters=[]"
        );
    }

    #[test]
    fn seldon_command_with_parameters() {
        let seldon = SeldonServing::new("Model")
            .with_parameters(json!({"alpha": 0.5}));
        assert!(seldon
            .command()
            .ends_with(r#"--parameters=['{"alpha": 0.5}']"#));
    }

    #[test]
    fn parameter_json_is_spaced_and_ascii() {
        let params = json!({"layers": [64, 32], "name": "caf\u{e9}", "opts": {}});
        assert_eq!(
            spaced_json(&params),
            r#"{"layers": [64, 32], "name": "caf\u00e9", "opts": {}}"#
        );
    }

    #[test]
    fn prior_command_is_chained_before_seldon() {
        let prior = vec!["pip".to_string(), "install".to_string(), "x".to_string()];
        let line = serving_command(Some(prior.as_slice()), Some(&SeldonServing::new("Model"))).unwrap();
        assert!(line.starts_with("pip install x && seldon-core-microservice Model REST"));
    }

    #[test]
    fn prior_command_alone_is_kept() {
        let prior = vec!["python".to_string(), "serve.py".to_string()];
        assert_eq!(
            serving_command(Some(prior.as_slice()), None).as_deref(),
            Some("python serve.py")
        );
    }

    #[test]
    fn nothing_to_run_leaves_command_alone() {
        let mut pod_spec = model_pod_spec();
        inject_serving_command(&mut pod_spec, None);
        assert!(pod_spec.containers[0].command.is_none());
    }

    #[test]
    fn injected_command_is_wrapped_in_shell() {
        let mut pod_spec = model_pod_spec();
        inject_serving_command(&mut pod_spec, Some(&SeldonServing::new("Model")));
        let command = pod_spec.containers[0].command.as_ref().unwrap();
        assert_eq!(command.len(), 3);
        assert_eq!(command[0], "sh");
        assert_eq!(command[1], "-c");
        assert!(command[2].starts_with("seldon-core-microservice Model"));
    }

    #[test]
    fn deployment_wraps_pod_spec_with_labels() {
        let labels = run_labels();
        let deployment = generate_deployment_spec(&model_pod_spec(), &labels).unwrap();

        assert_eq!(
            deployment.metadata.generate_name.as_deref(),
            Some("fairing-deployer-")
        );
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.selector.match_labels.as_ref(), Some(&labels));
        assert_eq!(spec.template.metadata.unwrap().labels.as_ref(), Some(&labels));
        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.containers[0].name, "model");
    }

    #[test]
    fn service_selects_labels_on_serving_port() {
        let labels = run_labels();
        let service = generate_service_spec(&labels, ServiceType::default()).unwrap();

        assert_eq!(service.metadata.generate_name.as_deref(), Some("fairing-service-"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.selector.as_ref(), Some(&labels));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("serving"));
        assert_eq!(port.port, 5000);
    }

    #[test]
    fn load_balancer_service_type() {
        let service = generate_service_spec(&run_labels(), ServiceType::LoadBalancer).unwrap();
        assert_eq!(service.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
    }

    #[test]
    fn endpoint_urls() {
        assert_eq!(
            cluster_endpoint_url("fairing-service-abc", "kubeflow", "cluster.local"),
            "http://fairing-service-abc.kubeflow.svc.cluster.local:5000/predict"
        );
        assert_eq!(
            external_endpoint_url("34.1.2.3"),
            "http://34.1.2.3:5000/predict"
        );
    }
}
