//! Prediction serving: Deployment plus Service around a mutated pod spec

pub mod deployer;
pub mod spec;

pub use deployer::{teardown, DeployedServing, RenderedServing, ServingDeployer, TeardownOutcome};
pub use spec::{
    cluster_endpoint_url, external_endpoint_url, generate_deployment_spec, generate_service_spec,
    inject_serving_command, serving_command, serving_labels, SeldonServing,
};
