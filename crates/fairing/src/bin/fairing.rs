/*
 * Fairing - In-cluster image builds and model serving for Kubernetes
 * Copyright (C) 2025 Fairing Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! `fairing` command line
//!
//! Renders and deploys serving endpoints, tears them down, and runs
//! in-cluster image builds. Run `fairing --help` for usage.

// CLI binaries legitimately need println! for user output
#![allow(clippy::disallowed_macros)]

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fairing::mutators::{AddEnv, EnvValue, EnvVars, MountPvc, ResourceLimits};
use fairing::serving::{teardown, SeldonServing, ServingDeployer};
use fairing::{BuildContext, ClusterApi, ClusterBuilder, KubeClusterApi, PodSpecPipeline, PvcContextSource};
use fairing_config::{FairingConfig, ServiceType};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fairing")]
#[command(about = "Build images and deploy model servers on Kubernetes")]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "FAIRING_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to work in (overrides configuration)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Log format: text, json
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Deployment and Service a deploy would submit
    Render {
        #[command(flatten)]
        pod: PodArgs,

        #[command(flatten)]
        serving: ServingArgs,
    },

    /// Deploy a serving endpoint and print its URL
    Deploy {
        #[command(flatten)]
        pod: PodArgs,

        #[command(flatten)]
        serving: ServingArgs,

        /// Log the generated objects before submitting them
        #[arg(long)]
        output: bool,
    },

    /// Delete a serving Service and its Deployment
    Teardown {
        /// Deployment name
        #[arg(long)]
        deployment: String,

        /// Service name
        #[arg(long)]
        service: String,
    },

    /// Build an image in the cluster from a context archive on a PVC
    Build {
        /// Local path of the context archive (its file name is used on the PVC)
        #[arg(long)]
        context: PathBuf,

        /// Content hash of the context, used as the image tag
        #[arg(long)]
        hash: String,

        /// PVC holding the context archive
        #[arg(long)]
        pvc: String,

        /// Image repository name under the registry
        #[arg(long)]
        image_name: Option<String>,

        /// Build without pushing the image
        #[arg(long)]
        no_push: bool,

        /// Leave the builder pod in place after the build
        #[arg(long)]
        keep_pod: bool,

        /// Print the builder pod instead of running it
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct ResourceArgs {
    /// CPU limit in cores
    #[arg(long)]
    cpu: Option<f64>,

    /// Memory limit in GB
    #[arg(long)]
    memory: Option<f64>,

    /// Number of GPUs
    #[arg(long)]
    gpu: Option<u32>,

    /// GPU vendor used in the resource key
    #[arg(long)]
    gpu_vendor: Option<String>,
}

#[derive(Args)]
struct PodArgs {
    /// Container image (defaults to the configured base image)
    #[arg(long)]
    image: Option<String>,

    /// Container name
    #[arg(long, default_value = "model")]
    container_name: String,

    /// Literal environment variable, NAME=VALUE
    #[arg(long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Environment variable from a ConfigMap or Secret, NAME=TYPE:OBJECT:KEY
    #[arg(long = "env-from", value_parser = parse_env_reference)]
    env_from: Vec<(String, EnvValue)>,

    /// YAML mapping of environment variables, applied before --env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// PVC to mount into the container
    #[arg(long)]
    pvc: Option<String>,

    /// Mount path of the PVC (defaults to the configured path)
    #[arg(long)]
    pvc_mount_path: Option<String>,

    #[command(flatten)]
    resources: ResourceArgs,

    /// Command run before the server, after `--`
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct ServingArgs {
    /// Model class served by the seldon microservice
    #[arg(long)]
    serving_class: Option<String>,

    /// JSON parameters passed to the model class
    #[arg(long, value_parser = parse_json)]
    serving_params: Option<serde_json::Value>,

    /// Run the container command without the seldon wrapper
    #[arg(long)]
    no_seldon: bool,

    /// Service type: ClusterIP, NodePort, LoadBalancer
    #[arg(long)]
    service_type: Option<ServiceType>,

    /// Extra label on the serving objects, KEY=VALUE
    #[arg(long = "label", value_parser = parse_key_value)]
    labels: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_env_reference(raw: &str) -> Result<(String, EnvValue), String> {
    let (name, reference) = parse_key_value(raw)?;
    let mut parts = reference.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ref_type), Some(object), Some(key)) => {
            Ok((name, EnvValue::reference(ref_type, object, key)))
        }
        _ => Err(format!("expected NAME=TYPE:OBJECT:KEY, got '{raw}'")),
    }
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

impl ResourceArgs {
    fn limits(&self) -> ResourceLimits {
        let mut limits = ResourceLimits::new();
        if let Some(cpu) = self.cpu {
            limits = limits.cpu(cpu);
        }
        if let Some(memory) = self.memory {
            limits = limits.memory(memory);
        }
        if let Some(gpu) = self.gpu {
            limits = limits.gpu(gpu);
        }
        if let Some(vendor) = self.gpu_vendor.as_deref() {
            limits = limits.gpu_vendor(vendor);
        }
        limits
    }
}

impl PodArgs {
    fn pod_spec(&self, config: &FairingConfig) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: self.container_name.clone(),
                image: Some(
                    self.image
                        .clone()
                        .unwrap_or_else(|| config.base_image.clone()),
                ),
                command: (!self.command.is_empty()).then(|| self.command.clone()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn env_vars(&self) -> Result<EnvVars> {
        let mut vars = match &self.env_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read env file {}", path.display()))?;
                serde_yaml::from_str::<EnvVars>(&raw)
                    .with_context(|| format!("Failed to parse env file {}", path.display()))?
            }
            None => EnvVars::new(),
        };
        for (name, value) in &self.env {
            vars.insert(name.clone(), Some(EnvValue::from(value.clone())));
        }
        for (name, value) in &self.env_from {
            vars.insert(name.clone(), Some(value.clone()));
        }
        Ok(vars)
    }

    fn pipeline(&self, config: &FairingConfig) -> Result<PodSpecPipeline> {
        let mut pipeline = PodSpecPipeline::new().with(self.resources.limits());
        if let Some(pvc) = &self.pvc {
            let mount_path = self
                .pvc_mount_path
                .clone()
                .unwrap_or_else(|| config.storage.pvc_mount_path.clone());
            pipeline.push(
                MountPvc::new(pvc.clone())
                    .with_mount_path(mount_path)
                    .with_volume_prefix(config.storage.pvc_volume_prefix.clone()),
            );
        }
        pipeline.push(AddEnv::new(self.env_vars()?));
        Ok(pipeline)
    }
}

impl ServingArgs {
    fn seldon(&self) -> Option<SeldonServing> {
        self.serving_class.as_ref().map(|class| {
            let seldon = SeldonServing::new(class.clone());
            match &self.serving_params {
                Some(params) => seldon.with_parameters(params.clone()),
                None => seldon,
            }
        })
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }

    fn deployer(
        &self,
        cluster: Arc<dyn ClusterApi>,
        namespace: &str,
        config: &FairingConfig,
        pipeline: PodSpecPipeline,
    ) -> Result<ServingDeployer> {
        let mut config = config.clone();
        if self.no_seldon {
            config.serving.use_seldon = false;
        }
        if let Some(service_type) = self.service_type {
            config.serving.service_type = service_type;
        }
        Ok(
            ServingDeployer::from_config(cluster, namespace, &config, self.seldon())?
                .with_labels(self.labels())
                .with_pipeline(pipeline),
        )
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<FairingConfig> {
    let config = match path {
        Some(path) => FairingConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => FairingConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Namespace from the flag, then configuration, then the kubeconfig context
fn resolve_namespace(cli: Option<&str>, config: &FairingConfig, fallback: &str) -> String {
    cli.or(config.namespace.as_deref())
        .unwrap_or(fallback)
        .to_string()
}

async fn connect() -> Result<KubeClusterApi> {
    let cluster = KubeClusterApi::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;
    info!("Connected to Kubernetes cluster");
    Ok(cluster)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.to_json()?)?);
        }
        Commands::Render { pod, serving } => {
            let namespace = resolve_namespace(cli.namespace.as_deref(), &config, "default");
            run_render(&config, &namespace, &pod, &serving)?;
        }
        Commands::Deploy {
            pod,
            serving,
            output,
        } => {
            let cluster = connect().await?;
            let namespace =
                resolve_namespace(cli.namespace.as_deref(), &config, cluster.default_namespace());
            run_deploy(Arc::new(cluster), &config, &namespace, &pod, &serving, output).await?;
        }
        Commands::Teardown {
            deployment,
            service,
        } => {
            let cluster = connect().await?;
            let namespace =
                resolve_namespace(cli.namespace.as_deref(), &config, cluster.default_namespace());
            let outcome = teardown(&cluster, &namespace, &deployment, &service).await;
            if !outcome.is_complete() {
                bail!("Teardown incomplete: {outcome:?}");
            }
            println!("Deleted {service} and {deployment} in {namespace}");
        }
        Commands::Build {
            context,
            hash,
            pvc,
            image_name,
            no_push,
            keep_pod,
            dry_run,
            resources,
        } => {
            let source = PvcContextSource::new(pvc)
                .with_mount_path(config.storage.pvc_mount_path.clone())
                .with_volume_prefix(config.storage.pvc_volume_prefix.clone())
                .with_kaniko_image(config.builder.image.clone());
            let context = BuildContext::new(context, hash);

            let (cluster, namespace): (Arc<dyn ClusterApi>, String) = if dry_run {
                let namespace = resolve_namespace(cli.namespace.as_deref(), &config, "default");
                (Arc::new(DryRunCluster) as Arc<dyn ClusterApi>, namespace)
            } else {
                let cluster = connect().await?;
                let namespace = resolve_namespace(
                    cli.namespace.as_deref(),
                    &config,
                    cluster.default_namespace(),
                );
                (Arc::new(cluster) as Arc<dyn ClusterApi>, namespace)
            };

            let mut builder = ClusterBuilder::from_config(cluster, &namespace, &config, Box::new(source))?
                .with_pipeline(PodSpecPipeline::new().with(resources.limits()));
            if no_push {
                builder = builder.with_push(false);
            }
            if keep_pod {
                builder = builder.with_cleanup(false);
            }
            if let Some(image_name) = image_name {
                builder = builder.with_image_name(image_name);
            }

            if dry_run {
                let (tag, pod) = builder.render(&context).await?;
                println!("# image: {tag}");
                print!("{}", serde_yaml::to_string(&pod)?);
            } else {
                let tag = builder.build(&context).await?;
                println!("{tag}");
            }
        }
    }

    Ok(())
}

fn run_render(
    config: &FairingConfig,
    namespace: &str,
    pod: &PodArgs,
    serving: &ServingArgs,
) -> Result<()> {
    let deployer = serving.deployer(Arc::new(DryRunCluster), namespace, config, pod.pipeline(config)?)?;
    let rendered = deployer.render(pod.pod_spec(config))?;
    print!("{}", serde_yaml::to_string(&rendered.deployment)?);
    println!("---");
    print!("{}", serde_yaml::to_string(&rendered.service)?);
    Ok(())
}

async fn run_deploy(
    cluster: Arc<dyn ClusterApi>,
    config: &FairingConfig,
    namespace: &str,
    pod: &PodArgs,
    serving: &ServingArgs,
    output: bool,
) -> Result<()> {
    let mut deployer = serving
        .deployer(cluster, namespace, config, pod.pipeline(config)?)?
        .with_output(output);
    let url = deployer.deploy(pod.pod_spec(config)).await?;
    if let Some(deployed) = deployer.deployed() {
        println!(
            "deployment: {}\nservice: {}\nurl: {url}",
            deployed.deployment_name,
            deployed.service_name.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

/// Cluster handle for commands that only render objects
struct DryRunCluster;

#[async_trait::async_trait]
impl ClusterApi for DryRunCluster {
    async fn create_pod(
        &self,
        _: &str,
        _: &k8s_openapi::api::core::v1::Pod,
    ) -> fairing::Result<k8s_openapi::api::core::v1::Pod> {
        Err(dry_run_error())
    }

    async fn delete_pod(&self, _: &str, _: &str) -> fairing::Result<()> {
        Err(dry_run_error())
    }

    async fn create_deployment(
        &self,
        _: &str,
        _: &k8s_openapi::api::apps::v1::Deployment,
    ) -> fairing::Result<k8s_openapi::api::apps::v1::Deployment> {
        Err(dry_run_error())
    }

    async fn delete_deployment(&self, _: &str, _: &str) -> fairing::Result<()> {
        Err(dry_run_error())
    }

    async fn create_service(
        &self,
        _: &str,
        _: &k8s_openapi::api::core::v1::Service,
    ) -> fairing::Result<k8s_openapi::api::core::v1::Service> {
        Err(dry_run_error())
    }

    async fn delete_service(&self, _: &str, _: &str) -> fairing::Result<()> {
        Err(dry_run_error())
    }

    async fn wait_for_pod_start(
        &self,
        _: &str,
        _: &str,
        _: std::time::Duration,
    ) -> fairing::Result<()> {
        Err(dry_run_error())
    }

    async fn follow_pod_logs(&self, _: &str, _: &str) -> fairing::Result<usize> {
        Err(dry_run_error())
    }

    async fn service_external_endpoint(
        &self,
        _: &str,
        _: &str,
        _: std::time::Duration,
    ) -> fairing::Result<String> {
        Err(dry_run_error())
    }
}

fn dry_run_error() -> fairing::Error {
    fairing::Error::config("cluster calls are disabled in dry-run mode")
}
