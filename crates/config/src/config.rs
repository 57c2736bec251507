//! Fairing Configuration
//!
//! Settings for in-cluster image builds and serving deployments, loaded from a
//! YAML file. Every section has defaults so a partial file is enough.

use crate::constants::{
    DEFAULT_BASE_IMAGE, DEFAULT_CLUSTER_DOMAIN, KANIKO_IMAGE, PVC_DEFAULT_MOUNT_PATH,
    PVC_DEFAULT_VOLUME_NAME,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown service type '{0}' (expected ClusterIP, NodePort or LoadBalancer)")]
    UnknownServiceType(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FairingConfig {
    /// Target namespace; falls back to the kubeconfig namespace when unset
    #[serde(default = "default_namespace")]
    pub namespace: Option<String>,

    /// Registry images are pushed to (e.g. "gcr.io/my-project")
    #[serde(default = "default_registry")]
    pub registry: Option<String>,

    /// Base image for builds
    #[serde(default = "default_base_image", rename = "baseImage")]
    pub base_image: String,

    /// Builder pod configuration
    #[serde(default)]
    pub builder: BuilderConfig,

    /// Persistent volume claim defaults
    #[serde(default)]
    pub storage: StorageConfig,

    /// Serving deployment configuration
    #[serde(default)]
    pub serving: ServingConfig,
}

/// Builder pod configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuilderConfig {
    /// Image running the build
    #[serde(default = "default_builder_image")]
    pub image: String,

    /// Seconds to wait for the builder pod to start
    #[serde(
        default = "default_pod_start_timeout",
        rename = "podStartTimeoutSeconds"
    )]
    pub pod_start_timeout_seconds: u64,

    /// Whether to push the built image
    #[serde(default = "default_true")]
    pub push: bool,

    /// Whether to delete the builder pod once its logs end
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

/// Persistent volume claim defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Mount path used when a PVC mount does not specify one
    #[serde(default = "default_pvc_mount_path", rename = "pvcMountPath")]
    pub pvc_mount_path: String,

    /// Prefix prepended to the PVC name to form the volume name
    #[serde(default = "default_pvc_volume_prefix", rename = "pvcVolumePrefix")]
    pub pvc_volume_prefix: String,
}

/// Serving deployment configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServingConfig {
    /// Kubernetes service type
    #[serde(default, rename = "serviceType")]
    pub service_type: ServiceType,

    /// Wrap the container command with the Seldon serving runtime
    #[serde(default = "default_true", rename = "useSeldon")]
    pub use_seldon: bool,

    /// Cluster DNS suffix used to build in-cluster endpoints
    #[serde(default = "default_cluster_domain", rename = "clusterDomain")]
    pub cluster_domain: String,

    /// Seconds to wait for a load balancer endpoint
    #[serde(
        default = "default_endpoint_timeout",
        rename = "endpointTimeoutSeconds"
    )]
    pub endpoint_timeout_seconds: u64,
}

/// Kubernetes service types supported for serving
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clusterip" => Ok(ServiceType::ClusterIP),
            "nodeport" => Ok(ServiceType::NodePort),
            "loadbalancer" => Ok(ServiceType::LoadBalancer),
            _ => Err(ConfigError::UnknownServiceType(s.to_string())),
        }
    }
}

fn default_namespace() -> Option<String> {
    std::env::var("FAIRING_NAMESPACE").ok()
}

fn default_registry() -> Option<String> {
    std::env::var("FAIRING_REGISTRY").ok()
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}

fn default_builder_image() -> String {
    KANIKO_IMAGE.to_string()
}

fn default_pod_start_timeout() -> u64 {
    300 // 5 minutes
}

fn default_endpoint_timeout() -> u64 {
    600 // 10 minutes
}

fn default_true() -> bool {
    true
}

fn default_pvc_mount_path() -> String {
    PVC_DEFAULT_MOUNT_PATH.to_string()
}

fn default_pvc_volume_prefix() -> String {
    PVC_DEFAULT_VOLUME_NAME.to_string()
}

fn default_cluster_domain() -> String {
    DEFAULT_CLUSTER_DOMAIN.to_string()
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            image: default_builder_image(),
            pod_start_timeout_seconds: default_pod_start_timeout(),
            push: true,
            cleanup: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pvc_mount_path: default_pvc_mount_path(),
            pvc_volume_prefix: default_pvc_volume_prefix(),
        }
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            service_type: ServiceType::default(),
            use_seldon: true,
            cluster_domain: default_cluster_domain(),
            endpoint_timeout_seconds: default_endpoint_timeout(),
        }
    }
}

impl Default for FairingConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            registry: default_registry(),
            base_image: default_base_image(),
            builder: BuilderConfig::default(),
            storage: StorageConfig::default(),
            serving: ServingConfig::default(),
        }
    }
}

impl FairingConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&raw)?;
        debug!(path = %path.display(), "Loaded fairing configuration");
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Validate that configuration values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.builder.image.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "builder.image must not be empty".to_string(),
            ));
        }
        if !self.storage.pvc_mount_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "storage.pvcMountPath must be absolute, got '{}'",
                self.storage.pvc_mount_path
            )));
        }
        if self.serving.cluster_domain.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "serving.clusterDomain must not be empty".to_string(),
            ));
        }
        if let Some(registry) = &self.registry {
            if registry.trim().is_empty() || registry.ends_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "registry '{registry}' must be non-empty without a trailing slash"
                )));
            }
        }
        Ok(())
    }

    /// Serialized form of the effective configuration
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
