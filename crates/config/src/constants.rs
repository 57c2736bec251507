//! Well-known names and defaults shared by builders and deployers.

/// Path a PVC is mounted at when the caller does not choose one
pub const PVC_DEFAULT_MOUNT_PATH: &str = "/mnt";
/// Prefix of the volume name derived from a PVC name
pub const PVC_DEFAULT_VOLUME_NAME: &str = "fairing-volume-";

/// Base image used when a build does not specify one
pub const DEFAULT_BASE_IMAGE: &str = "gcr.io/kubeflow-images-public/fairing:dev";
/// Image running the in-cluster builder
pub const KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor:v0.14.0";

/// Default GPU vendor used to form the `<vendor>.com/gpu` resource key
pub const DEFAULT_GPU_VENDOR: &str = "nvidia";

/// Deployer type recorded on serving objects
pub const SERVING_DEPLOYER_TYPE: &str = "serving";

/// Label keys stamped onto submitted objects
pub const LABEL_DEPLOYER: &str = "fairing-deployer";
pub const LABEL_RUN_ID: &str = "fairing-id";
pub const LABEL_BUILDER: &str = "fairing-builder";

/// Port the serving container listens on
pub const SERVING_PORT: i32 = 5000;
/// Name of the serving service port
pub const SERVING_PORT_NAME: &str = "serving";
/// Default cluster DNS suffix
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Repository name of built images when the caller does not choose one
pub const DEFAULT_IMAGE_NAME: &str = "fairing-job";
/// Deployer type recorded for image builds
pub const BUILDER_DEPLOYER_TYPE: &str = "builder";
/// Value of the builder label on kaniko pods
pub const KANIKO_BUILDER: &str = "kaniko";
