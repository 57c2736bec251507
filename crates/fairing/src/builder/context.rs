//! Build contexts and where the builder pod finds them

use crate::error::{Error, Result};
use crate::mutators::{MountPvc, MutatorContext, PodSpecMutator};
use async_trait::async_trait;
use fairing_config::constants::{
    BUILDER_DEPLOYER_TYPE, KANIKO_IMAGE, PVC_DEFAULT_MOUNT_PATH, PVC_DEFAULT_VOLUME_NAME,
};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A build context archive produced by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Local path of the context tarball
    pub path: PathBuf,
    /// Content hash, used as the image tag
    pub hash: String,
}

impl BuildContext {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
        }
    }

    /// File name of the archive
    pub fn file_name(&self) -> Result<String> {
        archive_name(&self.path)
    }
}

fn archive_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::config(format!(
                "build context path {} has no file name",
                path.display()
            ))
        })
}

/// Makes a build context reachable from the builder pod
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Stage the context where the builder pod can read it
    async fn prepare(&mut self, context: &BuildContext) -> Result<()>;

    /// Pod spec of a builder that builds `image_tag` from the staged context
    fn generate_pod_spec(&self, image_tag: &str, push: bool) -> Result<PodSpec>;

    /// Release whatever `prepare` staged
    async fn cleanup(&mut self) -> Result<()>;
}

/// Context archive already present on a persistent volume claim.
///
/// The builder pod mounts the claim and reads `tar://<mount>/<archive>`.
#[derive(Debug, Clone)]
pub struct PvcContextSource {
    pvc_name: String,
    mount_path: String,
    volume_prefix: String,
    kaniko_image: String,
    archive: Option<String>,
}

impl PvcContextSource {
    #[must_use]
    pub fn new(pvc_name: impl Into<String>) -> Self {
        Self {
            pvc_name: pvc_name.into(),
            mount_path: PVC_DEFAULT_MOUNT_PATH.to_string(),
            volume_prefix: PVC_DEFAULT_VOLUME_NAME.to_string(),
            kaniko_image: KANIKO_IMAGE.to_string(),
            archive: None,
        }
    }

    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    #[must_use]
    pub fn with_volume_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.volume_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_kaniko_image(mut self, image: impl Into<String>) -> Self {
        self.kaniko_image = image.into();
        self
    }

    /// `tar://` URL of the staged archive
    pub fn context_url(&self) -> Result<String> {
        let archive = self
            .archive
            .as_deref()
            .ok_or_else(|| Error::config("build context has not been prepared"))?;
        Ok(format!(
            "tar://{}/{archive}",
            self.mount_path.trim_end_matches('/')
        ))
    }

    fn mount(&self) -> MountPvc {
        MountPvc::new(self.pvc_name.clone())
            .with_mount_path(self.mount_path.clone())
            .with_volume_prefix(self.volume_prefix.clone())
    }
}

#[async_trait]
impl ContextSource for PvcContextSource {
    async fn prepare(&mut self, context: &BuildContext) -> Result<()> {
        let archive = context.file_name()?;
        info!(
            pvc = %self.pvc_name,
            archive = %archive,
            "Using build context staged on PVC"
        );
        self.archive = Some(archive);
        Ok(())
    }

    fn generate_pod_spec(&self, image_tag: &str, push: bool) -> Result<PodSpec> {
        let mut args = vec![
            "--dockerfile=Dockerfile".to_string(),
            format!("--destination={image_tag}"),
            format!("--context={}", self.context_url()?),
        ];
        if !push {
            args.push("--no-push".to_string());
        }

        let mut pod_spec = PodSpec {
            containers: vec![Container {
                name: "kaniko".to_string(),
                image: Some(self.kaniko_image.clone()),
                args: Some(args),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        };
        self.mount().mutate(
            &MutatorContext::new(BUILDER_DEPLOYER_TYPE),
            &mut pod_spec,
            "",
        )?;
        Ok(pod_spec)
    }

    async fn cleanup(&mut self) -> Result<()> {
        debug!(pvc = %self.pvc_name, "PVC context left in place");
        self.archive = None;
        Ok(())
    }
}
