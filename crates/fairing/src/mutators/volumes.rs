//! Persistent volume claim mount mutator

use super::{first_container_mut, MutatorContext, PodSpecMutator};
use crate::error::Result;
use fairing_config::constants::{PVC_DEFAULT_MOUNT_PATH, PVC_DEFAULT_VOLUME_NAME};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimVolumeSource, PodSpec, Volume, VolumeMount,
};
use tracing::debug;

/// Mounts a PVC into the first container.
///
/// Each application appends one `VolumeMount` and one `Volume`, both named
/// `<prefix><pvc name>`. Applying it twice yields duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPvc {
    pvc_name: String,
    mount_path: String,
    volume_prefix: String,
}

impl MountPvc {
    #[must_use]
    pub fn new(pvc_name: impl Into<String>) -> Self {
        Self {
            pvc_name: pvc_name.into(),
            mount_path: PVC_DEFAULT_MOUNT_PATH.to_string(),
            volume_prefix: PVC_DEFAULT_VOLUME_NAME.to_string(),
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

    /// Name shared by the generated volume and mount
    #[must_use]
    pub fn volume_name(&self) -> String {
        format!("{}{}", self.volume_prefix, self.pvc_name)
    }

    #[must_use]
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }
}

impl PodSpecMutator for MountPvc {
    fn name(&self) -> &str {
        "mount-pvc"
    }

    fn mutate(&self, _ctx: &MutatorContext, pod_spec: &mut PodSpec, _namespace: &str) -> Result<()> {
        let volume_name = self.volume_name();

        let Some(container) = first_container_mut(pod_spec) else {
            debug!(pvc = %self.pvc_name, "Pod spec has no containers; skipping PVC mount");
            return Ok(());
        };
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: volume_name.clone(),
                mount_path: self.mount_path.clone(),
                ..Default::default()
            });

        pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: volume_name,
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.pvc_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        Ok(())
    }
}
