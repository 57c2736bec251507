//! Resource limit mutator (cpu, memory, gpu)

use super::{first_container_mut, MutatorContext, PodSpecMutator};
use crate::error::Result;
use fairing_config::constants::DEFAULT_GPU_VENDOR;
use k8s_openapi::api::core::v1::{PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::debug;

/// GB in one GiB; cloud providers size instances in GB, Kubernetes wants Gi
const GB_PER_GIB: f64 = 1.073_741_824;

/// Sets cpu, memory and gpu limits on the first container.
///
/// Memory is given in GB and written in Gi rounded to two decimals.
///
/// When any value is set, the container's existing limits are replaced
/// wholesale: unrelated keys such as `ephemeral-storage` are dropped rather
/// than merged. Requests are left alone. With nothing set the mutator is a
/// no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    cpu: Option<f64>,
    memory: Option<f64>,
    gpu: Option<u32>,
    gpu_vendor: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: None,
            memory: None,
            gpu: None,
            gpu_vendor: DEFAULT_GPU_VENDOR.to_string(),
        }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU limit in cores
    #[must_use]
    pub fn cpu(mut self, cpu: f64) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Memory limit in GB
    #[must_use]
    pub fn memory(mut self, memory_gb: f64) -> Self {
        self.memory = Some(memory_gb);
        self
    }

    /// Number of GPUs
    #[must_use]
    pub fn gpu(mut self, gpu: u32) -> Self {
        self.gpu = Some(gpu);
        self
    }

    /// GPU vendor forming the `<vendor>.com/gpu` key (default "nvidia")
    #[must_use]
    pub fn gpu_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.gpu_vendor = vendor.into();
        self
    }

    /// True when no cpu, memory or gpu value was supplied
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.gpu.is_none()
    }

    /// The limits mapping this mutator writes. Zero values are omitted.
    #[must_use]
    pub fn limits(&self) -> BTreeMap<String, Quantity> {
        let mut limits = BTreeMap::new();
        if let Some(cpu) = self.cpu.filter(|cpu| *cpu != 0.0) {
            limits.insert("cpu".to_string(), Quantity(format!("{cpu}")));
        }
        if let Some(memory) = self.memory.filter(|memory| *memory != 0.0) {
            limits.insert("memory".to_string(), Quantity(memory_to_gib(memory)));
        }
        if let Some(gpu) = self.gpu.filter(|gpu| *gpu != 0) {
            limits.insert(
                format!("{}.com/gpu", self.gpu_vendor),
                Quantity(gpu.to_string()),
            );
        }
        limits
    }
}

/// Convert GB to a Gi quantity string rounded to two decimals ("0.47Gi").
///
/// Whole numbers keep one decimal ("1.0Gi").
#[must_use]
pub fn memory_to_gib(memory_gb: f64) -> String {
    let gib = (memory_gb / GB_PER_GIB * 100.0).round() / 100.0;
    let mut formatted = format!("{gib}");
    if !formatted.contains('.') {
        formatted.push_str(".0");
    }
    format!("{formatted}Gi")
}

impl PodSpecMutator for ResourceLimits {
    fn name(&self) -> &str {
        "resource-limits"
    }

    fn mutate(&self, _ctx: &MutatorContext, pod_spec: &mut PodSpec, _namespace: &str) -> Result<()> {
        if self.is_unset() {
            return Ok(());
        }
        let Some(container) = first_container_mut(pod_spec) else {
            debug!("Pod spec has no containers; skipping resource limits");
            return Ok(());
        };

        let limits = self.limits();
        match container.resources.as_mut() {
            Some(resources) => {
                if resources.limits.as_ref().is_some_and(|prior| !prior.is_empty()) {
                    debug!(
                        container = %container.name,
                        "Replacing existing resource limits"
                    );
                }
                resources.limits = Some(limits);
            }
            None => {
                container.resources = Some(ResourceRequirements {
                    limits: Some(limits),
                    ..Default::default()
                });
            }
        }
        Ok(())
    }
}
