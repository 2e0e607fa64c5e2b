//! The metadata contract between VM pods and the enforcer.
//!
//! VM-bearing pods are recognised by the VM name label. Their scaling bounds
//! travel in a JSON annotation, and agents record the last permit they were
//! granted in a second annotation so a restarted scheduler can pick up where
//! its predecessor left off.

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::agent::{Bounds, Resources};
use crate::error::{CoreError, Result};

/// Label carrying the VM name; its presence marks a pod as VM-bearing
pub const VM_NAME_LABEL: &str = "vm.stratus.io/name";

/// Test-only label forcing the pod to be selected for migration whenever it
/// is considered
pub const ALWAYS_MIGRATE_LABEL: &str = "autoscaling.stratus.io/testing-only-always-migrate";

/// Annotation with the pod's [`VmBounds`] as JSON
pub const BOUNDS_ANNOTATION: &str = "autoscaling.stratus.io/bounds";

/// Annotation with the last [`Resources`] permit the agent received, as JSON
pub const LAST_PERMIT_ANNOTATION: &str = "autoscaling.stratus.io/last-permit";

/// Scaling bounds and current usage for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBounds {
    pub min: u16,
    pub max: u16,
    #[serde(rename = "use")]
    pub using: u16,
}

impl ScalingBounds {
    pub fn bounds(&self) -> Bounds {
        Bounds {
            min: self.min,
            max: self.max,
        }
    }

    fn validate(&self, resource: &str) -> Result<()> {
        if !(self.min <= self.using && self.using <= self.max) {
            return Err(CoreError::invalid_vm_metadata(format!(
                "{}: bounds must satisfy min <= use <= max, got min={} use={} max={}",
                resource, self.min, self.using, self.max
            )));
        }
        Ok(())
    }
}

/// Scaling bounds for both resources, as carried in [`BOUNDS_ANNOTATION`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmBounds {
    pub cpu: ScalingBounds,
    pub mem: ScalingBounds,
}

/// Everything the enforcer learns about a VM pod from its metadata
#[derive(Debug, Clone)]
pub struct VmPodInfo {
    pub vm_name: String,
    pub bounds: VmBounds,
    pub last_permit: Option<Resources>,
    pub testing_only_always_migrate: bool,
}

impl VmPodInfo {
    /// Extract VM metadata from a pod.
    ///
    /// Returns `Ok(None)` for pods without the VM name label (non-VM pods),
    /// and an error when the label is present but the contract is broken.
    pub fn from_pod(pod: &Pod) -> Result<Option<Self>> {
        let labels = pod.metadata.labels.as_ref();
        let Some(vm_name) = labels.and_then(|l| l.get(VM_NAME_LABEL)) else {
            return Ok(None);
        };

        let annotations = pod.metadata.annotations.as_ref();
        let bounds_raw = annotations
            .and_then(|a| a.get(BOUNDS_ANNOTATION))
            .ok_or_else(|| {
                CoreError::invalid_vm_metadata(format!("missing {} annotation", BOUNDS_ANNOTATION))
            })?;
        let bounds: VmBounds = serde_json::from_str(bounds_raw).map_err(|e| {
            CoreError::invalid_vm_metadata(format!("bad {} annotation: {}", BOUNDS_ANNOTATION, e))
        })?;
        bounds.cpu.validate("cpu")?;
        bounds.mem.validate("mem")?;

        let last_permit = annotations
            .and_then(|a| a.get(LAST_PERMIT_ANNOTATION))
            .map(|raw| {
                serde_json::from_str::<Resources>(raw).map_err(|e| {
                    CoreError::invalid_vm_metadata(format!(
                        "bad {} annotation: {}",
                        LAST_PERMIT_ANNOTATION, e
                    ))
                })
            })
            .transpose()?;

        let testing_only_always_migrate = labels
            .map(|l| l.contains_key(ALWAYS_MIGRATE_LABEL))
            .unwrap_or(false);

        Ok(Some(Self {
            vm_name: vm_name.clone(),
            bounds,
            last_permit,
            testing_only_always_migrate,
        }))
    }
}
