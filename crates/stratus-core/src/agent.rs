use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Namespace'd name of a pod, unique within the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodName {
    pub namespace: String,
    pub name: String,
}

impl PodName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Extract the namespace'd name from a pod's metadata
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let name = pod
            .metadata
            .name
            .as_ref()
            .ok_or_else(|| CoreError::invalid_pod_resources("pod has no name"))?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for PodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A (vCPU, memory slots) pair, in ledger units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "cpu")]
    pub vcpu: u16,
    pub mem: u16,
}

impl Resources {
    pub const ZERO: Resources = Resources { vcpu: 0, mem: 0 };

    pub fn new(vcpu: u16, mem: u16) -> Self {
        Self { vcpu, mem }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{cpu: {}, mem: {}}}", self.vcpu, self.mem)
    }
}

/// A (min, max) pair of scaling bounds for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: u16,
    pub max: u16,
}

/// Load and memory metrics reported by an autoscaling agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "loadAvg1M")]
    pub load_average_1min: f32,
    #[serde(rename = "loadAvg5M")]
    pub load_average_5min: f32,
    #[serde(rename = "memoryUsageBytes")]
    pub memory_usage_bytes: f32,
}

/// A resource-change request from an autoscaling agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// The pod the agent is scaling
    pub pod: PodName,
    /// The reservation the agent wants to end up with
    pub resources: Resources,
    /// The last permit the agent received, sent so a freshly restarted
    /// scheduler can learn what its predecessor granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_permit: Option<Resources>,
    /// Current metrics for the pod's VM
    pub metrics: Metrics,
    /// The compute unit the agent most recently observed
    pub compute_unit: Resources,
}

/// The reply to an [`AgentRequest`].
///
/// `permit` is authoritative: it equals the pod's reserved amounts after the
/// request was handled, and the agent must not exceed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub permit: Resources,
    /// True when the pod was selected for migration while handling this
    /// request; the agent should expect its VM to move
    #[serde(default)]
    pub migrate: bool,
    /// The compute unit requests are expected to stay aligned to
    pub compute_unit: Resources,
}
