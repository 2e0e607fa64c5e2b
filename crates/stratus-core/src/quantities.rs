use crate::error::{CoreError, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;

/// Parse a CPU quantity string (e.g., "2", "1500m", "0.5") into millicores
pub fn parse_cpu(s: &str) -> Result<i64> {
    if let Some(m) = s.strip_suffix('m') {
        m.parse::<i64>()
            .map_err(|e| CoreError::invalid_quantity(s, format!("bad millicore value: {}", e)))
    } else if let Ok(cores) = s.parse::<f64>() {
        Ok((cores * 1000.0) as i64)
    } else {
        Err(CoreError::invalid_quantity(s, "unrecognized CPU format"))
    }
}

/// Parse a memory quantity string (e.g., "128Mi", "1Gi", "1024") into bytes
pub fn parse_memory(s: &str) -> Result<i64> {
    let parse = |num: &str, unit: i64| -> Result<i64> {
        num.parse::<i64>()
            .map(|n| n * unit)
            .map_err(|e| CoreError::invalid_quantity(s, e.to_string()))
    };

    if let Some(num) = s.strip_suffix("Ki") {
        parse(num, 1 << 10)
    } else if let Some(num) = s.strip_suffix("Mi") {
        parse(num, 1 << 20)
    } else if let Some(num) = s.strip_suffix("Gi") {
        parse(num, 1 << 30)
    } else if let Some(num) = s.strip_suffix("Ti") {
        parse(num, 1 << 40)
    } else {
        // Plain bytes
        parse(s, 1)
    }
}

/// Parse a k8s CPU `Quantity` into millicores
pub fn cpu_from_quantity(q: &Quantity) -> Result<i64> {
    parse_cpu(&q.0)
}

/// Parse a k8s memory `Quantity` into bytes
pub fn memory_from_quantity(q: &Quantity) -> Result<i64> {
    parse_memory(&q.0)
}

/// Raw (finer-than-ledger resolution) resource amounts, as summed from
/// container limits of non-VM pods
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RawResources {
    /// CPU in millicores (1000 = 1 core)
    pub cpu_millis: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
}

impl RawResources {
    /// Sum the container limits of a pod.
    ///
    /// For each container and each of cpu/memory, the limit must be present,
    /// and when a request is also present it must equal the limit. Anything
    /// else is an admission error for the pod.
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let spec = pod
            .spec
            .as_ref()
            .ok_or_else(|| CoreError::invalid_pod_resources("pod has no spec"))?;

        let mut total = RawResources::default();

        for (i, container) in spec.containers.iter().enumerate() {
            let resources = container.resources.as_ref();
            let limits = resources.and_then(|r| r.limits.as_ref());
            let requests = resources.and_then(|r| r.requests.as_ref());

            let cpu_limit = limits.and_then(|l| l.get("cpu")).ok_or_else(|| {
                CoreError::invalid_pod_resources(format!(
                    "containers[{}] ({:?}) missing resources.limits.cpu",
                    i, container.name
                ))
            })?;
            let cpu_limit = cpu_from_quantity(cpu_limit)?;
            if let Some(cpu_request) = requests.and_then(|r| r.get("cpu")) {
                if cpu_from_quantity(cpu_request)? != cpu_limit {
                    return Err(CoreError::invalid_pod_resources(format!(
                        "containers[{}] ({:?}) resources.requests.cpu != resources.limits.cpu",
                        i, container.name
                    )));
                }
            }
            total.cpu_millis += cpu_limit;

            let mem_limit = limits.and_then(|l| l.get("memory")).ok_or_else(|| {
                CoreError::invalid_pod_resources(format!(
                    "containers[{}] ({:?}) missing resources.limits.memory",
                    i, container.name
                ))
            })?;
            let mem_limit = memory_from_quantity(mem_limit)?;
            if let Some(mem_request) = requests.and_then(|r| r.get("memory")) {
                if memory_from_quantity(mem_request)? != mem_limit {
                    return Err(CoreError::invalid_pod_resources(format!(
                        "containers[{}] ({:?}) resources.requests.memory != resources.limits.memory",
                        i, container.name
                    )));
                }
            }
            total.memory_bytes += mem_limit;
        }

        Ok(total)
    }
}
