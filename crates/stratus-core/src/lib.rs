//! Stratus Core - Shared types for the Stratus autoscale-enforcer
//!
//! This crate provides:
//! - Resource quantity parsing and unit conversion (cores, memory slots)
//! - The agent wire protocol types (requests, permits, metrics)
//! - The enforcer configuration document
//! - The VM pod metadata contract (labels and annotations)
//! - Error types with miette diagnostics

pub mod agent;
pub mod config;
pub mod error;
pub mod quantities;
pub mod vm;

// Re-export commonly used types
pub use agent::{AgentRequest, AgentResponse, Bounds, Metrics, PodName, Resources};
pub use config::{EnforcerConfig, NodeConfig, NodeOverride, ResourceConfig, ResourceLimits};
pub use error::{CoreError, Result};
pub use quantities::RawResources;
pub use vm::{ScalingBounds, VmBounds, VmPodInfo};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Node, Pod};
