use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Stratus operations
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// A resource quantity string could not be parsed
    #[error("Invalid quantity '{value}': {reason}")]
    #[diagnostic(
        code(stratus::invalid_quantity),
        help("Use a Kubernetes-style quantity like '2', '1500m', '256Mi' or '1Gi'")
    )]
    InvalidQuantity { value: String, reason: String },

    /// The configuration document failed validation
    #[error("Invalid configuration: {reason}")]
    #[diagnostic(code(stratus::invalid_config), help("{suggestion}"))]
    InvalidConfig { reason: String, suggestion: String },

    /// A pod's resource specification is unusable
    #[error("Invalid pod resources: {reason}")]
    #[diagnostic(
        code(stratus::invalid_pod_resources),
        help("Every container needs resources.limits for cpu and memory, with requests equal to limits when set")
    )]
    InvalidPodResources { reason: String },

    /// A VM pod's metadata contract is broken
    #[error("Invalid VM pod metadata: {reason}")]
    #[diagnostic(
        code(stratus::invalid_vm_metadata),
        help("VM pods must carry the scaling-bounds annotation as JSON")
    )]
    InvalidVmMetadata { reason: String },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InvalidPodResources error
    pub fn invalid_pod_resources(reason: impl Into<String>) -> Self {
        Self::InvalidPodResources {
            reason: reason.into(),
        }
    }

    /// Create an InvalidVmMetadata error
    pub fn invalid_vm_metadata(reason: impl Into<String>) -> Self {
        Self::InvalidVmMetadata {
            reason: reason.into(),
        }
    }
}
