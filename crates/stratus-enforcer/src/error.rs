use miette::Diagnostic;
use stratus_core::CoreError;
use thiserror::Error;

/// Enforcer error type
#[derive(Error, Debug, Diagnostic)]
pub enum EnforcerError {
    /// A node is missing the capacity information hydration needs
    #[error("Node {node} has no usable {resource} capacity")]
    #[diagnostic(
        code(enforcer::missing_capacity),
        help("Set fallback_to_allocatable: true to use the Allocatable amount as a temporary hotfix")
    )]
    MissingCapacity {
        node: String,
        resource: String,
        has_allocatable: bool,
    },

    /// A node's resources don't fit the 16-bit ledger
    #[error("Node {node}: {what} ({value}) exceeds the ledger range")]
    #[diagnostic(
        code(enforcer::resource_overflow),
        help("Increase mem_slot_size so the node's slot count fits in 16 bits")
    )]
    ResourceOverflow {
        node: String,
        what: String,
        value: i64,
    },

    /// A pod claiming to be VM-bearing has unusable metadata
    #[error("VM pod {pod} is invalid: {reason}")]
    #[diagnostic(
        code(enforcer::invalid_vm_pod),
        help("Check the pod's VM labels and scaling-bounds annotation")
    )]
    InvalidVmPod { pod: String, reason: String },

    /// A non-VM pod's resource spec fails admission
    #[error("Pod {pod} has an invalid resource spec: {reason}")]
    #[diagnostic(
        code(enforcer::invalid_pod_spec),
        help("Non-VM pods need resources.limits for cpu and memory, with requests equal to limits when set")
    )]
    InvalidPodSpec { pod: String, reason: String },

    /// Not enough room on the node for the pod
    #[error(
        "Not enough {resource} on node {node} for pod {pod}: wanted {requested}, have {remaining}"
    )]
    #[diagnostic(
        code(enforcer::unschedulable),
        help("The scheduling framework may retry the pod on another node")
    )]
    Unschedulable {
        pod: String,
        node: String,
        resource: String,
        requested: u16,
        remaining: u16,
    },

    /// The pod is not tracked by this scheduler
    #[error("Pod {pod} is not present in the pod map")]
    #[diagnostic(
        code(enforcer::pod_not_found),
        help("The pod may not have been scheduled by this scheduler, or was already deleted")
    )]
    PodNotFound { pod: String },

    /// The agent asked for more than the pod's scaling bounds allow
    #[error("Pod {pod} requested {requested} {resource}, above its maximum of {max}")]
    #[diagnostic(
        code(enforcer::request_out_of_bounds),
        help("Agents must keep requests within the VM's configured scaling bounds")
    )]
    RequestOutOfBounds {
        pod: String,
        resource: String,
        requested: u16,
        max: u16,
    },

    /// The pod already has a migration underway
    #[error("Pod {pod} is already migrating")]
    #[diagnostic(code(enforcer::already_migrating))]
    AlreadyMigrating { pod: String },

    /// The pod no longer looks like the right migration victim
    #[error("Refusing to migrate pod {pod}: {reason}")]
    #[diagnostic(
        code(enforcer::migration_vetoed),
        help("Re-select a victim from the migration queue and try again")
    )]
    MigrationVetoed { pod: String, reason: String },

    /// The orchestrator API call failed
    #[error("Orchestrator API error: {message}")]
    #[diagnostic(
        code(enforcer::api_error),
        help("The call may be retried on the next scheduling cycle")
    )]
    Api { message: String },

    /// Core error (quantities, configuration, pod metadata)
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),
}

/// Result type for enforcer operations
pub type Result<T> = std::result::Result<T, EnforcerError>;

impl EnforcerError {
    /// Create a MissingCapacity error
    pub fn missing_capacity(
        node: impl Into<String>,
        resource: impl Into<String>,
        has_allocatable: bool,
    ) -> Self {
        Self::MissingCapacity {
            node: node.into(),
            resource: resource.into(),
            has_allocatable,
        }
    }

    /// Create a ResourceOverflow error
    pub fn resource_overflow(node: impl Into<String>, what: impl Into<String>, value: i64) -> Self {
        Self::ResourceOverflow {
            node: node.into(),
            what: what.into(),
            value,
        }
    }

    /// Create an InvalidVmPod error
    pub fn invalid_vm_pod(pod: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVmPod {
            pod: pod.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidPodSpec error
    pub fn invalid_pod_spec(pod: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPodSpec {
            pod: pod.into(),
            reason: reason.into(),
        }
    }

    /// Create a PodNotFound error
    pub fn pod_not_found(pod: impl ToString) -> Self {
        Self::PodNotFound {
            pod: pod.to_string(),
        }
    }

    /// Create an AlreadyMigrating error
    pub fn already_migrating(pod: impl ToString) -> Self {
        Self::AlreadyMigrating {
            pod: pod.to_string(),
        }
    }

    /// Create a MigrationVetoed error
    pub fn migration_vetoed(pod: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MigrationVetoed {
            pod: pod.into(),
            reason: reason.into(),
        }
    }

    /// Create an Api error
    pub fn api_error(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }
}
