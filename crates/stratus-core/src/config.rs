use serde::{Deserialize, Serialize};

use crate::agent::Resources;
use crate::error::{CoreError, Result};
use crate::quantities;

fn default_deviation_threshold() -> f32 {
    0.25
}

/// The enforcer configuration document.
///
/// Loaded from YAML at startup and replaceable at runtime, with the exception
/// of `mem_slot_size`: the entire ledger is denominated in it, so changing it
/// requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    /// Bytes per memory slot, as a quantity string (e.g. "1Gi").
    /// Must parse to a positive integer.
    pub mem_slot_size: String,

    /// If true, a node with no Capacity for a resource may be hydrated from
    /// its Allocatable amount instead
    #[serde(default)]
    pub fallback_to_allocatable: bool,

    /// Maximum fractional change in 1-minute load average between selecting a
    /// migration victim and dispatching the migration; larger swings veto the
    /// migration so a better victim can be picked
    #[serde(default = "default_deviation_threshold")]
    pub migration_deviation_threshold: f32,

    /// Limits applied to nodes not matched by any override
    pub node_defaults: NodeConfig,

    /// Per-node-class overrides, first match wins
    #[serde(default)]
    pub node_overrides: Vec<NodeOverride>,
}

/// Limits configuration for one class of nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The {cpu, mem} ratio pod scaling on these nodes must respect
    pub compute_unit: Resources,
    pub cpu: ResourceConfig,
    pub memory: ResourceConfig,
}

/// Limits configuration for one resource on one class of nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Amount pre-reserved for system overhead, in ledger units
    pub system: u16,
    /// Fraction of the reservable amount above which migration is considered
    pub watermark: f32,
}

/// Overrides `node_defaults` for the named nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOverride {
    pub nodes: Vec<String>,
    pub config: NodeConfig,
}

/// Config-derived fields of a node's per-resource ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub system: u16,
    pub watermark: u16,
}

impl EnforcerConfig {
    /// Parse and validate a YAML configuration document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let conf: EnforcerConfig = serde_yaml::from_str(raw)
            .map_err(|e| CoreError::invalid_config(e.to_string(), "Fix the YAML document"))?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check the document for values the enforcer cannot operate with
    pub fn validate(&self) -> Result<()> {
        self.mem_slot_size_bytes()?;

        if !(self.migration_deviation_threshold > 0.0) {
            return Err(CoreError::invalid_config(
                "migration_deviation_threshold must be positive",
                "Use a fraction like 0.25",
            ));
        }

        self.node_defaults.validate("node_defaults")?;
        for (i, entry) in self.node_overrides.iter().enumerate() {
            if entry.nodes.is_empty() {
                return Err(CoreError::invalid_config(
                    format!("node_overrides[{}] matches no nodes", i),
                    "List at least one node name per override",
                ));
            }
            entry.config.validate(&format!("node_overrides[{}]", i))?;
        }
        Ok(())
    }

    /// The memory slot size in bytes
    pub fn mem_slot_size_bytes(&self) -> Result<i64> {
        let bytes = quantities::parse_memory(&self.mem_slot_size)?;
        if bytes <= 0 {
            return Err(CoreError::invalid_config(
                format!("mem_slot_size '{}' is not positive", self.mem_slot_size),
                "Use a positive quantity like '1Gi'",
            ));
        }
        Ok(bytes)
    }

    /// Resolve the limits configuration for a node, first matching override
    /// wins
    pub fn for_node(&self, node_name: &str) -> &NodeConfig {
        self.node_overrides
            .iter()
            .find(|o| o.nodes.iter().any(|n| n == node_name))
            .map(|o| &o.config)
            .unwrap_or(&self.node_defaults)
    }
}

impl NodeConfig {
    fn validate(&self, context: &str) -> Result<()> {
        if self.compute_unit.vcpu == 0 || self.compute_unit.mem == 0 {
            return Err(CoreError::invalid_config(
                format!("{}: compute_unit components must be nonzero", context),
                "Requested increases are quantised to the compute unit; zero would make every increase impossible",
            ));
        }
        self.cpu.validate(&format!("{}.cpu", context))?;
        self.memory.validate(&format!("{}.memory", context))?;
        Ok(())
    }
}

impl ResourceConfig {
    fn validate(&self, context: &str) -> Result<()> {
        if !(self.watermark > 0.0 && self.watermark <= 1.0) {
            return Err(CoreError::invalid_config(
                format!("{}: watermark {} outside (0, 1]", context, self.watermark),
                "The watermark is a fraction of the reservable amount",
            ));
        }
        Ok(())
    }

    /// Derive a node's system and watermark amounts from its raw total
    pub fn node_limits(&self, total: u16) -> Result<ResourceLimits> {
        if self.system > total {
            return Err(CoreError::invalid_config(
                format!(
                    "system reservation {} exceeds node total {}",
                    self.system, total
                ),
                "Lower the system reservation for this node class, or exclude the node",
            ));
        }
        let reservable = total - self.system;
        let watermark = (f64::from(reservable) * f64::from(self.watermark)).floor() as u16;
        Ok(ResourceLimits {
            system: self.system,
            watermark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
mem_slot_size: "1Gi"
fallback_to_allocatable: false
node_defaults:
  compute_unit: { cpu: 1, mem: 1 }
  cpu: { system: 2, watermark: 0.75 }
  memory: { system: 1, watermark: 0.75 }
node_overrides:
  - nodes: [ "gpu-a" ]
    config:
      compute_unit: { cpu: 4, mem: 4 }
      cpu: { system: 4, watermark: 0.5 }
      memory: { system: 2, watermark: 0.5 }
"#
    }

    #[test]
    fn test_from_yaml() {
        let conf = EnforcerConfig::from_yaml(sample_yaml()).unwrap();
        assert_eq!(conf.mem_slot_size_bytes().unwrap(), 1 << 30);
        assert_eq!(conf.node_defaults.compute_unit, Resources::new(1, 1));
        assert_eq!(conf.migration_deviation_threshold, 0.25);
    }

    #[test]
    fn test_for_node_override() {
        let conf = EnforcerConfig::from_yaml(sample_yaml()).unwrap();
        assert_eq!(conf.for_node("worker-1").compute_unit, Resources::new(1, 1));
        assert_eq!(conf.for_node("gpu-a").compute_unit, Resources::new(4, 4));
    }

    #[test]
    fn test_validate_rejects_bad_slot_size() {
        let mut conf = EnforcerConfig::from_yaml(sample_yaml()).unwrap();
        conf.mem_slot_size = "0".to_string();
        assert!(conf.validate().is_err());
        conf.mem_slot_size = "nonsense".to_string();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_watermark() {
        let mut conf = EnforcerConfig::from_yaml(sample_yaml()).unwrap();
        conf.node_defaults.cpu.watermark = 0.0;
        assert!(conf.validate().is_err());
        conf.node_defaults.cpu.watermark = 1.5;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_compute_unit() {
        let mut conf = EnforcerConfig::from_yaml(sample_yaml()).unwrap();
        conf.node_defaults.compute_unit = Resources::new(0, 1);
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_node_limits() {
        let rc = ResourceConfig {
            system: 2,
            watermark: 0.75,
        };
        let limits = rc.node_limits(10).unwrap();
        assert_eq!(limits.system, 2);
        assert_eq!(limits.watermark, 6); // floor(8 * 0.75)

        // system larger than the node is a config error
        assert!(rc.node_limits(1).is_err());
    }
}
