use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Node, NodeStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use stratus_core::{quantities, EnforcerConfig, Metrics, PodName, RawResources, Resources};
use tracing::{info, warn};

use crate::error::{EnforcerError, Result};
use crate::ledger::{NodeResourceState, PodResourceState};
use crate::node::{NodeOtherResourceState, NodeState};
use crate::pod::{OtherPodState, PodState};

/// The private state of the plugin: every node and pod the enforcer knows
/// about, plus the configuration.
///
/// Fields may only be accessed while holding the plugin lock; the dispatch
/// layer owns that lock.
pub struct PluginState {
    pub(crate) conf: EnforcerConfig,
    /// Bytes per memory slot, resolved once at startup. The whole ledger is
    /// denominated in it, so it cannot change at runtime.
    pub(crate) mem_slot_bytes: i64,

    pub(crate) nodes: HashMap<String, NodeState>,
    pub(crate) pods: HashMap<PodName, PodState>,
    pub(crate) other_pods: HashMap<PodName, OtherPodState>,

    /// Largest total-reservable CPU of any node, for scaling node scores
    pub(crate) max_total_reservable_cpu: u16,
    /// Largest total-reservable memory of any node, in slots
    pub(crate) max_total_reservable_mem_slots: u16,
}

impl PluginState {
    pub fn new(conf: EnforcerConfig) -> Result<Self> {
        conf.validate()?;
        let mem_slot_bytes = conf.mem_slot_size_bytes()?;
        Ok(Self {
            conf,
            mem_slot_bytes,
            nodes: HashMap::new(),
            pods: HashMap::new(),
            other_pods: HashMap::new(),
            max_total_reservable_cpu: 0,
            max_total_reservable_mem_slots: 0,
        })
    }

    /// Build a node entry from a freshly fetched node object.
    ///
    /// CPU is truncated from millicores to whole cores (a fractional core
    /// must not be advertised as available); memory is floor-divided into
    /// slots. Slot counts beyond the 16-bit ledger refuse hydration.
    pub(crate) fn node_state_from_api(&self, name: &str, node: &Node) -> Result<NodeState> {
        let node_conf = self.conf.for_node(name);
        let status = node.status.as_ref();

        let cpu_q = capacity_quantity(name, status, "cpu", self.conf.fallback_to_allocatable)?;
        let cpu_millis = quantities::cpu_from_quantity(cpu_q)?;
        let total_cpu = cpu_millis / 1000;
        if !(0..=i64::from(u16::MAX)).contains(&total_cpu) {
            return Err(EnforcerError::resource_overflow(name, "CPU cores", total_cpu));
        }
        let cpu_limits = node_conf.cpu.node_limits(total_cpu as u16)?;
        let vcpu = NodeResourceState {
            total: total_cpu as u16,
            system: cpu_limits.system,
            watermark: cpu_limits.watermark,
            ..Default::default()
        };

        let mem_q = capacity_quantity(name, status, "memory", self.conf.fallback_to_allocatable)?;
        let mem_bytes = quantities::memory_from_quantity(mem_q)?;
        let total_slots = mem_bytes / self.mem_slot_bytes;
        if !(0..=i64::from(u16::MAX)).contains(&total_slots) {
            return Err(EnforcerError::resource_overflow(
                name,
                "memory slots",
                total_slots,
            ));
        }
        let mem_limits = node_conf.memory.node_limits(total_slots as u16)?;
        let mem_slots = NodeResourceState {
            total: total_slots as u16,
            system: mem_limits.system,
            watermark: mem_limits.watermark,
            ..Default::default()
        };

        let state = NodeState {
            name: name.to_string(),
            vcpu,
            mem_slots,
            compute_unit: node_conf.compute_unit,
            pods: Default::default(),
            other_pods: Default::default(),
            other_resources: NodeOtherResourceState::default(),
            mq: Default::default(),
        };

        info!(
            node = name,
            cpu_total = state.vcpu.total,
            cpu_millis,
            cpu_reservable = state.vcpu.total_reservable(),
            cpu_watermark = state.vcpu.watermark,
            mem_total_slots = state.mem_slots.total,
            mem_bytes,
            mem_reservable = state.mem_slots.total_reservable(),
            mem_watermark = state.mem_slots.watermark,
            "fetched node",
        );

        Ok(state)
    }

    /// Install a hydrated node, bumping the cluster-wide maxima used for
    /// score normalisation
    pub(crate) fn register_node(&mut self, node: NodeState) {
        let reservable_cpu = node.vcpu.total_reservable();
        if reservable_cpu > self.max_total_reservable_cpu {
            self.max_total_reservable_cpu = reservable_cpu;
        }
        let reservable_mem = node.mem_slots.total_reservable();
        if reservable_mem > self.max_total_reservable_mem_slots {
            self.max_total_reservable_mem_slots = reservable_mem;
        }
        self.nodes.insert(node.name.clone(), node);
    }

    /// Score a node 0-100 by remaining headroom, normalised against the
    /// roomiest node in the cluster so scores are comparable across nodes
    pub fn node_score(&self, node_name: &str) -> Option<i32> {
        let node = self.nodes.get(node_name)?;

        if self.max_total_reservable_cpu == 0 || self.max_total_reservable_mem_slots == 0 {
            return Some(0);
        }

        let cpu = f64::from(node.vcpu.remaining_reservable())
            / f64::from(self.max_total_reservable_cpu);
        let mem = f64::from(node.mem_slots.remaining_reservable())
            / f64::from(self.max_total_reservable_mem_slots);

        let score = ((cpu + mem) / 2.0 * 100.0).clamp(0.0, 100.0) as i32;
        Some(score)
    }

    /// Apply a new configuration document.
    ///
    /// Every node's system and watermark amounts are recomputed; reserved
    /// amounts are left alone, so `reserved <= total - system` may be
    /// violated until the agents' next requests converge it back down.
    pub fn handle_updated_conf(&mut self, new_conf: EnforcerConfig) -> Result<()> {
        new_conf.validate()?;
        let new_slot_bytes = new_conf.mem_slot_size_bytes()?;
        if new_slot_bytes != self.mem_slot_bytes {
            return Err(stratus_core::CoreError::invalid_config(
                format!(
                    "mem_slot_size changed from {} to {} bytes",
                    self.mem_slot_bytes, new_slot_bytes
                ),
                "The ledger is denominated in the slot size; restart the scheduler to change it",
            )
            .into());
        }

        // Validate the limits for every node before touching any of them
        let mut updates = Vec::with_capacity(self.nodes.len());
        for (name, node) in &self.nodes {
            let node_conf = new_conf.for_node(name);
            let cpu = node_conf.cpu.node_limits(node.vcpu.total)?;
            let mem = node_conf.memory.node_limits(node.mem_slots.total)?;
            updates.push((name.clone(), cpu, mem, node_conf.compute_unit));
        }

        for (name, cpu, mem, compute_unit) in updates {
            let node = self
                .nodes
                .get_mut(&name)
                .unwrap_or_else(|| panic!("node {} vanished during config update", name));
            node.vcpu.system = cpu.system;
            node.vcpu.watermark = cpu.watermark;
            node.mem_slots.system = mem.system;
            node.mem_slots.watermark = mem.watermark;
            node.compute_unit = compute_unit;

            info!(
                node = %name,
                cpu_system = cpu.system,
                cpu_watermark = cpu.watermark,
                mem_system = mem.system,
                mem_watermark = mem.watermark,
                "updated node limits from new config",
            );
            if node.vcpu.reserved > node.vcpu.total_reservable()
                || node.mem_slots.reserved > node.mem_slots.total_reservable()
            {
                warn!(
                    node = %name,
                    "reserved exceeds the reservable amount under the new config; \
                     will converge as agents make contact",
                );
            }
        }

        self.conf = new_conf;
        self.recompute_maxima();
        Ok(())
    }

    fn recompute_maxima(&mut self) {
        self.max_total_reservable_cpu = self
            .nodes
            .values()
            .map(|n| n.vcpu.total_reservable())
            .max()
            .unwrap_or(0);
        self.max_total_reservable_mem_slots = self
            .nodes
            .values()
            .map(|n| n.mem_slots.total_reservable())
            .max()
            .unwrap_or(0);
    }

    /// Snapshot the entire plugin state for the debug endpoint and tests
    pub fn dump(&self) -> StateDump {
        let mut nodes: Vec<NodeDump> = self
            .nodes
            .values()
            .map(|n| NodeDump {
                name: n.name.clone(),
                vcpu: n.vcpu,
                mem_slots: n.mem_slots,
                compute_unit: n.compute_unit,
                other_resources: n.other_resources,
                migration_queue: n.mq.entries().to_vec(),
                score: self.node_score(&n.name).unwrap_or(0),
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut vm_pods: Vec<PodDump> = self
            .pods
            .values()
            .map(|p| PodDump {
                name: p.name.clone(),
                vm_name: p.vm_name.clone(),
                node: p.node.clone(),
                vcpu: p.vcpu,
                mem_slots: p.mem_slots,
                metrics: p.metrics,
                currently_migrating: p.currently_migrating(),
                mq_index: p.mq_index,
            })
            .collect();
        vm_pods.sort_by(|a, b| a.name.cmp(&b.name));

        let mut other_pods: Vec<OtherPodDump> = self
            .other_pods
            .values()
            .map(|p| OtherPodDump {
                name: p.name.clone(),
                node: p.node.clone(),
                resources: p.resources,
            })
            .collect();
        other_pods.sort_by(|a, b| a.name.cmp(&b.name));

        StateDump {
            nodes,
            vm_pods,
            other_pods,
            max_total_reservable_cpu: self.max_total_reservable_cpu,
            max_total_reservable_mem_slots: self.max_total_reservable_mem_slots,
        }
    }
}

fn capacity_quantity<'a>(
    node: &str,
    status: Option<&'a NodeStatus>,
    resource: &str,
    fallback_to_allocatable: bool,
) -> Result<&'a Quantity> {
    let capacity = status
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(resource));
    if let Some(q) = capacity {
        return Ok(q);
    }

    let allocatable = status
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get(resource));
    match allocatable {
        Some(q) if fallback_to_allocatable => {
            warn!(
                node,
                resource, "node has no capacity limit, using allocatable limit",
            );
            Ok(q)
        }
        Some(_) => Err(EnforcerError::missing_capacity(node, resource, true)),
        None => Err(EnforcerError::missing_capacity(node, resource, false)),
    }
}

/// Point-in-time copy of the plugin state, serialisable for the debug
/// endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StateDump {
    pub nodes: Vec<NodeDump>,
    pub vm_pods: Vec<PodDump>,
    pub other_pods: Vec<OtherPodDump>,
    pub max_total_reservable_cpu: u16,
    pub max_total_reservable_mem_slots: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDump {
    pub name: String,
    pub vcpu: NodeResourceState<u16>,
    pub mem_slots: NodeResourceState<u16>,
    pub compute_unit: Resources,
    pub other_resources: NodeOtherResourceState,
    /// Queue contents in heap order; pods' `mq_index` values point into this
    pub migration_queue: Vec<PodName>,
    pub score: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodDump {
    pub name: PodName,
    pub vm_name: String,
    pub node: String,
    pub vcpu: PodResourceState<u16>,
    pub mem_slots: PodResourceState<u16>,
    pub metrics: Option<Metrics>,
    pub currently_migrating: bool,
    pub mq_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtherPodDump {
    pub name: PodName,
    pub node: String,
    pub resources: RawResources,
}

impl StateDump {
    /// Find a node by name; test convenience
    pub fn node(&self, name: &str) -> Option<&NodeDump> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Find a VM pod by name; test convenience
    pub fn vm_pod(&self, name: &PodName) -> Option<&PodDump> {
        self.vm_pods.iter().find(|p| &p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stratus_core::config::{NodeConfig, NodeOverride, ResourceConfig};

    fn test_conf() -> EnforcerConfig {
        EnforcerConfig {
            mem_slot_size: "1Gi".to_string(),
            fallback_to_allocatable: false,
            migration_deviation_threshold: 0.25,
            node_defaults: NodeConfig {
                compute_unit: Resources::new(1, 1),
                cpu: ResourceConfig {
                    system: 1,
                    watermark: 0.75,
                },
                memory: ResourceConfig {
                    system: 1,
                    watermark: 0.75,
                },
            },
            node_overrides: vec![],
        }
    }

    fn test_node(name: &str, cpu: &str, memory: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), Quantity(cpu.to_string()));
        capacity.insert("memory".to_string(), Quantity(memory.to_string()));
        node.status = Some(NodeStatus {
            capacity: Some(capacity),
            ..Default::default()
        });
        node
    }

    #[test]
    fn test_hydration_truncates_cpu() {
        let state = PluginState::new(test_conf()).unwrap();
        // 7900m must become 7 cores, not 8
        let node = test_node("n1", "7900m", "8Gi");
        let ns = state.node_state_from_api("n1", &node).unwrap();
        assert_eq!(ns.vcpu.total, 7);
        assert_eq!(ns.vcpu.system, 1);
        assert_eq!(ns.vcpu.watermark, 4); // floor(6 * 0.75)
        assert_eq!(ns.mem_slots.total, 8);
    }

    #[test]
    fn test_hydration_floors_mem_slots() {
        let state = PluginState::new(test_conf()).unwrap();
        let node = test_node("n1", "8", "2560Mi"); // 2.5 slots -> 2
        let ns = state.node_state_from_api("n1", &node).unwrap();
        assert_eq!(ns.mem_slots.total, 2);
    }

    #[test]
    fn test_hydration_missing_capacity() {
        let state = PluginState::new(test_conf()).unwrap();
        let mut node = test_node("n1", "8", "8Gi");
        node.status.as_mut().unwrap().capacity = None;
        let err = state.node_state_from_api("n1", &node).unwrap_err();
        assert!(matches!(
            err,
            EnforcerError::MissingCapacity {
                has_allocatable: false,
                ..
            }
        ));
    }

    #[test]
    fn test_hydration_fallback_to_allocatable() {
        let mut conf = test_conf();
        conf.fallback_to_allocatable = true;
        let state = PluginState::new(conf).unwrap();

        let mut node = test_node("n1", "8", "8Gi");
        let status = node.status.as_mut().unwrap();
        status.allocatable = status.capacity.take();
        let ns = state.node_state_from_api("n1", &node).unwrap();
        assert_eq!(ns.vcpu.total, 8);

        // same node without the fallback is an error that names the hotfix
        let state = PluginState::new(test_conf()).unwrap();
        let err = state.node_state_from_api("n1", &node).unwrap_err();
        assert!(matches!(
            err,
            EnforcerError::MissingCapacity {
                has_allocatable: true,
                ..
            }
        ));
    }

    #[test]
    fn test_hydration_slot_overflow() {
        let state = PluginState::new(test_conf()).unwrap();
        let node = test_node("n1", "8", "65537Gi");
        let err = state.node_state_from_api("n1", &node).unwrap_err();
        assert!(matches!(err, EnforcerError::ResourceOverflow { .. }));
    }

    #[test]
    fn test_register_node_updates_maxima() {
        let mut state = PluginState::new(test_conf()).unwrap();
        let small = state
            .node_state_from_api("small", &test_node("small", "4", "4Gi"))
            .unwrap();
        let big = state
            .node_state_from_api("big", &test_node("big", "16", "16Gi"))
            .unwrap();
        state.register_node(small);
        assert_eq!(state.max_total_reservable_cpu, 3);
        state.register_node(big);
        assert_eq!(state.max_total_reservable_cpu, 15);
        assert_eq!(state.max_total_reservable_mem_slots, 15);

        // the empty big node scores highest
        assert_eq!(state.node_score("big"), Some(100));
        assert!(state.node_score("small").unwrap() < 100);
        assert_eq!(state.node_score("absent"), None);
    }

    #[test]
    fn test_updated_conf_recomputes_limits() {
        let mut state = PluginState::new(test_conf()).unwrap();
        let node = state
            .node_state_from_api("n1", &test_node("n1", "8", "8Gi"))
            .unwrap();
        state.register_node(node);
        state.nodes.get_mut("n1").unwrap().vcpu.reserved = 6;

        let mut new_conf = test_conf();
        new_conf.node_overrides = vec![NodeOverride {
            nodes: vec!["n1".to_string()],
            config: NodeConfig {
                compute_unit: Resources::new(2, 2),
                cpu: ResourceConfig {
                    system: 4,
                    watermark: 0.5,
                },
                memory: ResourceConfig {
                    system: 2,
                    watermark: 0.5,
                },
            },
        }];
        state.handle_updated_conf(new_conf).unwrap();

        let n1 = &state.nodes["n1"];
        assert_eq!(n1.vcpu.system, 4);
        assert_eq!(n1.vcpu.watermark, 2);
        assert_eq!(n1.compute_unit, Resources::new(2, 2));
        // reserved is untouched, even though it now exceeds total - system
        assert_eq!(n1.vcpu.reserved, 6);
        assert_eq!(n1.vcpu.remaining_reservable(), 0);
        // maxima follow the new limits
        assert_eq!(state.max_total_reservable_cpu, 4);
    }

    #[test]
    fn test_updated_conf_rejects_slot_size_change() {
        let mut state = PluginState::new(test_conf()).unwrap();
        let mut new_conf = test_conf();
        new_conf.mem_slot_size = "2Gi".to_string();
        assert!(state.handle_updated_conf(new_conf).is_err());
    }
}
