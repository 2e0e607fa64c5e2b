use std::collections::BTreeSet;

use serde::Serialize;
use stratus_core::{PodName, RawResources, Resources};
use tracing::debug;

use crate::ledger::NodeResourceState;
use crate::queue::MigrationQueue;

/// Everything the enforcer tracks for a node
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Node name, guaranteed unique by the orchestrator
    pub name: String,

    pub vcpu: NodeResourceState<u16>,
    pub mem_slots: NodeResourceState<u16>,

    /// The {cpu, mem} ratio reservations on this node must scale by
    pub compute_unit: Resources,

    /// VM pods reserved onto this node (bound or still reservable)
    pub pods: BTreeSet<PodName>,

    /// Non-VM pods tracked on this node
    pub other_pods: BTreeSet<PodName>,
    /// Aggregate resource usage of the non-VM pods
    pub other_resources: NodeOtherResourceState,

    /// Priority queue over this node's pods, best migration victim first
    pub mq: MigrationQueue,
}

impl NodeState {
    /// Whether pods should be migrated off this node to relieve pressure.
    ///
    /// Below the watermark on both resources there is nothing to relieve.
    /// Above it, migration is wanted when the pressure (the amount over the
    /// watermark, plus the demand currently being denied) exceeds what
    /// ongoing migrations are already expected to resolve.
    pub fn too_much_pressure(&self) -> bool {
        if self.vcpu.reserved <= self.vcpu.watermark
            && self.mem_slots.reserved <= self.mem_slots.watermark
        {
            debug!(
                node = %self.name,
                cpu_reserved = self.vcpu.reserved,
                cpu_watermark = self.vcpu.watermark,
                mem_reserved = self.mem_slots.reserved,
                mem_watermark = self.mem_slots.watermark,
                "tooMuchPressure = false (below watermarks)",
            );
            return false;
        }

        let logical_cpu = self.vcpu.reserved.saturating_sub(self.vcpu.watermark);
        let logical_mem = self.mem_slots.reserved.saturating_sub(self.mem_slots.watermark);

        let too_much_cpu =
            logical_cpu + self.vcpu.capacity_pressure > self.vcpu.pressure_accounted_for;
        let too_much_mem =
            logical_mem + self.mem_slots.capacity_pressure > self.mem_slots.pressure_accounted_for;

        let result = too_much_cpu || too_much_mem;
        debug!(
            node = %self.name,
            result,
            cpu_logical = logical_cpu,
            cpu_capacity = self.vcpu.capacity_pressure,
            cpu_accounted_for = self.vcpu.pressure_accounted_for,
            mem_logical = logical_mem,
            mem_capacity = self.mem_slots.capacity_pressure,
            mem_accounted_for = self.mem_slots.pressure_accounted_for,
            "tooMuchPressure",
        );
        result
    }
}

/// Aggregate resources of a node's non-VM pods.
///
/// The raw amounts keep the orchestrator's finer resolution (millicores,
/// bytes); the reserved amounts are their ledger-unit equivalents, rounded
/// up, and are what feeds back into the node's primary ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeOtherResourceState {
    pub raw: RawResources,
    pub reserved_cpu: u16,
    pub reserved_mem_slots: u16,
}

impl NodeOtherResourceState {
    /// The state after adding a pod's resources. Returning the new state
    /// (rather than mutating) lets the caller check fit, and log before and
    /// after, before committing.
    pub fn add_pod(&self, mem_slot_bytes: i64, pod: &RawResources) -> Self {
        let mut next = Self {
            raw: RawResources {
                cpu_millis: self.raw.cpu_millis + pod.cpu_millis,
                memory_bytes: self.raw.memory_bytes + pod.memory_bytes,
            },
            ..*self
        };
        next.calculate_reserved(mem_slot_bytes);
        next
    }

    /// The state after removing a pod's resources.
    ///
    /// Underflow here means the books are already wrong; short of a slow
    /// leak, overflow is next to impossible, so underflow is the case worth
    /// guarding. It is a fatal error.
    pub fn sub_pod(&self, mem_slot_bytes: i64, pod: &RawResources) -> Self {
        if self.raw.cpu_millis < pod.cpu_millis {
            panic!(
                "underflow: cannot subtract {}m pod CPU from {}m node CPU",
                pod.cpu_millis, self.raw.cpu_millis,
            );
        }
        if self.raw.memory_bytes < pod.memory_bytes {
            panic!(
                "underflow: cannot subtract {}B pod memory from {}B node memory",
                pod.memory_bytes, self.raw.memory_bytes,
            );
        }

        let mut next = Self {
            raw: RawResources {
                cpu_millis: self.raw.cpu_millis - pod.cpu_millis,
                memory_bytes: self.raw.memory_bytes - pod.memory_bytes,
            },
            ..*self
        };
        next.calculate_reserved(mem_slot_bytes);
        next
    }

    // Fractional CPU and partial slots still block the whole unit, hence
    // rounding up.
    fn calculate_reserved(&mut self, mem_slot_bytes: i64) {
        let cpu = (self.raw.cpu_millis + 999) / 1000;
        if cpu > i64::from(u16::MAX) {
            panic!("reserved CPU for non-VM pods overflows u16 ({})", cpu);
        }
        self.reserved_cpu = cpu as u16;

        let slots = (self.raw.memory_bytes + mem_slot_bytes - 1) / mem_slot_bytes;
        if slots > i64::from(u16::MAX) {
            panic!(
                "reserved memory slots for non-VM pods overflows u16 ({})",
                slots
            );
        }
        self.reserved_mem_slots = slots as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NodeResourceState;

    const GIB: i64 = 1 << 30;

    fn node_with(
        vcpu: NodeResourceState<u16>,
        mem_slots: NodeResourceState<u16>,
    ) -> NodeState {
        NodeState {
            name: "node-1".to_string(),
            vcpu,
            mem_slots,
            compute_unit: Resources::new(1, 1),
            pods: BTreeSet::new(),
            other_pods: BTreeSet::new(),
            other_resources: NodeOtherResourceState::default(),
            mq: MigrationQueue::new(),
        }
    }

    #[test]
    fn test_no_pressure_below_watermarks() {
        let node = node_with(
            NodeResourceState {
                total: 8,
                watermark: 6,
                reserved: 6,
                ..Default::default()
            },
            NodeResourceState {
                total: 8,
                watermark: 6,
                reserved: 3,
                ..Default::default()
            },
        );
        assert!(!node.too_much_pressure());
    }

    #[test]
    fn test_pressure_above_watermark() {
        let node = node_with(
            NodeResourceState {
                total: 8,
                watermark: 6,
                reserved: 7,
                ..Default::default()
            },
            NodeResourceState {
                total: 8,
                watermark: 6,
                reserved: 3,
                ..Default::default()
            },
        );
        assert!(node.too_much_pressure());
    }

    #[test]
    fn test_pressure_already_accounted_for() {
        // one unit over the watermark, but an ongoing migration is expected
        // to free three
        let node = node_with(
            NodeResourceState {
                total: 8,
                watermark: 6,
                reserved: 7,
                pressure_accounted_for: 3,
                ..Default::default()
            },
            NodeResourceState {
                total: 8,
                watermark: 6,
                ..Default::default()
            },
        );
        assert!(!node.too_much_pressure());
    }

    #[test]
    fn test_capacity_pressure_counts() {
        let node = node_with(
            NodeResourceState {
                total: 8,
                watermark: 6,
                reserved: 7,
                capacity_pressure: 3,
                pressure_accounted_for: 3,
                ..Default::default()
            },
            NodeResourceState {
                total: 8,
                watermark: 6,
                ..Default::default()
            },
        );
        assert!(node.too_much_pressure());
    }

    #[test]
    fn test_other_resources_round_up() {
        let state = NodeOtherResourceState::default();
        let state = state.add_pod(
            GIB,
            &RawResources {
                cpu_millis: 1500,
                memory_bytes: GIB + GIB / 2,
            },
        );
        assert_eq!(state.reserved_cpu, 2);
        assert_eq!(state.reserved_mem_slots, 2);

        // a second pod shares the rounding slack
        let state = state.add_pod(
            GIB,
            &RawResources {
                cpu_millis: 500,
                memory_bytes: GIB / 2,
            },
        );
        assert_eq!(state.raw.cpu_millis, 2000);
        assert_eq!(state.reserved_cpu, 2);
        assert_eq!(state.reserved_mem_slots, 2);
    }

    #[test]
    fn test_other_resources_sub_restores() {
        let pod = RawResources {
            cpu_millis: 1500,
            memory_bytes: GIB,
        };
        let state = NodeOtherResourceState::default().add_pod(GIB, &pod);
        let state = state.sub_pod(GIB, &pod);
        assert_eq!(state, NodeOtherResourceState::default());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_other_resources_underflow_panics() {
        let state = NodeOtherResourceState::default();
        state.sub_pod(
            GIB,
            &RawResources {
                cpu_millis: 1,
                memory_bytes: 0,
            },
        );
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_other_resources_memory_underflow_panics() {
        let state = NodeOtherResourceState::default().add_pod(
            GIB,
            &RawResources {
                cpu_millis: 1000,
                memory_bytes: 0,
            },
        );
        state.sub_pod(
            GIB,
            &RawResources {
                cpu_millis: 500,
                memory_bytes: 1,
            },
        );
    }
}
