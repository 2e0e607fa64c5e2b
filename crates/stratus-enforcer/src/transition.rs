//! The resource transitioner: every ledger mutation the enforcer performs
//! goes through one of the handlers here, once per resource kind. Each
//! handler snapshots the slots first and returns a verdict string describing
//! what changed, for the operation log.

use std::cmp;
use std::fmt;

use crate::ledger::{NodeResourceState, PodResourceState, ResourceUnit};

/// Paired per-resource verdicts from one transition
#[derive(Debug, Clone)]
pub struct VerdictSet {
    pub cpu: String,
    pub mem: String,
}

impl fmt::Display for VerdictSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu: {}; mem: {}", self.cpu, self.mem)
    }
}

/// Borrows one node resource slot and the matching slot of one of that
/// node's pods, for the duration of a single transition
pub struct ResourceTransitioner<'a, T> {
    node: &'a mut NodeResourceState<T>,
    pod: &'a mut PodResourceState<T>,
}

/// A point-in-time copy of both slots, for verdict formatting
struct Snapshot<T> {
    node: NodeResourceState<T>,
    pod: PodResourceState<T>,
}

impl<'a, T: ResourceUnit> ResourceTransitioner<'a, T> {
    pub fn new(node: &'a mut NodeResourceState<T>, pod: &'a mut PodResourceState<T>) -> Self {
        Self { node, pod }
    }

    fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            node: *self.node,
            pod: *self.pod,
        }
    }

    /// Clear the pod's buffer now that the agent has spoken for itself,
    /// returning the verdict fragments describing the change.
    fn clear_buffer(&mut self, old: &Snapshot<T>) -> (String, String, String) {
        if self.pod.buffer == T::ZERO {
            return (String::new(), String::new(), String::new());
        }
        let pod_buffer = format!(" [buffer {}]", self.pod.buffer);
        let old_node_buffer = format!(" [buffer {}]", old.node.buffer);
        self.node.buffer -= self.pod.buffer;
        self.pod.buffer = T::ZERO;
        let new_node_buffer = format!(" [buffer {}]", self.node.buffer);
        (pod_buffer, old_node_buffer, new_node_buffer)
    }

    /// Apply the last permit a previous scheduler granted this pod.
    ///
    /// A scheduler can die and restart without the agent noticing any
    /// disconnect; replaying the permit trims the buffered amounts so that
    /// reconnecting agents don't leave the node over-committed.
    pub fn handle_last_permit(&mut self, last_permit: T) -> String {
        let old = self.snapshot();

        if last_permit <= self.pod.reserved {
            self.node.reserved -= self.pod.reserved - last_permit;
            self.pod.reserved = last_permit;

            let (pod_buffer, old_node_buffer, new_node_buffer) = self.clear_buffer(&old);

            format!(
                "pod reserved {}{} -> {}, node reserved {}{} -> {}{} (of {})",
                old.pod.reserved,
                pod_buffer,
                self.pod.reserved,
                old.node.reserved,
                old_node_buffer,
                self.node.reserved,
                new_node_buffer,
                self.node.total_reservable(),
            )
        } else {
            // A permit can outlive the scheduler that issued it. If the VM's
            // bounds shrank in between, the replayed permit may exceed what
            // we now track; leave the books alone.
            format!(
                "unexpected last permit, no changes: last permit ({}) is greater than pod reserved ({})",
                last_permit, self.pod.reserved,
            )
        }
    }

    /// Handle the agent's desired new reservation.
    ///
    /// Any permitted increase is a multiple of `factor` (the node's compute
    /// unit for this resource). CPU and memory are quantised independently:
    /// the agent is expected to re-submit compute-unit-aligned values, so the
    /// pair converges even when only one side is capped.
    pub fn handle_requested(&mut self, requested: T, starting_migration: bool, factor: T) -> String {
        let old = self.snapshot();
        let remaining_reservable = self.node.remaining_reservable();

        if requested <= self.pod.reserved {
            // A decrease is a notification that it already happened
            self.node.reserved -= self.pod.reserved - requested;
            self.pod.reserved = requested;
            // the pod no longer wants more, so its pressure is gone
            self.pod.capacity_pressure = T::ZERO;
            self.node.capacity_pressure -= old.pod.capacity_pressure;

            // shared verdict below
        } else if starting_migration {
            // Increases are denied mid-migration, but the unmet demand still
            // counts toward node pressure; the migration will resolve it.
            assert!(
                self.pod.buffer == T::ZERO,
                "pod buffer must be zero when starting migration"
            );
            self.pod.capacity_pressure = requested - self.pod.reserved;
            self.node.capacity_pressure = self.node.capacity_pressure
                - old.pod.capacity_pressure
                + self.pod.capacity_pressure;

            return format!(
                "denying increase {} -> {} because the pod is starting migration; \
                 node capacityPressure {} -> {} ({} -> {} accounted for)",
                old.pod.reserved,
                requested,
                old.node.capacity_pressure,
                self.node.capacity_pressure,
                old.node.pressure_accounted_for,
                self.node.pressure_accounted_for,
            );
        } else {
            let increase = requested - self.pod.reserved;
            // Increases are bounded by what's left on the node, rounded down
            // to a multiple of the factor
            let max_increase = (remaining_reservable / factor) * factor;
            let applied = if increase > max_increase {
                self.pod.capacity_pressure = increase - max_increase;
                self.node.capacity_pressure = self.node.capacity_pressure
                    - old.pod.capacity_pressure
                    + self.pod.capacity_pressure;
                max_increase
            } else {
                // Not capped, so whatever pressure this pod caused is relieved
                self.node.capacity_pressure -= self.pod.capacity_pressure;
                self.pod.capacity_pressure = T::ZERO;
                increase
            };
            self.pod.reserved += applied;
            self.node.reserved += applied;

            // shared verdict below
        }

        let (pod_buffer, old_node_buffer, new_node_buffer) = self.clear_buffer(&old);

        let wanted = if self.pod.reserved != requested {
            format!(" (wanted {})", requested)
        } else {
            String::new()
        };

        format!(
            "register {}{} -> {}{} (pressure {} -> {}); \
             node reserved {}{} -> {}{} (of {}), \
             node capacityPressure {} -> {} ({} -> {} accounted for)",
            old.pod.reserved,
            pod_buffer,
            self.pod.reserved,
            wanted,
            old.pod.capacity_pressure,
            self.pod.capacity_pressure,
            old.node.reserved,
            old_node_buffer,
            self.node.reserved,
            new_node_buffer,
            self.node.total_reservable(),
            old.node.capacity_pressure,
            self.node.capacity_pressure,
            old.node.pressure_accounted_for,
            self.node.pressure_accounted_for,
        )
    }

    /// Remove the pod's amounts from the node
    pub fn handle_deleted(&mut self, currently_migrating: bool) -> String {
        let old = self.snapshot();

        self.node.reserved -= self.pod.reserved;
        self.node.capacity_pressure -= self.pod.capacity_pressure;

        if currently_migrating {
            // pressure denied to the pod after the migration started is not
            // part of what the start accounted for
            self.node.pressure_accounted_for = self
                .node
                .pressure_accounted_for
                .saturating_sub(self.pod.reserved + self.pod.capacity_pressure);
        }

        let mut pod_buffer = String::new();
        let mut old_node_buffer = String::new();
        let mut new_node_buffer = String::new();
        if self.pod.buffer != T::ZERO {
            self.node.buffer -= self.pod.buffer;
            pod_buffer = format!(" [buffer {}]", self.pod.buffer);
            old_node_buffer = format!(" [buffer {}]", old.node.buffer);
            new_node_buffer = format!(" [buffer {}]", self.node.buffer);
        }

        format!(
            "pod had {}{}; node reserved {}{} -> {}{}, \
             node capacityPressure {} -> {} ({} -> {} accounted for)",
            self.pod.reserved,
            pod_buffer,
            old.node.reserved,
            old_node_buffer,
            self.node.reserved,
            new_node_buffer,
            old.node.capacity_pressure,
            self.node.capacity_pressure,
            old.node.pressure_accounted_for,
            self.node.pressure_accounted_for,
        )
    }

    /// Record a usage change for a pod whose scaling the enforcer does not
    /// arbitrate (autoscaling disabled); the new usage is authoritative
    pub fn handle_non_autoscaling_usage_change(&mut self, new_usage: T) -> String {
        let old = self.snapshot();

        let prev = self.pod.reserved;
        self.pod.reserved = new_usage;
        if new_usage >= prev {
            self.node.reserved += new_usage - prev;
        } else {
            self.node.reserved -= prev - new_usage;
        }

        format!(
            "pod reserved {} -> {}, node reserved {} -> {}",
            old.pod.reserved, self.pod.reserved, old.node.reserved, self.node.reserved,
        )
    }

    fn drop_buffer_and_pressure(&mut self) {
        // buffer is included in reserved, so everything shrinks by it
        let buffer = self.pod.buffer;
        self.node.reserved -= buffer;
        self.node.buffer -= buffer;
        self.pod.reserved -= buffer;
        self.pod.buffer = T::ZERO;

        self.node.capacity_pressure -= self.pod.capacity_pressure;
        self.pod.capacity_pressure = T::ZERO;
    }

    /// Clear the pod's buffer and capacity pressure after its autoscaling
    /// was switched off
    pub fn handle_autoscaling_disabled(&mut self) -> String {
        let old = self.snapshot();

        self.drop_buffer_and_pressure();

        let node_buffer_change = if old.pod.buffer != T::ZERO {
            format!(" [buffer {} -> {}]", old.node.buffer, self.node.buffer)
        } else {
            String::new()
        };

        format!(
            "pod had buffer {}, capacityPressure {}; \
             node reserved {} -> {}{}, capacityPressure {} -> {}",
            old.pod.buffer,
            old.pod.capacity_pressure,
            old.node.reserved,
            self.node.reserved,
            node_buffer_change,
            old.node.capacity_pressure,
            self.node.capacity_pressure,
        )
    }

    /// Like [`Self::handle_autoscaling_disabled`], but for a pod that is
    /// about to migrate away. When the pod is the migration source, its
    /// reserved amount is added to the node's accounted-for pressure: the
    /// departure will relieve that much.
    pub fn handle_start_migration(&mut self, source: bool) -> String {
        let old = self.snapshot();

        self.drop_buffer_and_pressure();

        if source {
            self.node.pressure_accounted_for += self.pod.reserved;
        }

        format!(
            "pod had buffer {}, capacityPressure {}; \
             node reserved {} -> {}, capacityPressure {} -> {}, \
             pressureAccountedFor {} -> {}",
            old.pod.buffer,
            old.pod.capacity_pressure,
            old.node.reserved,
            self.node.reserved,
            old.node.capacity_pressure,
            self.node.capacity_pressure,
            old.node.pressure_accounted_for,
            self.node.pressure_accounted_for,
        )
    }

    /// Apply new scaling bounds.
    ///
    /// Before the agent has made contact, a change to the upper bound
    /// recomputes the buffer from scratch: a permit granted by a previous
    /// scheduler can survive in the agent's memory across the bounds
    /// shrinking and growing again, so the reservation must cover the new
    /// maximum without dropping below what the pod is still believed to use.
    pub fn handle_updated_limits(
        &mut self,
        received_contact: bool,
        new_min: T,
        new_max: T,
    ) -> String {
        if new_min == self.pod.min && new_max == self.pod.max {
            return format!("limits unchanged (min = {}, max = {})", new_min, new_max);
        }

        let mut buffer_verdict = String::new();
        if !received_contact && self.pod.max != new_max {
            let old = self.snapshot();

            let using = self.pod.reserved - self.pod.buffer;
            self.pod.reserved = cmp::max(new_max, using);
            self.pod.buffer = self.pod.reserved - using;

            if self.pod.reserved >= old.pod.reserved {
                self.node.reserved += self.pod.reserved - old.pod.reserved;
            } else {
                self.node.reserved -= old.pod.reserved - self.pod.reserved;
            }
            if self.pod.buffer >= old.pod.buffer {
                self.node.buffer += self.pod.buffer - old.pod.buffer;
            } else {
                self.node.buffer -= old.pod.buffer - self.pod.buffer;
            }

            buffer_verdict = format!(
                ". no contact yet: pod reserved {} -> {} (buffer {} -> {}), \
                 node reserved {} -> {} (buffer {} -> {})",
                old.pod.reserved,
                self.pod.reserved,
                old.pod.buffer,
                self.pod.buffer,
                old.node.reserved,
                self.node.reserved,
                old.node.buffer,
                self.node.buffer,
            );
        }

        let old_min = self.pod.min;
        let old_max = self.pod.max;
        self.pod.min = new_min;
        self.pod.max = new_max;

        format!(
            "updated min {} -> {}, max {} -> {}{}",
            old_min, new_min, old_max, new_max, buffer_verdict,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(total: u16, system: u16) -> NodeResourceState<u16> {
        NodeResourceState {
            total,
            system,
            ..Default::default()
        }
    }

    fn pod(reserved: u16, buffer: u16) -> PodResourceState<u16> {
        PodResourceState {
            reserved,
            buffer,
            ..Default::default()
        }
    }

    /// Add a pod's amounts to a node, as placement does
    fn admit(node: &mut NodeResourceState<u16>, pod: &PodResourceState<u16>) {
        node.reserved += pod.reserved;
        node.buffer += pod.buffer;
        node.capacity_pressure += pod.capacity_pressure;
    }

    #[test]
    fn test_last_permit_trims_buffer() {
        // A restarted scheduler learns the previous grant of 3 against a
        // buffered reservation of 5
        let mut n = node(8, 1);
        let mut p = pod(5, 2);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_last_permit(3);

        assert_eq!(p.reserved, 3);
        assert_eq!(p.buffer, 0);
        assert_eq!(n.reserved, 3);
        assert_eq!(n.buffer, 0);
    }

    #[test]
    fn test_last_permit_overshoot_is_ignored() {
        let mut n = node(8, 1);
        let mut p = pod(3, 0);
        admit(&mut n, &p);

        let verdict = ResourceTransitioner::new(&mut n, &mut p).handle_last_permit(5);

        assert!(verdict.contains("unexpected last permit"));
        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 3);
    }

    #[test]
    fn test_requested_grant_in_full() {
        let mut n = node(8, 1);
        let mut p = pod(3, 0);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(5, false, 1);

        assert_eq!(p.reserved, 5);
        assert_eq!(n.reserved, 5);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.capacity_pressure, 0);
    }

    #[test]
    fn test_requested_capped_increase() {
        // reservable 7, 6 already reserved across two pods; asking for 3
        // more only gets 1, the rest becomes pressure
        let mut n = node(8, 1);
        n.reserved = 6;
        let mut p = pod(3, 0);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(6, false, 1);

        assert_eq!(p.reserved, 4);
        assert_eq!(n.reserved, 7);
        assert_eq!(p.capacity_pressure, 2);
        assert_eq!(n.capacity_pressure, 2);
    }

    #[test]
    fn test_requested_factor_quantisation() {
        // with factor 4 the single remaining unit cannot be handed out
        let mut n = node(8, 1);
        n.reserved = 6;
        let mut p = pod(3, 0);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(6, false, 4);

        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 6);
        assert_eq!(p.capacity_pressure, 3);
        assert_eq!(n.capacity_pressure, 3);
    }

    #[test]
    fn test_requested_decrease_clears_pressure() {
        let mut n = node(8, 1);
        let mut p = pod(4, 0);
        p.capacity_pressure = 2;
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(2, false, 1);

        assert_eq!(p.reserved, 2);
        assert_eq!(n.reserved, 2);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.capacity_pressure, 0);
    }

    #[test]
    fn test_requested_same_value_only_clears_pressure() {
        let mut n = node(8, 1);
        let mut p = pod(4, 0);
        p.capacity_pressure = 1;
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(4, false, 1);

        assert_eq!(p.reserved, 4);
        assert_eq!(n.reserved, 4);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.capacity_pressure, 0);
    }

    #[test]
    fn test_requested_increase_denied_when_migrating() {
        let mut n = node(8, 1);
        let mut p = pod(3, 0);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(5, true, 1);

        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 3);
        assert_eq!(p.capacity_pressure, 2);
        assert_eq!(n.capacity_pressure, 2);
    }

    #[test]
    fn test_requested_clears_buffer() {
        let mut n = node(8, 1);
        let mut p = pod(5, 2);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_requested(5, false, 1);

        assert_eq!(p.reserved, 5);
        assert_eq!(p.buffer, 0);
        assert_eq!(n.buffer, 0);
    }

    #[test]
    fn test_deleted_restores_node() {
        let mut n = node(8, 1);
        let mut p = pod(5, 2);
        p.capacity_pressure = 1;
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_deleted(false);

        assert_eq!(n.reserved, 0);
        assert_eq!(n.buffer, 0);
        assert_eq!(n.capacity_pressure, 0);
    }

    #[test]
    fn test_deleted_while_migrating_releases_accounted_pressure() {
        let mut n = node(8, 1);
        let mut p = pod(3, 0);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_start_migration(true);
        assert_eq!(n.pressure_accounted_for, 3);

        ResourceTransitioner::new(&mut n, &mut p).handle_deleted(true);
        assert_eq!(n.reserved, 0);
        assert_eq!(n.pressure_accounted_for, 0);
    }

    #[test]
    fn test_non_autoscaling_usage_change() {
        let mut n = node(8, 1);
        let mut p = pod(3, 0);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_non_autoscaling_usage_change(5);
        assert_eq!(p.reserved, 5);
        assert_eq!(n.reserved, 5);

        ResourceTransitioner::new(&mut n, &mut p).handle_non_autoscaling_usage_change(2);
        assert_eq!(p.reserved, 2);
        assert_eq!(n.reserved, 2);
    }

    #[test]
    fn test_autoscaling_disabled_drops_buffer_and_pressure() {
        let mut n = node(8, 1);
        let mut p = pod(5, 2);
        p.capacity_pressure = 1;
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_autoscaling_disabled();

        assert_eq!(p.reserved, 3);
        assert_eq!(p.buffer, 0);
        assert_eq!(p.capacity_pressure, 0);
        assert_eq!(n.reserved, 3);
        assert_eq!(n.buffer, 0);
        assert_eq!(n.capacity_pressure, 0);
        assert_eq!(n.pressure_accounted_for, 0);
    }

    #[test]
    fn test_start_migration_accounts_for_pressure() {
        let mut n = node(8, 1);
        let mut p = pod(5, 2);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_start_migration(true);

        // buffer dropped first, then the remaining reservation is spoken for
        assert_eq!(p.reserved, 3);
        assert_eq!(n.reserved, 3);
        assert_eq!(n.pressure_accounted_for, 3);
    }

    #[test]
    fn test_start_migration_target_does_not_account() {
        let mut n = node(8, 1);
        let mut p = pod(3, 0);
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_start_migration(false);

        assert_eq!(n.pressure_accounted_for, 0);
    }

    #[test]
    fn test_updated_limits_unchanged_is_noop() {
        let mut n = node(8, 1);
        let mut p = pod(4, 0);
        p.min = 1;
        p.max = 4;
        admit(&mut n, &p);

        let verdict =
            ResourceTransitioner::new(&mut n, &mut p).handle_updated_limits(false, 1, 4);

        assert!(verdict.contains("unchanged"));
        assert_eq!(p.reserved, 4);
        assert_eq!(n.reserved, 4);
    }

    #[test]
    fn test_updated_limits_without_contact() {
        // Shrinking the max below current usage keeps the reservation at the
        // usage; growing it back re-buffers up to the new max.
        let mut n = node(16, 0);
        let mut p = pod(4, 0);
        p.min = 1;
        p.max = 4;
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_updated_limits(false, 1, 2);
        assert_eq!(p.reserved, 4);
        assert_eq!(p.buffer, 0);
        assert_eq!((p.min, p.max), (1, 2));
        assert_eq!(n.reserved, 4);
        assert_eq!(n.buffer, 0);

        ResourceTransitioner::new(&mut n, &mut p).handle_updated_limits(false, 1, 6);
        assert_eq!(p.reserved, 6);
        assert_eq!(p.buffer, 2);
        assert_eq!((p.min, p.max), (1, 6));
        assert_eq!(n.reserved, 6);
        assert_eq!(n.buffer, 2);
    }

    #[test]
    fn test_updated_limits_after_contact_only_records_bounds() {
        let mut n = node(16, 0);
        let mut p = pod(4, 0);
        p.min = 1;
        p.max = 4;
        admit(&mut n, &p);

        ResourceTransitioner::new(&mut n, &mut p).handle_updated_limits(true, 2, 8);

        assert_eq!((p.min, p.max), (2, 8));
        assert_eq!(p.reserved, 4);
        assert_eq!(p.buffer, 0);
        assert_eq!(n.reserved, 4);
    }
}
