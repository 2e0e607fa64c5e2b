use std::cmp::Ordering;

use serde::Serialize;
use stratus_core::vm::ScalingBounds;
use stratus_core::{Metrics, PodName, RawResources, Resources};

use crate::error::{EnforcerError, Result};
use crate::ledger::PodResourceState;

/// Information about a pod's ongoing migration. Its presence alone marks the
/// pod as migrating; there is at most one migration per pod.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PodMigrationState {}

/// Everything the enforcer tracks for a VM pod
#[derive(Debug, Clone)]
pub struct PodState {
    /// Namespace'd pod name; never changes after creation
    pub name: PodName,

    /// The VM's name, from the VM name label
    pub vm_name: String,

    /// Test-only flag: always pick this pod for migration when it is
    /// considered, whether or not the node needs the relief
    pub testing_only_always_migrate: bool,

    /// Name of the node this pod is reserved onto. A lookup handle into the
    /// plugin's node map, not an ownership claim.
    pub node: String,

    pub vcpu: PodResourceState<u16>,
    pub mem_slots: PodResourceState<u16>,

    /// The compute unit the agent most recently reported observing; `None`
    /// until the agent first makes contact
    pub most_recent_compute_unit: Option<Resources>,

    /// Most recent metrics for the pod; `None` until the agent first sends
    /// some
    pub metrics: Option<Metrics>,

    /// Position in the node's migration queue. `None` iff `metrics` is
    /// `None` or the pod is currently migrating.
    pub mq_index: Option<usize>,

    /// Present iff the pod is currently migrating
    pub migration: Option<PodMigrationState>,
}

impl PodState {
    pub fn currently_migrating(&self) -> bool {
        self.migration.is_some()
    }

    /// Whether the agent has ever spoken to this scheduler about this pod
    pub fn received_contact(&self) -> bool {
        self.most_recent_compute_unit.is_some()
    }

    /// Whether the pod may be enqueued for migration
    pub fn migration_candidate(&self) -> bool {
        self.metrics.is_some() && self.migration.is_none()
    }

    /// Queue ordering: the pod with the lower 1-minute load average migrates
    /// first, with ties broken by name so the order is deterministic
    pub(crate) fn outranks(&self, other: &PodState) -> bool {
        let ours = self.queue_load();
        let theirs = other.queue_load();
        match ours.total_cmp(&theirs) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.name < other.name,
        }
    }

    fn queue_load(&self) -> f32 {
        match &self.metrics {
            Some(m) => m.load_average_1min,
            None => panic!(
                "pod {} is ranked for migration without metrics",
                self.name
            ),
        }
    }

    /// Re-check, just before dispatching a migration, that the pod still
    /// looks like the right victim. A large swing in load since it was
    /// selected means something else should probably move instead.
    pub fn check_ok_to_migrate(&self, old_metrics: &Metrics, deviation_threshold: f32) -> Result<()> {
        let Some(current) = &self.metrics else {
            return Err(EnforcerError::migration_vetoed(
                self.name.to_string(),
                "no metrics on record",
            ));
        };

        let old_load = old_metrics.load_average_1min;
        let deviation = (current.load_average_1min - old_load).abs() / old_load.max(1.0);
        if deviation > deviation_threshold {
            return Err(EnforcerError::migration_vetoed(
                self.name.to_string(),
                format!(
                    "1-minute load average moved {:.2} -> {:.2} since selection (deviation {:.2} > {:.2})",
                    old_load, current.load_average_1min, deviation, deviation_threshold,
                ),
            ));
        }
        Ok(())
    }
}

/// Build a pod's initial per-resource ledger from its scaling bounds,
/// optionally trimmed by a permit replayed from a previous scheduler.
///
/// Until the agent makes contact, the reservation covers the upper bound
/// (the agent may still believe it can use that much) without dropping below
/// current usage; the excess is buffer. A replayed permit at or below the
/// reservation supersedes the buffer.
pub fn initial_resource_state(bounds: &ScalingBounds, last_permit: Option<u16>) -> PodResourceState<u16> {
    let using = bounds.using;
    let mut reserved = std::cmp::max(bounds.max, using);
    let mut buffer = reserved - using;

    if let Some(permit) = last_permit {
        if permit <= reserved {
            reserved = permit;
            buffer = 0;
        }
        // a permit above the reservation is the same unexpected case as in
        // the last-permit transition: leave the bounds-derived values alone
    }

    PodResourceState {
        reserved,
        buffer,
        capacity_pressure: 0,
        min: bounds.min,
        max: bounds.max,
    }
}

/// The little we track for a non-VM pod
#[derive(Debug, Clone)]
pub struct OtherPodState {
    pub name: PodName,
    /// Name of the owning node, as for [`PodState::node`]
    pub node: String,
    pub resources: RawResources,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pod(name: &str, load: f32) -> PodState {
        PodState {
            name: PodName::new("default", name),
            vm_name: name.to_string(),
            testing_only_always_migrate: false,
            node: "node-1".to_string(),
            vcpu: Default::default(),
            mem_slots: Default::default(),
            most_recent_compute_unit: None,
            metrics: Some(Metrics {
                load_average_1min: load,
                load_average_5min: load,
                memory_usage_bytes: 0.0,
            }),
            mq_index: None,
            migration: None,
        }
    }

    #[test]
    fn test_outranks_by_load() {
        let idle = test_pod("idle", 0.1);
        let busy = test_pod("busy", 2.0);
        assert!(idle.outranks(&busy));
        assert!(!busy.outranks(&idle));
    }

    #[test]
    fn test_outranks_ties_broken_by_name() {
        let a = test_pod("aaa", 1.0);
        let b = test_pod("bbb", 1.0);
        assert!(a.outranks(&b));
        assert!(!b.outranks(&a));
    }

    #[test]
    fn test_migration_candidate() {
        let mut pod = test_pod("vm", 1.0);
        assert!(pod.migration_candidate());

        pod.migration = Some(PodMigrationState {});
        assert!(!pod.migration_candidate());

        pod.migration = None;
        pod.metrics = None;
        assert!(!pod.migration_candidate());
    }

    #[test]
    fn test_check_ok_to_migrate() {
        let pod = test_pod("vm", 1.0);
        let selected_at = Metrics {
            load_average_1min: 1.1,
            load_average_5min: 1.0,
            memory_usage_bytes: 0.0,
        };
        assert!(pod.check_ok_to_migrate(&selected_at, 0.25).is_ok());

        let stale = Metrics {
            load_average_1min: 4.0,
            load_average_5min: 4.0,
            memory_usage_bytes: 0.0,
        };
        assert!(pod.check_ok_to_migrate(&stale, 0.25).is_err());
    }

    #[test]
    fn test_initial_resource_state() {
        let bounds = ScalingBounds {
            min: 1,
            max: 5,
            using: 3,
        };
        let state = initial_resource_state(&bounds, None);
        assert_eq!(state.reserved, 5);
        assert_eq!(state.buffer, 2);
        assert_eq!((state.min, state.max), (1, 5));

        // permit replay supersedes the buffer
        let state = initial_resource_state(&bounds, Some(3));
        assert_eq!(state.reserved, 3);
        assert_eq!(state.buffer, 0);

        // an overshooting permit is ignored
        let state = initial_resource_state(&bounds, Some(7));
        assert_eq!(state.reserved, 5);
        assert_eq!(state.buffer, 2);
    }
}
