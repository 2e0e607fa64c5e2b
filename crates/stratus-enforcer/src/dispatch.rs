//! Event dispatch: the callable entry points of the enforcer.
//!
//! Every entry point takes the plugin lock for its whole duration. The one
//! exception is node hydration, which releases the lock while it waits on
//! the orchestrator API and reacquires it before returning, on every path.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use stratus_core::{
    AgentRequest, AgentResponse, Bounds, EnforcerConfig, Metrics, PodName, RawResources,
    Resources, VmPodInfo,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::api::NodeApi;
use crate::error::{EnforcerError, Result};
use crate::plugin::{PluginState, StateDump};
use crate::pod::{initial_resource_state, OtherPodState, PodMigrationState, PodState};
use crate::transition::{ResourceTransitioner, VerdictSet};

/// The outcome of an agent request: the wire response, plus the pod selected
/// for migration (if any) so the caller can submit the migration request
/// once the lock is released
#[derive(Debug)]
pub struct AgentRequestOutcome {
    pub response: AgentResponse,
    pub migrate: Option<PodName>,
}

/// The autoscale enforcer: a single coarse lock around the plugin state,
/// plus on-demand node hydration from the orchestrator API
pub struct AutoscaleEnforcer {
    state: Mutex<PluginState>,
    node_api: Arc<dyn NodeApi>,
}

impl AutoscaleEnforcer {
    pub fn new(conf: EnforcerConfig, node_api: Arc<dyn NodeApi>) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(PluginState::new(conf)?),
            node_api,
        })
    }

    /// Ensure a node entry exists, fetching from the orchestrator API if
    /// needed.
    ///
    /// This is the only suspension point in the enforcer: the lock is
    /// released for the duration of the fetch and reacquired before
    /// returning, on every path. Callers must treat everything they observed
    /// before the call as potentially stale.
    async fn get_or_fetch_node_state<'a>(
        &'a self,
        guard: MutexGuard<'a, PluginState>,
        node_name: &str,
    ) -> (MutexGuard<'a, PluginState>, Result<()>) {
        if guard.nodes.contains_key(node_name) {
            return (guard, Ok(()));
        }

        info!(node = node_name, "no local information for node, fetching from API server");
        drop(guard);
        let fetched = self.node_api.get_node(node_name).await;
        let mut guard = self.state.lock().await;

        let node = match fetched {
            Ok(node) => node,
            Err(e) => return (guard, Err(e)),
        };

        // Another caller may have hydrated the node while the lock was
        // released; don't process it twice.
        if guard.nodes.contains_key(node_name) {
            info!(
                node = node_name,
                "node information became available during API call, using it",
            );
            return (guard, Ok(()));
        }

        let state = match guard.node_state_from_api(node_name, &node) {
            Ok(state) => state,
            Err(e) => return (guard, Err(e)),
        };
        guard.register_node(state);
        (guard, Ok(()))
    }

    /// Reserve resources for a VM pod placed on a node.
    ///
    /// The pod's initial ledger comes from its scaling-bounds annotation; a
    /// last-permit annotation written by the agent supersedes the buffered
    /// amounts, so a restarted scheduler does not double-count them. The pod
    /// is denied when the node cannot fit its reservation.
    pub async fn reserve_vm_pod(&self, pod: &Pod, node_name: &str) -> Result<()> {
        let pod_name = PodName::from_pod(pod)?;
        let info = VmPodInfo::from_pod(pod)?.ok_or_else(|| {
            EnforcerError::invalid_vm_pod(pod_name.to_string(), "missing the VM name label")
        })?;
        info!(pod = %pod_name, node = node_name, vm = %info.vm_name, "handling reservation for VM pod");

        let guard = self.state.lock().await;
        let (mut guard, hydrated) = self.get_or_fetch_node_state(guard, node_name).await;
        hydrated?;
        let state = &mut *guard;

        if state.pods.contains_key(&pod_name) {
            warn!(pod = %pod_name, "reserve VM pod: pod already tracked, ignoring");
            return Ok(());
        }

        let vcpu = initial_resource_state(&info.bounds.cpu, info.last_permit.map(|p| p.vcpu));
        let mem_slots = initial_resource_state(&info.bounds.mem, info.last_permit.map(|p| p.mem));

        let node = state
            .nodes
            .get_mut(node_name)
            .unwrap_or_else(|| panic!("node {} vanished while the lock was held", node_name));

        if vcpu.reserved > node.vcpu.remaining_reservable() {
            return Err(EnforcerError::Unschedulable {
                pod: pod_name.to_string(),
                node: node_name.to_string(),
                resource: "cpu".to_string(),
                requested: vcpu.reserved,
                remaining: node.vcpu.remaining_reservable(),
            });
        }
        if mem_slots.reserved > node.mem_slots.remaining_reservable() {
            return Err(EnforcerError::Unschedulable {
                pod: pod_name.to_string(),
                node: node_name.to_string(),
                resource: "memory".to_string(),
                requested: mem_slots.reserved,
                remaining: node.mem_slots.remaining_reservable(),
            });
        }

        node.vcpu.reserved += vcpu.reserved;
        node.vcpu.buffer += vcpu.buffer;
        node.mem_slots.reserved += mem_slots.reserved;
        node.mem_slots.buffer += mem_slots.buffer;
        node.pods.insert(pod_name.clone());

        info!(
            pod = %pod_name,
            node = node_name,
            cpu_reserved = vcpu.reserved,
            cpu_buffer = vcpu.buffer,
            mem_reserved = mem_slots.reserved,
            mem_buffer = mem_slots.buffer,
            node_cpu_reserved = node.vcpu.reserved,
            node_mem_reserved = node.mem_slots.reserved,
            replayed_permit = info.last_permit.is_some(),
            "reserved VM pod",
        );

        state.pods.insert(
            pod_name.clone(),
            PodState {
                name: pod_name,
                vm_name: info.vm_name,
                testing_only_always_migrate: info.testing_only_always_migrate,
                node: node_name.to_string(),
                vcpu,
                mem_slots,
                most_recent_compute_unit: None,
                metrics: None,
                mq_index: None,
                migration: None,
            },
        );
        Ok(())
    }

    /// Release a VM pod's reservation after its deletion.
    ///
    /// A pod we aren't tracking is a warning, not a failure: deletion events
    /// can arrive for pods scheduled before this scheduler started.
    pub async fn handle_vm_deletion(&self, pod_name: &PodName) {
        info!(pod = %pod_name, "handling deletion of VM pod");

        let mut guard = self.state.lock().await;
        let PluginState { nodes, pods, .. } = &mut *guard;

        let Some(pod) = pods.get(pod_name) else {
            warn!(pod = %pod_name, "delete VM pod: not present in the pod map");
            return;
        };
        let node_name = pod.node.clone();
        let node = nodes
            .get_mut(&node_name)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, node_name));

        // The queue must be updated while the pod is still in the map, so
        // the index bookkeeping stays consistent.
        node.mq.remove_if_present(pod_name, pods);
        let Some(mut pod) = pods.remove(pod_name) else {
            unreachable!("pod was present moments ago under the same lock");
        };
        node.pods.remove(pod_name);

        let currently_migrating = pod.currently_migrating();
        let verdict = VerdictSet {
            cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu)
                .handle_deleted(currently_migrating),
            mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                .handle_deleted(currently_migrating),
        };

        info!(
            pod = %pod_name,
            node = %node_name,
            migrating = currently_migrating,
            cpu = %verdict.cpu,
            mem = %verdict.mem,
            "deleted VM pod",
        );
    }

    /// Track a non-VM pod placed on a node. Its container limits are summed
    /// into the node's raw sub-ledger and the rounded-up equivalents join
    /// the node's reserved amounts.
    pub async fn reserve_other_pod(&self, pod: &Pod, node_name: &str) -> Result<()> {
        let pod_name = PodName::from_pod(pod)?;
        let resources = RawResources::from_pod(pod)
            .map_err(|e| EnforcerError::invalid_pod_spec(pod_name.to_string(), e.to_string()))?;
        info!(pod = %pod_name, node = node_name, "handling reservation for non-VM pod");

        let guard = self.state.lock().await;
        let (mut guard, hydrated) = self.get_or_fetch_node_state(guard, node_name).await;
        hydrated?;
        let state = &mut *guard;

        if state.other_pods.contains_key(&pod_name) {
            warn!(pod = %pod_name, "reserve non-VM pod: pod already tracked, ignoring");
            return Ok(());
        }

        let mem_slot_bytes = state.mem_slot_bytes;
        let node = state
            .nodes
            .get_mut(node_name)
            .unwrap_or_else(|| panic!("node {} vanished while the lock was held", node_name));

        let old = node.other_resources;
        let new = old.add_pod(mem_slot_bytes, &resources);
        let cpu_increase = new.reserved_cpu - old.reserved_cpu;
        let mem_increase = new.reserved_mem_slots - old.reserved_mem_slots;

        if cpu_increase > node.vcpu.remaining_reservable() {
            return Err(EnforcerError::Unschedulable {
                pod: pod_name.to_string(),
                node: node_name.to_string(),
                resource: "cpu".to_string(),
                requested: cpu_increase,
                remaining: node.vcpu.remaining_reservable(),
            });
        }
        if mem_increase > node.mem_slots.remaining_reservable() {
            return Err(EnforcerError::Unschedulable {
                pod: pod_name.to_string(),
                node: node_name.to_string(),
                resource: "memory".to_string(),
                requested: mem_increase,
                remaining: node.mem_slots.remaining_reservable(),
            });
        }

        node.other_resources = new;
        node.vcpu.reserved += cpu_increase;
        node.mem_slots.reserved += mem_increase;
        node.other_pods.insert(pod_name.clone());

        let cpu_verdict = format!("reserved {} -> {}", old.reserved_cpu, new.reserved_cpu);
        let mem_verdict = format!(
            "reserved {} -> {} slots",
            old.reserved_mem_slots, new.reserved_mem_slots
        );
        info!(
            pod = %pod_name,
            node = node_name,
            cpu_millis = resources.cpu_millis,
            memory_bytes = resources.memory_bytes,
            cpu = %cpu_verdict,
            mem = %mem_verdict,
            "reserved non-VM pod",
        );

        state.other_pods.insert(
            pod_name.clone(),
            OtherPodState {
                name: pod_name,
                node: node_name.to_string(),
                resources,
            },
        );
        Ok(())
    }

    /// Release a non-VM pod's tracked resources after its deletion
    pub async fn handle_other_pod_deletion(&self, pod_name: &PodName) {
        info!(pod = %pod_name, "handling deletion of non-VM pod");

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(other) = state.other_pods.remove(pod_name) else {
            warn!(pod = %pod_name, "delete non-VM pod: not present in the pod map");
            return;
        };
        let node = state
            .nodes
            .get_mut(&other.node)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, other.node));

        let old = node.other_resources;
        let new = old.sub_pod(state.mem_slot_bytes, &other.resources);
        let cpu_decrease = old.reserved_cpu - new.reserved_cpu;
        let mem_decrease = old.reserved_mem_slots - new.reserved_mem_slots;

        node.other_resources = new;
        node.vcpu.reserved -= cpu_decrease;
        node.mem_slots.reserved -= mem_decrease;
        node.other_pods.remove(pod_name);

        let cpu_verdict = format!("reserved {} -> {}", old.reserved_cpu, new.reserved_cpu);
        let mem_verdict = format!(
            "reserved {} -> {} slots",
            old.reserved_mem_slots, new.reserved_mem_slots
        );
        info!(
            pod = %pod_name,
            node = %other.node,
            cpu = %cpu_verdict,
            mem = %mem_verdict,
            node_cpu_reserved = node.vcpu.reserved,
            node_mem_reserved = node.mem_slots.reserved,
            "deleted non-VM pod",
        );
    }

    /// Handle a resource request from a pod's autoscaling agent.
    ///
    /// CPU and memory are transitioned independently. When the request tips
    /// the node's pressure over what ongoing migrations account for and this
    /// pod is the queue's best victim, its migration is started first, so
    /// the request is handled as a denied-increase; the caller submits the
    /// actual migration request after the lock is released.
    pub async fn handle_agent_request(&self, req: AgentRequest) -> Result<AgentRequestOutcome> {
        let pod_name = req.pod.clone();
        info!(pod = %pod_name, requested = %req.resources, "handling agent request");

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(pod) = state.pods.get(&pod_name) else {
            return Err(EnforcerError::pod_not_found(&pod_name));
        };
        if req.resources.vcpu > pod.vcpu.max {
            return Err(EnforcerError::RequestOutOfBounds {
                pod: pod_name.to_string(),
                resource: "cpu".to_string(),
                requested: req.resources.vcpu,
                max: pod.vcpu.max,
            });
        }
        if req.resources.mem > pod.mem_slots.max {
            return Err(EnforcerError::RequestOutOfBounds {
                pod: pod_name.to_string(),
                resource: "memory".to_string(),
                requested: req.resources.mem,
                max: pod.mem_slots.max,
            });
        }
        if req.resources.vcpu < pod.vcpu.min || req.resources.mem < pod.mem_slots.min {
            // below-minimum is not rejected: the agent is the authority on
            // what the VM is already using
            warn!(pod = %pod_name, requested = %req.resources, "agent request below the scaling minimum");
        }
        let node_name = pod.node.clone();

        let PluginState { nodes, pods, .. } = state;
        let node = nodes
            .get_mut(&node_name)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, node_name));

        if let Some(last_permit) = req.last_permit {
            let pod = tracked_pod(pods, &pod_name);
            let verdict = VerdictSet {
                cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu)
                    .handle_last_permit(last_permit.vcpu),
                mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                    .handle_last_permit(last_permit.mem),
            };
            info!(pod = %pod_name, cpu = %verdict.cpu, mem = %verdict.mem, "handled last permit");
        }

        let (was_migrating, always_migrate) = {
            let pod = tracked_pod(pods, &pod_name);
            pod.metrics = Some(req.metrics);
            (pod.currently_migrating(), pod.testing_only_always_migrate)
        };
        if !was_migrating {
            node.mq.insert_or_update(&pod_name, pods);
        }
        let must_migrate = !was_migrating
            && (always_migrate
                || (node.too_much_pressure() && node.mq.peek_best() == Some(&pod_name)));

        if must_migrate {
            node.mq.remove_if_present(&pod_name, pods);
            let pod = tracked_pod(pods, &pod_name);
            pod.migration = Some(PodMigrationState::default());
            let verdict = VerdictSet {
                cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu)
                    .handle_start_migration(true),
                mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                    .handle_start_migration(true),
            };
            info!(
                pod = %pod_name,
                node = %node_name,
                cpu = %verdict.cpu,
                mem = %verdict.mem,
                "starting migration before handling the pod's request",
            );
        }

        // An increase cannot be granted while the pod is migrating, whether
        // the migration started just now or earlier.
        let starting_migration = was_migrating || must_migrate;

        let compute_unit = node.compute_unit;
        let pod = tracked_pod(pods, &pod_name);
        let verdict = VerdictSet {
            cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu).handle_requested(
                req.resources.vcpu,
                starting_migration,
                compute_unit.vcpu,
            ),
            mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                .handle_requested(req.resources.mem, starting_migration, compute_unit.mem),
        };
        pod.most_recent_compute_unit = Some(req.compute_unit);

        let permit = Resources {
            vcpu: pod.vcpu.reserved,
            mem: pod.mem_slots.reserved,
        };
        info!(
            pod = %pod_name,
            node = %node_name,
            cpu = %verdict.cpu,
            mem = %verdict.mem,
            permit = %permit,
            "handled agent request",
        );

        Ok(AgentRequestOutcome {
            response: AgentResponse {
                permit,
                migrate: must_migrate,
                compute_unit,
            },
            migrate: must_migrate.then_some(pod_name),
        })
    }

    /// Mark a pod as migrating and update the ledgers accordingly.
    ///
    /// `expected_metrics` are the metrics the caller saw when it selected
    /// the pod; if the pod's load has swung too far since, the migration is
    /// vetoed so a better victim can be chosen. The actual migration request
    /// is submitted by the caller after this returns; a failed submission
    /// leaves the ledgers consistent, with the pod still marked migrating.
    pub async fn start_migration(
        &self,
        pod_name: &PodName,
        expected_metrics: Option<&Metrics>,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let deviation_threshold = state.conf.migration_deviation_threshold;

        let PluginState { nodes, pods, .. } = state;
        let Some(pod) = pods.get(pod_name) else {
            return Err(EnforcerError::pod_not_found(pod_name));
        };
        if pod.currently_migrating() {
            return Err(EnforcerError::already_migrating(pod_name));
        }
        if let Some(old_metrics) = expected_metrics {
            pod.check_ok_to_migrate(old_metrics, deviation_threshold)?;
        }
        let node_name = pod.node.clone();
        let node = nodes
            .get_mut(&node_name)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, node_name));

        node.mq.remove_if_present(pod_name, pods);
        let pod = tracked_pod(pods, pod_name);
        pod.migration = Some(PodMigrationState::default());

        let verdict = VerdictSet {
            cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu)
                .handle_start_migration(true),
            mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                .handle_start_migration(true),
        };
        info!(
            pod = %pod_name,
            node = %node_name,
            cpu = %verdict.cpu,
            mem = %verdict.mem,
            "marked pod as migrating",
        );
        Ok(())
    }

    /// Apply new scaling bounds for a VM, as observed from the orchestrator
    pub async fn handle_vm_limits_updated(&self, pod_name: &PodName, cpu: Bounds, mem: Bounds) {
        let mut guard = self.state.lock().await;
        let PluginState { nodes, pods, .. } = &mut *guard;

        let Some(pod) = pods.get_mut(pod_name) else {
            warn!(pod = %pod_name, "update limits: pod not present in the pod map");
            return;
        };
        let received_contact = pod.received_contact();
        let node = nodes
            .get_mut(&pod.node)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, pod.node));

        let verdict = VerdictSet {
            cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu).handle_updated_limits(
                received_contact,
                cpu.min,
                cpu.max,
            ),
            mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                .handle_updated_limits(received_contact, mem.min, mem.max),
        };
        info!(
            pod = %pod_name,
            received_contact,
            cpu = %verdict.cpu,
            mem = %verdict.mem,
            "updated VM limits",
        );
    }

    /// Clear a pod's buffer and pressure after its autoscaling was disabled
    pub async fn handle_autoscaling_disabled(&self, pod_name: &PodName) {
        let mut guard = self.state.lock().await;
        let PluginState { nodes, pods, .. } = &mut *guard;

        let Some(pod) = pods.get_mut(pod_name) else {
            warn!(pod = %pod_name, "autoscaling disabled: pod not present in the pod map");
            return;
        };
        let node = nodes
            .get_mut(&pod.node)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, pod.node));

        let verdict = VerdictSet {
            cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu)
                .handle_autoscaling_disabled(),
            mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                .handle_autoscaling_disabled(),
        };
        info!(pod = %pod_name, cpu = %verdict.cpu, mem = %verdict.mem, "autoscaling disabled for pod");
    }

    /// Record a usage change for a pod whose scaling the enforcer does not
    /// arbitrate
    pub async fn handle_non_autoscaling_usage_change(&self, pod_name: &PodName, usage: Resources) {
        let mut guard = self.state.lock().await;
        let PluginState { nodes, pods, .. } = &mut *guard;

        let Some(pod) = pods.get_mut(pod_name) else {
            warn!(pod = %pod_name, "usage change: pod not present in the pod map");
            return;
        };
        let node = nodes
            .get_mut(&pod.node)
            .unwrap_or_else(|| panic!("pod {} references unknown node {}", pod_name, pod.node));

        let verdict = VerdictSet {
            cpu: ResourceTransitioner::new(&mut node.vcpu, &mut pod.vcpu)
                .handle_non_autoscaling_usage_change(usage.vcpu),
            mem: ResourceTransitioner::new(&mut node.mem_slots, &mut pod.mem_slots)
                .handle_non_autoscaling_usage_change(usage.mem),
        };
        info!(pod = %pod_name, cpu = %verdict.cpu, mem = %verdict.mem, "recorded non-autoscaling usage change");
    }

    /// Apply a new configuration document to every node
    pub async fn handle_updated_conf(&self, new_conf: EnforcerConfig) -> Result<()> {
        info!("handling updated configuration");
        let mut guard = self.state.lock().await;
        guard.handle_updated_conf(new_conf)
    }

    /// Snapshot the entire plugin state, for the debug endpoint and tests
    pub async fn dump_state(&self) -> StateDump {
        self.state.lock().await.dump()
    }
}

fn tracked_pod<'p>(
    pods: &'p mut HashMap<PodName, PodState>,
    name: &PodName,
) -> &'p mut PodState {
    pods.get_mut(name)
        .unwrap_or_else(|| panic!("pod {} vanished while the lock was held", name))
}
