//! Stratus Enforcer - the resource-reservation and migration-pressure core
//! of the Stratus scheduler plugin
//!
//! This crate provides:
//! - Per-node and per-pod resource ledgers over 16-bit units
//! - The resource transitioner applied on every ledger mutation
//! - Node pressure accounting and the per-node migration queue
//! - The plugin state with on-demand node hydration from the orchestrator
//! - The event dispatch entry points, serialised by a single coarse lock

pub mod api;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod node;
pub mod plugin;
pub mod pod;
pub mod queue;
pub mod transition;

// Re-export commonly used types
pub use api::{HttpNodeApi, NodeApi, StaticNodeApi};
pub use dispatch::{AgentRequestOutcome, AutoscaleEnforcer};
pub use error::{EnforcerError, Result};
pub use plugin::{NodeDump, OtherPodDump, PodDump, StateDump};
pub use transition::{ResourceTransitioner, VerdictSet};
