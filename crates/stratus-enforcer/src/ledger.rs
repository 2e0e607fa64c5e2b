//! Per-resource ledger slots for nodes and pods.
//!
//! CPU (whole cores) and memory (slots) share the same bookkeeping, so the
//! slots are generic over an unsigned unit and instantiated twice per node
//! and per pod.

use serde::Serialize;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

/// An unsigned integer usable as a ledger unit
pub trait ResourceUnit:
    Copy
    + Eq
    + Ord
    + fmt::Debug
    + fmt::Display
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + AddAssign
    + SubAssign
{
    const ZERO: Self;

    fn saturating_sub(self, rhs: Self) -> Self;
}

impl ResourceUnit for u16 {
    const ZERO: Self = 0;

    fn saturating_sub(self, rhs: Self) -> Self {
        u16::saturating_sub(self, rhs)
    }
}

/// The state of one resource on a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeResourceState<T> {
    /// Physical amount on the node; does not change after hydration
    pub total: T,
    /// Amount pre-reserved for system overhead; never handed to pods, but
    /// may change on config updates
    pub system: T,
    /// Soft cap on `reserved`, above which migration is considered
    pub watermark: T,
    /// Amount currently reserved to pods. Always equal to the sum of this
    /// node's pods' reserved amounts, and at most `total`. Keeping it at or
    /// below `total - system` is preferred but may transiently fail after a
    /// config update.
    pub reserved: T,
    /// Sum of the node's pods' buffers (buffer is included in `reserved`)
    pub buffer: T,
    /// Amount currently being denied to pods that asked for more; equal to
    /// the sum of the pods' capacity pressure
    pub capacity_pressure: T,
    /// Pressure expected to be relieved by migrations already underway
    pub pressure_accounted_for: T,
}

impl<T: ResourceUnit> NodeResourceState<T> {
    /// The amount that may be reserved to pods at all
    pub fn total_reservable(&self) -> T {
        self.total - self.system
    }

    /// The amount still available for new reservations
    pub fn remaining_reservable(&self) -> T {
        // reserved can exceed the reservable amount after a config update
        self.total_reservable().saturating_sub(self.reserved)
    }
}

/// The state of one resource on a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PodResourceState<T> {
    /// Amount reserved to the pod; the pod uses at most this much
    pub reserved: T,
    /// Portion of `reserved` held defensively because the agent has not yet
    /// confirmed it needs less; reclaimed on contact
    pub buffer: T,
    /// This pod's contribution to its node's capacity pressure
    pub capacity_pressure: T,
    /// Lower scaling bound
    pub min: T,
    /// Upper scaling bound
    pub max: T,
}
