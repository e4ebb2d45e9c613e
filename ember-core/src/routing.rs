//! Slot-ownership contract consumed by the cluster admission gate.
//!
//! The execution core never inspects cluster topology itself; it hands the
//! key arguments to a [`SlotOwnership`] implementation and acts on the
//! returned decision. The real implementation lives in `ember-cluster`.

use ember_common::ids::SlotId;

/// Routing verdict for one command's key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Every key is served by this node.
    Local,
    /// The slot is owned by another node; the client must be redirected.
    Moved {
        /// Hash slot of the keys.
        slot: SlotId,
        /// Address of the owning node.
        target: String,
    },
    /// The slot is migrating away and the key is already gone; the client
    /// should ask the importing node.
    Ask {
        /// Hash slot of the keys.
        slot: SlotId,
        /// Address of the importing node.
        target: String,
    },
    /// The keys hash to more than one slot.
    CrossSlot,
}

/// Topology view the admission pipeline consults per command.
pub trait SlotOwnership {
    /// Whether cluster routing is active at all.
    fn enabled(&self) -> bool;

    /// Routes one command's key set.
    fn route(&self, keys: &[&[u8]]) -> RouteDecision;
}

/// Routing used while clustering is disabled: everything is local.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnlyRouting;

impl SlotOwnership for LocalOnlyRouting {
    fn enabled(&self) -> bool {
        false
    }

    fn route(&self, _keys: &[&[u8]]) -> RouteDecision {
        RouteDecision::Local
    }
}
