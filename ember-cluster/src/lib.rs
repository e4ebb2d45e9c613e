//! Hash-slot routing for the execution core.
//!
//! The admission pipeline hands this crate the key arguments of each
//! command; slot hashing and the ownership table decide whether the
//! command runs locally or the client is redirected.

pub mod slot;

pub use slot::{key_slot, ClusterTopology, MigrationSocketCache, SlotRange};
