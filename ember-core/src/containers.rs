//! Hot-path container aliases.
//!
//! Keyspace tables, the command registry and the blocked-client index all
//! sit on per-command paths, so the concrete hash container choice is kept
//! in one place instead of being scattered over the execution modules.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by keyspace and registry tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used by secondary indexes.
pub type HotSet<T> = HbSet<T>;
