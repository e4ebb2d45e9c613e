//! Slot hashing, ownership routing and migration-socket caching.

use ember_common::ids::{SlotId, UnixMillis, MAX_SLOT_ID};
use ember_core::containers::HotMap;
use ember_core::routing::{RouteDecision, SlotOwnership};

/// CRC16/XMODEM over the key bytes, the cluster's slot hash.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Maps a key to its hash slot, honouring `{hash tag}` sections so related
/// keys can be pinned to one slot.
#[must_use]
pub fn key_slot(key: &[u8]) -> SlotId {
    let hashed = match hash_tag(key) {
        Some(tag) => tag,
        None => key,
    };
    crc16(hashed) & MAX_SLOT_ID
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|byte| *byte == b'{')?;
    let close_offset = key[open + 1..].iter().position(|byte| *byte == b'}')?;
    if close_offset == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close_offset])
}

/// Closed slot range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// Range start.
    pub start: SlotId,
    /// Range end.
    pub end: SlotId,
}

impl SlotRange {
    /// Whether a slot falls inside this range.
    #[must_use]
    pub fn contains(self, slot: SlotId) -> bool {
        self.start <= slot && slot <= self.end
    }
}

/// This node's view of slot ownership.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    enabled: bool,
    owned: Vec<SlotRange>,
    remote_owners: Vec<(SlotRange, String)>,
    migrating: HotMap<SlotId, String>,
}

impl ClusterTopology {
    /// A topology with routing disabled; everything resolves locally.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A topology owning the given ranges, with routing enabled.
    #[must_use]
    pub fn with_owned_ranges(owned: Vec<SlotRange>) -> Self {
        Self {
            enabled: true,
            owned,
            remote_owners: Vec::new(),
            migrating: HotMap::new(),
        }
    }

    /// Registers another node as owner of a slot range.
    pub fn set_remote_owner(&mut self, range: SlotRange, address: impl Into<String>) {
        self.remote_owners.push((range, address.into()));
    }

    /// Marks one owned slot as migrating towards another node.
    pub fn set_migrating(&mut self, slot: SlotId, target: impl Into<String>) {
        let _ = self.migrating.insert(slot, target.into());
    }

    /// Whether this node owns the slot.
    #[must_use]
    pub fn owns_slot(&self, slot: SlotId) -> bool {
        self.owned.iter().any(|range| range.contains(slot))
    }

    fn remote_owner(&self, slot: SlotId) -> Option<&str> {
        self.remote_owners
            .iter()
            .find(|(range, _)| range.contains(slot))
            .map(|(_, address)| address.as_str())
    }
}

impl SlotOwnership for ClusterTopology {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn route(&self, keys: &[&[u8]]) -> RouteDecision {
        let Some(first) = keys.first() else {
            return RouteDecision::Local;
        };
        let slot = key_slot(first);
        if keys.iter().any(|key| key_slot(key) != slot) {
            return RouteDecision::CrossSlot;
        }

        if self.owns_slot(slot) {
            if let Some(target) = self.migrating.get(&slot) {
                return RouteDecision::Ask {
                    slot,
                    target: target.clone(),
                };
            }
            return RouteDecision::Local;
        }

        RouteDecision::Moved {
            slot,
            target: self.remote_owner(slot).unwrap_or("?").to_owned(),
        }
    }
}

/// Cached outbound sockets used by key migration, swept by the cron once
/// idle past their keep-alive window.
#[derive(Debug, Clone)]
pub struct MigrationSocketCache {
    last_used: HotMap<String, UnixMillis>,
    keepalive_ms: u64,
}

impl MigrationSocketCache {
    /// Creates a cache with the given idle keep-alive window.
    #[must_use]
    pub fn new(keepalive_ms: u64) -> Self {
        Self {
            last_used: HotMap::new(),
            keepalive_ms,
        }
    }

    /// Records a use of the socket towards `address`.
    pub fn touch(&mut self, address: impl Into<String>, now: UnixMillis) {
        let _ = self.last_used.insert(address.into(), now);
    }

    /// Number of cached sockets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last_used.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_used.is_empty()
    }

    /// Drops sockets idle past the keep-alive window. Returns how many
    /// were closed.
    pub fn sweep(&mut self, now: UnixMillis) -> usize {
        let keepalive = self.keepalive_ms;
        let before = self.last_used.len();
        self.last_used
            .retain(|_, last_used| now.saturating_sub(*last_used) <= keepalive);
        before - self.last_used.len()
    }
}
