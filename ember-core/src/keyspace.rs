//! Data-store contract and the in-memory implementation behind it.
//!
//! The execution core only talks to [`DataStore`], a deliberately narrow
//! trait: command handlers perform typed reads and writes, the cron drives
//! maintenance, and tests substitute a counting mock. [`MemoryStore`] is
//! the production implementation: one table per keyspace with an
//! expiration index, per-key version counters for optimistic watching,
//! approximate memory accounting and incremental table resizing.

use std::collections::VecDeque;

use ember_common::ids::{DbCount, DbIndex, UnixMillis};

use crate::command::CommandFrame;
use crate::containers::HotMap;

/// Fixed bookkeeping cost charged per stored entry on top of payload bytes.
const ENTRY_OVERHEAD_BYTES: u64 = 64;

/// Tables whose fill ratio drops below this percentage become shrink
/// candidates.
const RESIZE_MIN_FILL_PCT: usize = 10;

/// Tables below this capacity are never worth shrinking.
const RESIZE_MIN_CAPACITY: usize = 128;

/// Stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Binary-safe string payload.
    Str(Vec<u8>),
    /// Double-ended list of binary-safe elements.
    List(VecDeque<Vec<u8>>),
}

impl Value {
    /// Reply-facing type name.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    fn payload_bytes(&self) -> u64 {
        match self {
            Self::Str(bytes) => bytes.len() as u64,
            Self::List(items) => items.iter().map(|item| item.len() as u64 + 16).sum(),
        }
    }
}

/// A typed accessor was used against a value of another kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

/// Result alias for typed store accessors.
pub type StoreResult<T> = Result<T, WrongType>;

/// Narrow storage contract consumed by admission, dispatch and cron.
pub trait DataStore {
    /// Reads a string value. `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`WrongType`] when the key holds a non-string value.
    fn get_string(&self, db: DbIndex, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Returns whether the key exists, expiration ignored.
    fn key_exists(&self, db: DbIndex, key: &[u8]) -> bool;

    /// Returns the reply-facing type name of the stored value.
    fn value_kind(&self, db: DbIndex, key: &[u8]) -> Option<&'static str>;

    /// Length of the list stored at `key`; zero when absent.
    ///
    /// # Errors
    ///
    /// Returns [`WrongType`] when the key holds a non-list value.
    fn list_len(&self, db: DbIndex, key: &[u8]) -> StoreResult<usize>;

    /// Expiration deadline for the key, when one is set.
    fn expire_time(&self, db: DbIndex, key: &[u8]) -> Option<UnixMillis>;

    /// Whether the key carries a deadline at or before `now`.
    fn is_expired(&self, db: DbIndex, key: &[u8], now: UnixMillis) -> bool {
        self.expire_time(db, key).is_some_and(|at| at <= now)
    }

    /// Monotonic mutation version for optimistic watching. Zero for keys
    /// never written.
    fn key_version(&self, db: DbIndex, key: &[u8]) -> u64;

    /// Number of keys in the keyspace.
    fn key_count(&self, db: DbIndex) -> usize;

    /// Number of keys carrying an expiration deadline.
    fn expires_count(&self, db: DbIndex) -> usize;

    /// Current bucket capacity of the keyspace table.
    fn table_capacity(&self, db: DbIndex) -> usize;

    /// Approximate bytes held by all keyspaces.
    fn memory_used(&self) -> u64;

    /// An arbitrary key from the keyspace, if any.
    fn random_key(&self, db: DbIndex) -> Option<Vec<u8>>;

    /// Samples up to `limit` keys with expiration deadlines, starting at a
    /// rotating `offset` so repeated cycles cover the whole index.
    fn sample_expires(
        &self,
        db: DbIndex,
        offset: usize,
        limit: usize,
    ) -> Vec<(Vec<u8>, UnixMillis)>;

    /// Samples up to `limit` arbitrary keys, used by eviction.
    fn sample_keys(&self, db: DbIndex, limit: usize) -> Vec<Vec<u8>>;

    /// Inserts or replaces a string value, clearing any prior expiration.
    fn set_string(&mut self, db: DbIndex, key: &[u8], value: Vec<u8>);

    /// Appends to a string value, creating it when absent. Returns the new
    /// length.
    ///
    /// # Errors
    ///
    /// Returns [`WrongType`] when the key holds a non-string value.
    fn append_string(&mut self, db: DbIndex, key: &[u8], tail: &[u8]) -> StoreResult<usize>;

    /// Pushes one element onto the list at `key`, creating it when absent.
    /// Returns the new list length.
    ///
    /// # Errors
    ///
    /// Returns [`WrongType`] when the key holds a non-list value.
    fn push_list(&mut self, db: DbIndex, key: &[u8], element: Vec<u8>, front: bool)
        -> StoreResult<usize>;

    /// Pops the head element of the list at `key`. Empty lists are removed.
    ///
    /// # Errors
    ///
    /// Returns [`WrongType`] when the key holds a non-list value.
    fn pop_list_front(&mut self, db: DbIndex, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Removes a key and its expiration. Returns whether it existed.
    fn remove(&mut self, db: DbIndex, key: &[u8]) -> bool;

    /// Sets the expiration deadline. Returns `false` when the key is absent.
    fn set_expire(&mut self, db: DbIndex, key: &[u8], at: UnixMillis) -> bool;

    /// Drops the expiration deadline. Returns whether one was present.
    fn clear_expire(&mut self, db: DbIndex, key: &[u8]) -> bool;

    /// Removes every key in one keyspace, returning how many were dropped.
    fn flush_db(&mut self, db: DbIndex) -> usize;

    /// Removes every key in every keyspace.
    fn flush_all(&mut self) -> usize;

    /// Drains the modified-key log accumulated since the previous drain,
    /// used for client-side-cache invalidation broadcasts.
    fn take_touched_keys(&mut self) -> Vec<(DbIndex, Vec<u8>)>;

    /// Whether the keyspace table is sparse enough to shrink.
    fn needs_resize(&self, db: DbIndex) -> bool;

    /// Starts an incremental shrink of the keyspace table.
    fn begin_resize(&mut self, db: DbIndex);

    /// Moves up to `max_entries` entries of an in-progress resize. Returns
    /// `true` while there is still resize work left afterwards.
    fn rehash_step(&mut self, db: DbIndex, max_entries: usize) -> bool;

    /// Whether a resize is currently in progress for the keyspace.
    fn resize_in_progress(&self, db: DbIndex) -> bool;
}

/// One keyspace table.
///
/// During an incremental resize the previous (oversized) map sits in
/// `draining` while entries migrate into the freshly sized `entries` map a
/// bounded batch per cron tick. Reads consult both maps until the drain
/// completes.
#[derive(Debug, Clone, Default)]
struct Table {
    entries: HotMap<Vec<u8>, Value>,
    draining: Option<HotMap<Vec<u8>, Value>>,
    expires: HotMap<Vec<u8>, UnixMillis>,
    versions: HotMap<Vec<u8>, u64>,
}

impl Table {
    fn lookup(&self, key: &[u8]) -> Option<&Value> {
        if let Some(value) = self.entries.get(key) {
            return Some(value);
        }
        self.draining.as_ref().and_then(|old| old.get(key))
    }

    fn lookup_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        if self.entries.contains_key(key) {
            return self.entries.get_mut(key);
        }
        self.draining.as_mut().and_then(|old| old.get_mut(key))
    }

    fn take(&mut self, key: &[u8]) -> Option<Value> {
        if let Some(value) = self.entries.remove(key) {
            return Some(value);
        }
        self.draining.as_mut().and_then(|old| old.remove(key))
    }

    fn len(&self) -> usize {
        self.entries.len() + self.draining.as_ref().map_or(0, HotMap::len)
    }

    fn capacity(&self) -> usize {
        self.entries.capacity() + self.draining.as_ref().map_or(0, HotMap::capacity)
    }

    fn bump_version(&mut self, key: &[u8]) {
        let slot = self.versions.entry(key.to_vec()).or_insert(0);
        *slot = slot.wrapping_add(1);
    }
}

/// In-memory store: one [`Table`] per configured keyspace.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Vec<Table>,
    bytes: u64,
    touched: Vec<(DbIndex, Vec<u8>)>,
}

impl MemoryStore {
    /// Creates a store with `databases` empty keyspaces.
    #[must_use]
    pub fn new(databases: DbCount) -> Self {
        Self {
            tables: vec![Table::default(); usize::from(databases.get())],
            bytes: 0,
            touched: Vec::new(),
        }
    }

    /// Number of keyspaces hosted by this store.
    #[must_use]
    pub fn db_count(&self) -> usize {
        self.tables.len()
    }

    /// Flattens the dataset into replayable command records: one
    /// `SET`/`RPUSH` per key plus a `PEXPIREAT` per deadline. Snapshot and
    /// log-rewrite children run this against an isolated clone.
    #[must_use]
    pub fn export_records(&self) -> Vec<(DbIndex, CommandFrame)> {
        let mut records = Vec::new();
        for (db_index, table) in self.tables.iter().enumerate() {
            let db = db_index as DbIndex;
            for (key, value) in table.entries.iter().chain(table.draining.iter().flatten()) {
                match value {
                    Value::Str(bytes) => records.push((
                        db,
                        CommandFrame::new("SET", vec![key.clone(), bytes.clone()]),
                    )),
                    Value::List(items) => {
                        let mut args = Vec::with_capacity(items.len() + 1);
                        args.push(key.clone());
                        args.extend(items.iter().cloned());
                        records.push((db, CommandFrame::new("RPUSH", args)));
                    }
                }
                if let Some(at) = table.expires.get(key) {
                    records.push((
                        db,
                        CommandFrame::new(
                            "PEXPIREAT",
                            vec![key.clone(), at.to_string().into_bytes()],
                        ),
                    ));
                }
            }
        }
        records
    }

    fn table(&self, db: DbIndex) -> Option<&Table> {
        self.tables.get(usize::from(db))
    }

    fn table_mut(&mut self, db: DbIndex) -> Option<&mut Table> {
        self.tables.get_mut(usize::from(db))
    }

    fn charge(&mut self, key: &[u8], value: &Value) {
        self.bytes = self
            .bytes
            .saturating_add(key.len() as u64 + value.payload_bytes() + ENTRY_OVERHEAD_BYTES);
    }

    fn refund(&mut self, key: &[u8], value: &Value) {
        self.bytes = self
            .bytes
            .saturating_sub(key.len() as u64 + value.payload_bytes() + ENTRY_OVERHEAD_BYTES);
    }

    fn note_touched(&mut self, db: DbIndex, key: &[u8]) {
        self.touched.push((db, key.to_vec()));
        if let Some(table) = self.table_mut(db) {
            table.bump_version(key);
        }
    }
}

impl DataStore for MemoryStore {
    fn get_string(&self, db: DbIndex, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.table(db).and_then(|table| table.lookup(key)) {
            None => Ok(None),
            Some(Value::Str(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::List(_)) => Err(WrongType),
        }
    }

    fn key_exists(&self, db: DbIndex, key: &[u8]) -> bool {
        self.table(db).is_some_and(|table| table.lookup(key).is_some())
    }

    fn value_kind(&self, db: DbIndex, key: &[u8]) -> Option<&'static str> {
        self.table(db)
            .and_then(|table| table.lookup(key))
            .map(Value::kind_name)
    }

    fn list_len(&self, db: DbIndex, key: &[u8]) -> StoreResult<usize> {
        match self.table(db).and_then(|table| table.lookup(key)) {
            None => Ok(0),
            Some(Value::List(items)) => Ok(items.len()),
            Some(Value::Str(_)) => Err(WrongType),
        }
    }

    fn expire_time(&self, db: DbIndex, key: &[u8]) -> Option<UnixMillis> {
        self.table(db).and_then(|table| table.expires.get(key).copied())
    }

    fn key_version(&self, db: DbIndex, key: &[u8]) -> u64 {
        self.table(db)
            .and_then(|table| table.versions.get(key).copied())
            .unwrap_or(0)
    }

    fn key_count(&self, db: DbIndex) -> usize {
        self.table(db).map_or(0, Table::len)
    }

    fn expires_count(&self, db: DbIndex) -> usize {
        self.table(db).map_or(0, |table| table.expires.len())
    }

    fn table_capacity(&self, db: DbIndex) -> usize {
        self.table(db).map_or(0, Table::capacity)
    }

    fn memory_used(&self) -> u64 {
        self.bytes
    }

    fn random_key(&self, db: DbIndex) -> Option<Vec<u8>> {
        let table = self.table(db)?;
        table
            .entries
            .keys()
            .next()
            .or_else(|| table.draining.as_ref().and_then(|old| old.keys().next()))
            .cloned()
    }

    fn sample_expires(
        &self,
        db: DbIndex,
        offset: usize,
        limit: usize,
    ) -> Vec<(Vec<u8>, UnixMillis)> {
        let Some(table) = self.table(db) else {
            return Vec::new();
        };
        let total = table.expires.len();
        if total == 0 || limit == 0 {
            return Vec::new();
        }

        let start = offset % total;
        let mut sampled = table
            .expires
            .iter()
            .skip(start)
            .take(limit)
            .map(|(key, at)| (key.clone(), *at))
            .collect::<Vec<_>>();
        if sampled.len() < limit {
            sampled.extend(
                table
                    .expires
                    .iter()
                    .take(limit - sampled.len())
                    .map(|(key, at)| (key.clone(), *at)),
            );
        }
        sampled.truncate(limit.min(total));
        sampled
    }

    fn sample_keys(&self, db: DbIndex, limit: usize) -> Vec<Vec<u8>> {
        let Some(table) = self.table(db) else {
            return Vec::new();
        };
        table.entries.keys().take(limit).cloned().collect()
    }

    fn set_string(&mut self, db: DbIndex, key: &[u8], value: Vec<u8>) {
        let value = Value::Str(value);
        let previous = match self.table_mut(db) {
            Some(table) => {
                let previous = table.take(key);
                let _ = table.expires.remove(key);
                let _ = table.entries.insert(key.to_vec(), value.clone());
                previous
            }
            None => return,
        };
        if let Some(old) = previous {
            self.refund(key, &old);
        }
        self.charge(key, &value);
        self.note_touched(db, key);
    }

    fn append_string(&mut self, db: DbIndex, key: &[u8], tail: &[u8]) -> StoreResult<usize> {
        let new_len = {
            let Some(table) = self.table_mut(db) else {
                return Ok(0);
            };
            match table.lookup_mut(key) {
                Some(Value::Str(bytes)) => {
                    bytes.extend_from_slice(tail);
                    Some(bytes.len())
                }
                Some(Value::List(_)) => return Err(WrongType),
                None => None,
            }
        };

        match new_len {
            Some(len) => {
                self.bytes = self.bytes.saturating_add(tail.len() as u64);
                self.note_touched(db, key);
                Ok(len)
            }
            None => {
                self.set_string(db, key, tail.to_vec());
                Ok(tail.len())
            }
        }
    }

    fn push_list(
        &mut self,
        db: DbIndex,
        key: &[u8],
        element: Vec<u8>,
        front: bool,
    ) -> StoreResult<usize> {
        let element_cost = element.len() as u64 + 16;
        let (len, created) = {
            let Some(table) = self.table_mut(db) else {
                return Ok(0);
            };
            if table.lookup(key).is_none() {
                let mut items = VecDeque::new();
                items.push_back(element);
                let _ = table.entries.insert(key.to_vec(), Value::List(items));
                (1, true)
            } else {
                match table.lookup_mut(key) {
                    Some(Value::List(items)) => {
                        if front {
                            items.push_front(element);
                        } else {
                            items.push_back(element);
                        }
                        (items.len(), false)
                    }
                    Some(Value::Str(_)) => return Err(WrongType),
                    None => (0, false),
                }
            }
        };

        if created {
            self.bytes = self
                .bytes
                .saturating_add(key.len() as u64 + element_cost + ENTRY_OVERHEAD_BYTES);
        } else {
            self.bytes = self.bytes.saturating_add(element_cost);
        }
        self.note_touched(db, key);
        Ok(len)
    }

    fn pop_list_front(&mut self, db: DbIndex, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let (popped, now_empty) = {
            let Some(table) = self.table_mut(db) else {
                return Ok(None);
            };
            match table.lookup_mut(key) {
                Some(Value::List(items)) => {
                    let popped = items.pop_front();
                    let now_empty = items.is_empty();
                    (popped, now_empty)
                }
                Some(Value::Str(_)) => return Err(WrongType),
                None => return Ok(None),
            }
        };

        let Some(element) = popped else {
            return Ok(None);
        };
        self.bytes = self.bytes.saturating_sub(element.len() as u64 + 16);
        if now_empty {
            let _ = self.remove(db, key);
        } else {
            self.note_touched(db, key);
        }
        Ok(Some(element))
    }

    fn remove(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let removed = match self.table_mut(db) {
            Some(table) => {
                let removed = table.take(key);
                let _ = table.expires.remove(key);
                removed
            }
            None => None,
        };
        match removed {
            Some(value) => {
                self.refund(key, &value);
                self.note_touched(db, key);
                true
            }
            None => false,
        }
    }

    fn set_expire(&mut self, db: DbIndex, key: &[u8], at: UnixMillis) -> bool {
        let updated = match self.table_mut(db) {
            Some(table) => {
                if table.lookup(key).is_some() {
                    let _ = table.expires.insert(key.to_vec(), at);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if updated {
            self.note_touched(db, key);
        }
        updated
    }

    fn clear_expire(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let cleared = match self.table_mut(db) {
            Some(table) => table.expires.remove(key).is_some(),
            None => false,
        };
        if cleared {
            self.note_touched(db, key);
        }
        cleared
    }

    fn flush_db(&mut self, db: DbIndex) -> usize {
        let (dropped, refunded) = match self.table_mut(db) {
            Some(table) => {
                let dropped = table.len();
                let refunded = table
                    .entries
                    .iter()
                    .chain(table.draining.iter().flatten())
                    .map(|(key, value)| {
                        key.len() as u64 + value.payload_bytes() + ENTRY_OVERHEAD_BYTES
                    })
                    .sum::<u64>();
                *table = Table::default();
                (dropped, refunded)
            }
            None => (0, 0),
        };
        self.bytes = self.bytes.saturating_sub(refunded);
        dropped
    }

    fn flush_all(&mut self) -> usize {
        let mut dropped = 0;
        for db in 0..self.tables.len() {
            dropped += self.flush_db(db as DbIndex);
        }
        dropped
    }

    fn take_touched_keys(&mut self) -> Vec<(DbIndex, Vec<u8>)> {
        std::mem::take(&mut self.touched)
    }

    fn needs_resize(&self, db: DbIndex) -> bool {
        let Some(table) = self.table(db) else {
            return false;
        };
        if table.draining.is_some() {
            return false;
        }
        let capacity = table.entries.capacity();
        capacity >= RESIZE_MIN_CAPACITY
            && table.entries.len() * 100 < capacity * RESIZE_MIN_FILL_PCT
    }

    fn begin_resize(&mut self, db: DbIndex) {
        if !self.needs_resize(db) {
            return;
        }
        if let Some(table) = self.table_mut(db) {
            let old = std::mem::take(&mut table.entries);
            table.entries = HotMap::with_capacity(old.len());
            table.draining = Some(old);
        }
    }

    fn rehash_step(&mut self, db: DbIndex, max_entries: usize) -> bool {
        let Some(table) = self.table_mut(db) else {
            return false;
        };
        let Some(mut old) = table.draining.take() else {
            return false;
        };

        let batch = old
            .keys()
            .take(max_entries)
            .cloned()
            .collect::<Vec<_>>();
        for key in batch {
            if let Some(value) = old.remove(&key) {
                let _ = table.entries.insert(key, value);
            }
        }

        if old.is_empty() {
            return false;
        }
        table.draining = Some(old);
        true
    }

    fn resize_in_progress(&self, db: DbIndex) -> bool {
        self.table(db).is_some_and(|table| table.draining.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{DataStore, MemoryStore};
    use ember_common::ids::DbCount;
    use googletest::prelude::*;
    use rstest::rstest;

    fn store() -> MemoryStore {
        MemoryStore::new(DbCount::new(4).expect("valid keyspace count"))
    }

    #[rstest]
    fn set_and_get_round_trip_within_one_keyspace() {
        let mut store = store();
        store.set_string(0, b"k", b"v".to_vec());

        assert_that!(
            store.get_string(0, b"k").expect("string key"),
            eq(&Some(b"v".to_vec()))
        );
        assert_that!(store.get_string(1, b"k").expect("other keyspace"), eq(&None));
    }

    #[rstest]
    fn typed_accessors_reject_cross_kind_use() {
        let mut store = store();
        let _ = store.push_list(0, b"q", b"a".to_vec(), false).expect("new list");

        assert_that!(store.get_string(0, b"q").is_err(), eq(true));
        assert_that!(store.append_string(0, b"q", b"x").is_err(), eq(true));

        store.set_string(0, b"s", b"v".to_vec());
        assert_that!(store.list_len(0, b"s").is_err(), eq(true));
    }

    #[rstest]
    fn popping_the_last_element_removes_the_list_key() {
        let mut store = store();
        let _ = store.push_list(0, b"q", b"only".to_vec(), false).expect("push");

        let popped = store.pop_list_front(0, b"q").expect("list key");
        assert_that!(popped, eq(&Some(b"only".to_vec())));
        assert_that!(store.key_exists(0, b"q"), eq(false));
    }

    #[rstest]
    fn overwriting_a_key_clears_its_expiration() {
        let mut store = store();
        store.set_string(0, b"k", b"v".to_vec());
        assert_that!(store.set_expire(0, b"k", 1_000), eq(true));

        store.set_string(0, b"k", b"v2".to_vec());
        assert_that!(store.expire_time(0, b"k"), eq(None));
    }

    #[rstest]
    fn key_versions_advance_on_every_mutation() {
        let mut store = store();
        assert_that!(store.key_version(0, b"k"), eq(0_u64));

        store.set_string(0, b"k", b"v".to_vec());
        let after_set = store.key_version(0, b"k");
        let _ = store.remove(0, b"k");
        let after_remove = store.key_version(0, b"k");

        assert_that!(after_set > 0, eq(true));
        assert_that!(after_remove > after_set, eq(true));
    }

    #[rstest]
    fn memory_accounting_returns_to_zero_after_flush() {
        let mut store = store();
        store.set_string(0, b"a", vec![0_u8; 100]);
        let _ = store.push_list(1, b"q", vec![0_u8; 50], false).expect("push");
        assert_that!(store.memory_used() > 0, eq(true));

        let dropped = store.flush_all();
        assert_that!(dropped, eq(2_usize));
        assert_that!(store.memory_used(), eq(0_u64));
    }

    #[rstest]
    fn incremental_resize_keeps_every_key_reachable() {
        let mut store = store();
        for index in 0..512_u32 {
            store.set_string(0, format!("key:{index}").as_bytes(), b"v".to_vec());
        }
        for index in 0..500_u32 {
            let _ = store.remove(0, format!("key:{index}").as_bytes());
        }
        assert_that!(store.needs_resize(0), eq(true));

        store.begin_resize(0);
        assert_that!(store.resize_in_progress(0), eq(true));
        for index in 500..512_u32 {
            assert_that!(store.key_exists(0, format!("key:{index}").as_bytes()), eq(true));
        }

        while store.rehash_step(0, 4) {}
        assert_that!(store.resize_in_progress(0), eq(false));
        assert_that!(store.key_count(0), eq(12_usize));
    }

    #[rstest]
    fn expire_samples_wrap_around_the_index() {
        let mut store = store();
        for index in 0..8_u32 {
            let key = format!("volatile:{index}");
            store.set_string(0, key.as_bytes(), b"v".to_vec());
            assert_that!(store.set_expire(0, key.as_bytes(), 10 + u64::from(index)), eq(true));
        }

        let sampled = store.sample_expires(0, 6, 5);
        assert_that!(sampled.len(), eq(5_usize));
    }

    #[rstest]
    fn touched_key_log_drains_once() {
        let mut store = store();
        store.set_string(0, b"k", b"v".to_vec());
        let _ = store.remove(0, b"k");

        let touched = store.take_touched_keys();
        assert_that!(touched.len(), eq(2_usize));
        assert_that!(store.take_touched_keys().is_empty(), eq(true));
    }
}
