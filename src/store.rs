// ABOUTME: Chained-bucket hash table with per-entry time-based expiry and capacity doubling
// ABOUTME: Shared across connection workers through a single global mutex handle

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Number of buckets a store starts with unless the caller picks otherwise.
pub const DEFAULT_CAPACITY: usize = 100;

/// How a storage command treats the current presence of its key.
///
/// An entry whose expiry has passed counts as absent for these checks even
/// when it has not been reaped yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally, overwriting any existing entry.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
}

/// Outcome of a storage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    NotStored,
}

/// A stored record as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: String,
    pub flags: u32,
    pub byte_count: u64,
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: String,
    flags: u32,
    byte_count: u64,
    // Absolute deadline; `None` never expires. Every storing write rewrites
    // this field, so an update always refreshes the deadline.
    expiry: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|deadline| deadline <= now)
    }
}

/// Keyed cache with time-based expiry.
///
/// Keys hash to a bucket by a wrapping byte sum reduced modulo the bucket
/// count; collisions chain within the bucket. After any insertion that
/// pushes the load factor to one half, the bucket count doubles and every
/// live entry is rehashed. Entries observed expired along the way are
/// dropped rather than carried over.
///
/// The table itself is single-threaded; [`SharedStore`] adds the global
/// mutex that connection workers go through.
#[derive(Debug)]
pub struct Store {
    buckets: Vec<Vec<Entry>>,
    len: usize,
}

impl Store {
    /// Create a store with `capacity` buckets.
    pub fn new(capacity: usize) -> Store {
        // A zero-bucket table has nothing to hash into.
        let capacity = capacity.max(1);
        Store {
            buckets: (0..capacity).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    /// Store `value` under `key` according to `mode`.
    ///
    /// `exptime < 0` rejects the write outright; `0` stores without expiry;
    /// anything positive expires the entry that many seconds from now.
    pub fn insert(
        &mut self,
        key: &str,
        value: String,
        flags: u32,
        byte_count: u64,
        exptime: i64,
        mode: StoreMode,
    ) -> StoreOutcome {
        if exptime < 0 {
            return StoreOutcome::NotStored;
        }
        let now = Instant::now();
        let expiry = (exptime > 0).then(|| now + Duration::from_secs(exptime as u64));

        let index = self.bucket_index(key);
        let Some(pos) = self.buckets[index].iter().position(|entry| entry.key == key) else {
            if mode == StoreMode::Replace {
                return StoreOutcome::NotStored;
            }
            self.buckets[index].push(Entry {
                key: key.to_string(),
                value,
                flags,
                byte_count,
                expiry,
            });
            self.len += 1;
            self.maybe_resize();
            return StoreOutcome::Stored;
        };

        let live = !self.buckets[index][pos].is_expired(now);
        match mode {
            StoreMode::Add if live => StoreOutcome::NotStored,
            StoreMode::Replace if !live => {
                // The stale entry counts as absent; reap it on the way out.
                self.buckets[index].swap_remove(pos);
                self.len -= 1;
                StoreOutcome::NotStored
            }
            _ => {
                let entry = &mut self.buckets[index][pos];
                entry.value = value;
                entry.flags = flags;
                entry.byte_count = byte_count;
                entry.expiry = expiry;
                StoreOutcome::Stored
            }
        }
    }

    /// Look up the live entry for `key`.
    ///
    /// An entry whose deadline has passed reads as missing and is unlinked
    /// on the spot.
    pub fn get(&mut self, key: &str) -> Option<Item> {
        let now = Instant::now();
        let index = self.bucket_index(key);
        let pos = self.buckets[index].iter().position(|entry| entry.key == key)?;
        if self.buckets[index][pos].is_expired(now) {
            self.buckets[index].swap_remove(pos);
            self.len -= 1;
            return None;
        }
        let entry = &self.buckets[index][pos];
        Some(Item {
            value: entry.value.clone(),
            flags: entry.flags,
            byte_count: entry.byte_count,
        })
    }

    /// Unlink the entry for `key`. Returns `true` only when a live entry
    /// was removed; an expired entry is reaped but reported absent.
    pub fn delete(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let index = self.bucket_index(key);
        let Some(pos) = self.buckets[index].iter().position(|entry| entry.key == key) else {
            return false;
        };
        let expired = self.buckets[index][pos].is_expired(now);
        self.buckets[index].swap_remove(pos);
        self.len -= 1;
        !expired
    }

    /// Number of entries currently linked into the table. Expired entries
    /// that have not been reaped yet still count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current bucket count.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, key: &str) -> usize {
        let sum = key
            .bytes()
            .fold(0usize, |acc, byte| acc.wrapping_add(byte as usize));
        sum % self.buckets.len()
    }

    fn maybe_resize(&mut self) {
        if self.len * 2 >= self.buckets.len() {
            self.resize();
        }
    }

    fn resize(&mut self) {
        let now = Instant::now();
        let capacity = self.buckets.len() * 2;
        let drained = std::mem::replace(
            &mut self.buckets,
            (0..capacity).map(|_| Vec::new()).collect(),
        );
        for bucket in drained {
            for entry in bucket {
                if entry.is_expired(now) {
                    self.len -= 1;
                    continue;
                }
                let index = self.bucket_index(&entry.key);
                self.buckets[index].push(entry);
            }
        }
    }
}

/// Cloneable handle to a [`Store`] behind its global mutex.
///
/// Every public operation holds the lock for its full duration, so readers
/// and writers never run in parallel and each command observes an atomic
/// view of the cache. The lock is released before any reply bytes are
/// written back to a client.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Store>>,
}

impl SharedStore {
    pub fn new(capacity: usize) -> SharedStore {
        SharedStore {
            inner: Arc::new(Mutex::new(Store::new(capacity))),
        }
    }

    pub fn insert(
        &self,
        key: &str,
        value: String,
        flags: u32,
        byte_count: u64,
        exptime: i64,
        mode: StoreMode,
    ) -> StoreOutcome {
        self.lock().insert(key, value, flags, byte_count, exptime, mode)
    }

    pub fn get(&self, key: &str) -> Option<Item> {
        self.lock().get(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().delete(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap()
    }
}

impl Default for SharedStore {
    fn default() -> SharedStore {
        SharedStore::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn insert_set(store: &mut Store, key: &str, value: &str, exptime: i64) -> StoreOutcome {
        store.insert(
            key,
            value.to_string(),
            0,
            value.len() as u64,
            exptime,
            StoreMode::Set,
        )
    }

    #[test]
    fn set_then_get_round_trip() {
        let mut store = Store::new(8);
        assert_eq!(
            store.insert("test", "1234".to_string(), 7, 4, 0, StoreMode::Set),
            StoreOutcome::Stored
        );

        let item = store.get("test").unwrap();
        assert_eq!(item.value, "1234");
        assert_eq!(item.flags, 7);
        assert_eq!(item.byte_count, 4);
    }

    #[test]
    fn negative_exptime_rejects_the_write() {
        let mut store = Store::new(8);
        assert_eq!(insert_set(&mut store, "test", "1234", -1), StoreOutcome::NotStored);
        assert!(store.get("test").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn positive_exptime_expires_the_entry() {
        let mut store = Store::new(8);
        assert_eq!(insert_set(&mut store, "test", "1234", 1), StoreOutcome::Stored);
        assert!(store.get("test").is_some());

        thread::sleep(Duration::from_millis(1100));
        assert!(store.get("test").is_none());
        // The reader that observed expiry also unlinked the entry.
        assert!(store.is_empty());
    }

    #[test]
    fn set_overwrite_refreshes_expiry() {
        let mut store = Store::new(8);
        insert_set(&mut store, "test", "old", 1);
        insert_set(&mut store, "test", "new", 0);

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.get("test").unwrap().value, "new");
    }

    #[test]
    fn add_stores_only_when_absent() {
        let mut store = Store::new(8);
        assert_eq!(
            store.insert("test", "1234".to_string(), 0, 4, 0, StoreMode::Add),
            StoreOutcome::Stored
        );
        assert_eq!(
            store.insert("test", "9999".to_string(), 0, 4, 0, StoreMode::Add),
            StoreOutcome::NotStored
        );
        assert_eq!(store.get("test").unwrap().value, "1234");
    }

    #[test]
    fn add_treats_an_expired_entry_as_absent() {
        let mut store = Store::new(8);
        insert_set(&mut store, "test", "1234", 1);
        thread::sleep(Duration::from_millis(1100));

        assert_eq!(
            store.insert("test", "5678".to_string(), 0, 4, 0, StoreMode::Add),
            StoreOutcome::Stored
        );
        assert_eq!(store.get("test").unwrap().value, "5678");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn replace_stores_only_when_present() {
        let mut store = Store::new(8);
        assert_eq!(
            store.insert("test", "1234".to_string(), 0, 4, 0, StoreMode::Replace),
            StoreOutcome::NotStored
        );

        insert_set(&mut store, "test", "1234", 0);
        assert_eq!(
            store.insert("test", "5678".to_string(), 0, 4, 0, StoreMode::Replace),
            StoreOutcome::Stored
        );
        assert_eq!(store.get("test").unwrap().value, "5678");
    }

    #[test]
    fn replace_treats_an_expired_entry_as_absent() {
        let mut store = Store::new(8);
        insert_set(&mut store, "test", "1234", 1);
        thread::sleep(Duration::from_millis(1100));

        assert_eq!(
            store.insert("test", "5678".to_string(), 0, 4, 0, StoreMode::Replace),
            StoreOutcome::NotStored
        );
        assert!(store.get("test").is_none());
    }

    #[test]
    fn delete_reports_live_entries_only() {
        let mut store = Store::new(8);
        insert_set(&mut store, "test", "1234", 0);

        assert!(store.delete("test"));
        assert!(!store.delete("test"));
        assert!(store.is_empty());
    }

    #[test]
    fn delete_reaps_but_does_not_report_an_expired_entry() {
        let mut store = Store::new(8);
        insert_set(&mut store, "test", "1234", 1);
        thread::sleep(Duration::from_millis(1100));

        assert!(!store.delete("test"));
        assert!(store.is_empty());
    }

    #[test]
    fn load_factor_stays_below_one_half() {
        let mut store = Store::new(4);
        for i in 0..100 {
            insert_set(&mut store, &format!("key{i}"), "v", 0);
            assert!(store.len() * 2 <= store.capacity());
        }
    }

    #[test]
    fn resize_preserves_live_entries() {
        let mut store = Store::new(4);
        for i in 0..20 {
            insert_set(&mut store, &format!("key{i}"), &format!("value{i}"), 0);
        }

        // Doubling from 4 under the one-half threshold lands at 64 for 20
        // entries.
        assert_eq!(store.capacity(), 64);
        assert_eq!(store.len(), 20);
        for i in 0..20 {
            assert_eq!(store.get(&format!("key{i}")).unwrap().value, format!("value{i}"));
        }
    }

    #[test]
    fn resize_drops_expired_entries() {
        let mut store = Store::new(4);
        insert_set(&mut store, "dead", "1234", 1);
        thread::sleep(Duration::from_millis(1100));

        // The second insertion crosses the load threshold and triggers the
        // rehash pass, which drops the expired entry.
        insert_set(&mut store, "live", "5678", 0);
        assert_eq!(store.capacity(), 8);
        assert_eq!(store.len(), 1);
        assert!(store.get("dead").is_none());
        assert_eq!(store.get("live").unwrap().value, "5678");
    }

    #[test]
    fn shared_store_clones_see_one_cache() {
        let store = SharedStore::new(8);
        let other = store.clone();

        store.insert("test", "1234".to_string(), 0, 4, 0, StoreMode::Set);
        assert_eq!(other.get("test").unwrap().value, "1234");
        assert!(other.delete("test"));
        assert!(store.get("test").is_none());
    }
}
