//! In-memory LRU storage.
//!
//! A key/value store bounded by the total number of key+value bytes it
//! holds. Entries live in a slab arena and are threaded onto a recency
//! list through their slab handles; a hash index maps key bytes to
//! handles. Lookup, insert, delete, and promotion are all O(1); eviction
//! walks from the least recently used end one entry at a time.
//!
//! The store is not internally synchronized. Callers serialize access
//! (the runtime keeps it behind a single `Mutex`, see `runtime`).

use slab::Slab;
use std::collections::HashMap;
use tracing::trace;

/// A cache entry, linked into the recency list by slab handle.
#[derive(Debug)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Entry {
    fn cost(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Byte-bounded LRU key/value store.
pub struct LruStorage {
    entries: Slab<Entry>,
    index: HashMap<Vec<u8>, usize>,
    /// Most recently used entry.
    head: Option<usize>,
    /// Least recently used entry.
    tail: Option<usize>,
    cur_size: usize,
    max_size: usize,
}

impl LruStorage {
    pub fn new(max_size: usize) -> Self {
        LruStorage {
            entries: Slab::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            cur_size: 0,
            max_size,
        }
    }

    /// Insert or overwrite `key`, evicting from the tail until the pair
    /// fits. Returns false iff `key` + `value` exceed the store capacity.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() + value.len() > self.max_size {
            return false;
        }
        match self.index.get(key) {
            Some(&handle) => self.update(handle, value),
            None => self.insert(key, value),
        }
        true
    }

    /// As `put`, but a no-op returning false when `key` is already
    /// present. The existing entry keeps its recency position.
    pub fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() + value.len() > self.max_size {
            return false;
        }
        if self.index.contains_key(key) {
            return false;
        }
        self.insert(key, value);
        true
    }

    /// Overwrite an existing key. Returns false when `key` is absent or
    /// the new pair exceeds capacity.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
        if key.len() + value.len() > self.max_size {
            return false;
        }
        match self.index.get(key) {
            Some(&handle) => {
                self.update(handle, value);
                true
            }
            None => false,
        }
    }

    /// Look up `key`, promoting the entry to most recently used.
    pub fn get(&mut self, key: &[u8]) -> Option<&[u8]> {
        let handle = *self.index.get(key)?;
        self.move_to_head(handle);
        Some(&self.entries[handle].value[..])
    }

    /// Remove `key`. Returns false when absent.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let Some(handle) = self.index.remove(key) else {
            return false;
        };
        self.unlink(handle);
        let entry = self.entries.remove(handle);
        self.cur_size -= entry.cost();
        true
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes currently held (sum of key+value lengths).
    pub fn current_bytes(&self) -> usize {
        self.cur_size
    }

    pub fn max_bytes(&self) -> usize {
        self.max_size
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) {
        let cost = key.len() + value.len();
        if self.cur_size + cost > self.max_size {
            self.evict(self.cur_size + cost - self.max_size, None);
        }
        let handle = self.entries.insert(Entry {
            key: key.to_vec(),
            value: value.to_vec(),
            prev: None,
            next: None,
        });
        self.push_front(handle);
        self.index.insert(key.to_vec(), handle);
        self.cur_size += cost;
    }

    /// Replace the value of an existing entry. The entry is promoted
    /// before eviction runs, so the eviction pass never removes it.
    fn update(&mut self, handle: usize, value: &[u8]) {
        self.move_to_head(handle);
        let new_size = self.cur_size - self.entries[handle].value.len() + value.len();
        if new_size > self.max_size {
            self.evict(new_size - self.max_size, Some(handle));
        }
        let entry = &mut self.entries[handle];
        self.cur_size -= entry.value.len();
        entry.value = value.to_vec();
        self.cur_size += value.len();
    }

    /// Free at least `needed` bytes from the tail, never touching `keep`.
    fn evict(&mut self, mut needed: usize, keep: Option<usize>) {
        while needed > 0 {
            let Some(victim) = self.tail else {
                break;
            };
            if Some(victim) == keep {
                break;
            }
            self.unlink(victim);
            let entry = self.entries.remove(victim);
            self.index.remove(&entry.key);
            let freed = entry.cost();
            self.cur_size -= freed;
            needed = needed.saturating_sub(freed);
            trace!(
                key = %String::from_utf8_lossy(&entry.key),
                freed,
                "evicted LRU entry"
            );
        }
    }

    fn push_front(&mut self, handle: usize) {
        self.entries[handle].prev = None;
        self.entries[handle].next = self.head;
        match self.head {
            Some(old_head) => self.entries[old_head].prev = Some(handle),
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
    }

    fn unlink(&mut self, handle: usize) {
        let (prev, next) = {
            let entry = &self.entries[handle];
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[handle].prev = None;
        self.entries[handle].next = None;
    }

    fn move_to_head(&mut self, handle: usize) {
        if self.head == Some(handle) {
            return;
        }
        self.unlink(handle);
        self.push_front(handle);
    }
}
