use bytes::Bytes;
use protocol::value::DataType;
use protocol::DatumId;
use std::collections::{BTreeMap, HashMap};

/// Cache is the read-side LRU over retrieved data. Recency is a monotonic
/// stamp counter rather than a clock; older stamps evict first. Bounded by
/// both entry count and total payload bytes. An entry never outlives its
/// datum: the owner invalidates on destruction.
pub struct Cache {
    max_entries: usize,
    max_bytes: u64,
    used_bytes: u64,
    counter: u64,
    entries: HashMap<DatumId, Entry>,
    /// Stamp to id, ordered oldest-first.
    lru: BTreeMap<u64, DatumId>,
}

struct Entry {
    data_type: DataType,
    bytes: Bytes,
    stamp: u64,
}

impl Cache {
    /// `max_entries` of zero disables the cache entirely.
    pub fn new(max_entries: usize, max_bytes: u64) -> Cache {
        Cache {
            max_entries,
            max_bytes,
            used_bytes: 0,
            counter: 0,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
        }
    }

    pub fn check(&self, id: DatumId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A hit refreshes the entry's recency.
    pub fn retrieve(&mut self, id: DatumId) -> Option<(DataType, Bytes)> {
        let entry = self.entries.get_mut(&id)?;
        self.lru.remove(&entry.stamp);
        entry.stamp = self.counter;
        self.counter += 1;
        self.lru.insert(entry.stamp, id);
        Some((entry.data_type, entry.bytes.clone()))
    }

    pub fn store(&mut self, id: DatumId, data_type: DataType, bytes: Bytes) {
        if self.max_entries == 0 {
            return;
        }
        if self.entries.contains_key(&id) {
            // Single-assignment data: a re-store carries identical bytes.
            return;
        }
        self.used_bytes += bytes.len() as u64;
        let stamp = self.counter;
        self.counter += 1;
        self.entries.insert(
            id,
            Entry {
                data_type,
                bytes,
                stamp,
            },
        );
        self.lru.insert(stamp, id);
        self.shrink();
    }

    pub fn invalidate(&mut self, id: DatumId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.lru.remove(&entry.stamp);
            self.used_bytes -= entry.bytes.len() as u64;
        }
    }

    /// Evict oldest-first until both budgets hold again.
    fn shrink(&mut self) {
        while self.entries.len() > self.max_entries || self.used_bytes > self.max_bytes {
            let (&stamp, &id) = self.lru.first_key_value().expect("over-budget cache is non-empty");
            self.lru.remove(&stamp);
            let entry = self.entries.remove(&id).expect("lru entry exists");
            self.used_bytes -= entry.bytes.len() as u64;
            tracing::trace!(id, "cache evicted");
        }
    }
}
