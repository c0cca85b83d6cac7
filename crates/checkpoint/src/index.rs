use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Where an indexed checkpoint value lives: small values are kept inline,
/// large ones by their file location from `Writer::write_record`.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEntry {
    Inline(Bytes),
    Located { offset: u64, len: usize },
}

/// Index is the in-memory map over recently written checkpoints, letting
/// a just-checkpointed result be consulted without re-reading the file.
/// Bounded by entry count; the oldest insertions fall out first.
pub struct Index {
    max_entries: usize,
    entries: HashMap<Bytes, IndexEntry>,
    order: VecDeque<Bytes>,
}

impl Index {
    /// `max_entries` of zero disables indexing.
    pub fn new(max_entries: usize) -> Index {
        Index {
            max_entries,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, key: Bytes, entry: IndexEntry) {
        if self.max_entries == 0 {
            return;
        }
        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.max_entries {
            let oldest = self.order.pop_front().expect("over-budget index is non-empty");
            self.entries.remove(&oldest);
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.entries.get(key)
    }
}
