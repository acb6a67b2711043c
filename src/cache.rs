//! Fixed-capacity shared-secret cache.
//!
//! Entries live in one pre-allocated arena and are linked by index: a doubly
//! linked chain per hash bucket, plus a single singly linked list that is
//! either the free list or the insertion-ordered "used" list. Lookups never
//! reorder anything; once full, every insert evicts the oldest entry.

use tracing::debug;

pub const KEY_SIZE: usize = 32;
pub const VALUE_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache size: {buckets} buckets for {capacity} entries")]
    InvalidSize { buckets: usize, capacity: usize },
}

/// 缓存槽位句柄（arena 下标）/ Handle to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle(usize);

impl EntryHandle {
    #[cfg(test)]
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: [u8; KEY_SIZE],
    value: [u8; VALUE_SIZE],
    // bucket chain
    prev: Option<usize>,
    next: Option<usize>,
    // used list or free list, depending on where the entry currently sits
    next_in_list: Option<usize>,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: [0u8; KEY_SIZE],
            value: [0u8; VALUE_SIZE],
            prev: None,
            next: None,
            next_in_list: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub used: usize,
    pub capacity: usize,
    pub chain_lengths: Vec<usize>,
}

#[derive(Debug)]
pub struct SecretCache {
    buckets: Vec<Option<usize>>,
    entries: Vec<Entry>,
    free_head: Option<usize>,
    used_head: Option<usize>,
    used_tail: Option<usize>,
    used: usize,
}

/// djb 字符串哈希
#[inline]
fn hash_key(key: &[u8; KEY_SIZE]) -> u32 {
    key.iter()
        .fold(5381u32, |h, &b| (h << 5).wrapping_add(h).wrapping_add(b as u32))
}

impl SecretCache {
    /// Allocates every bucket and entry up front.
    pub fn new(bucket_count: usize, capacity: usize) -> Result<Self, CacheError> {
        if bucket_count < 1 || capacity < 1 || capacity < bucket_count {
            return Err(CacheError::InvalidSize {
                buckets: bucket_count,
                capacity,
            });
        }

        let mut entries = vec![Entry::empty(); capacity];
        for (idx, entry) in entries.iter_mut().enumerate() {
            entry.next_in_list = if idx + 1 < capacity { Some(idx + 1) } else { None };
        }

        debug!(
            target = "cache",
            buckets = bucket_count,
            capacity,
            bytes = capacity * std::mem::size_of::<Entry>()
                + bucket_count * std::mem::size_of::<Option<usize>>(),
            "shared secret cache allocated"
        );

        Ok(Self {
            buckets: vec![None; bucket_count],
            entries,
            free_head: Some(0),
            used_head: None,
            used_tail: None,
            used: 0,
        })
    }

    #[inline]
    fn bucket_of(&self, key: &[u8; KEY_SIZE]) -> usize {
        hash_key(key) as usize % self.buckets.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.used
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &[u8; KEY_SIZE]) -> Option<&[u8; VALUE_SIZE]> {
        if self.used == 0 {
            return None;
        }
        let mut cursor = self.buckets[self.bucket_of(key)];
        while let Some(idx) = cursor {
            let entry = &self.entries[idx];
            if entry.key == *key {
                return Some(&entry.value);
            }
            cursor = entry.next;
        }
        None
    }

    /// Stores `value` under `key`. Callers only insert after a missed `get`,
    /// so duplicate keys are not checked for; the newest one shadows older ones.
    /// A free slot is used while one exists, otherwise the oldest entry's.
    pub fn set(&mut self, key: &[u8; KEY_SIZE], value: &[u8; VALUE_SIZE]) -> Option<EntryHandle> {
        let idx = match self.take_free() {
            Some(idx) => idx,
            None => {
                debug!(target = "cache", "cache full, evicting oldest entry");
                self.evict_oldest()?
            }
        };

        let bucket = self.bucket_of(key);
        let old_head = self.buckets[bucket];
        {
            let entry = &mut self.entries[idx];
            entry.key = *key;
            entry.value = *value;
            entry.prev = None;
            entry.next = old_head;
            entry.next_in_list = None;
        }
        if let Some(head) = old_head {
            self.entries[head].prev = Some(idx);
        }
        self.buckets[bucket] = Some(idx);

        match self.used_tail {
            Some(tail) => self.entries[tail].next_in_list = Some(idx),
            None => self.used_head = Some(idx),
        }
        self.used_tail = Some(idx);

        Some(EntryHandle(idx))
    }

    fn take_free(&mut self) -> Option<usize> {
        let idx = self.free_head?;
        self.free_head = self.entries[idx].next_in_list;
        self.used += 1;
        Some(idx)
    }

    /// Detaches the oldest used entry from the used list and its bucket chain.
    fn evict_oldest(&mut self) -> Option<usize> {
        let idx = self.used_head?;
        self.used_head = self.entries[idx].next_in_list;
        if self.used_head.is_none() {
            self.used_tail = None;
        }

        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => {
                let bucket = self.bucket_of(&self.entries[idx].key);
                self.buckets[bucket] = next;
            }
        }
        if let Some(n) = next {
            self.entries[n].prev = prev;
        }
        Some(idx)
    }

    /// Returns every used entry to the free list in one pass.
    pub fn clear(&mut self) {
        let mut cursor = self.used_head;
        while let Some(idx) = cursor {
            let entry = &mut self.entries[idx];
            cursor = entry.next_in_list;
            entry.key = [0u8; KEY_SIZE];
            entry.value = [0u8; VALUE_SIZE];
            entry.prev = None;
            entry.next = None;
            entry.next_in_list = self.free_head;
            self.free_head = Some(idx);
        }
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.used_head = None;
        self.used_tail = None;
        self.used = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let chain_lengths = self
            .buckets
            .iter()
            .map(|head| {
                let mut len = 0;
                let mut cursor = *head;
                while let Some(idx) = cursor {
                    len += 1;
                    cursor = self.entries[idx].next;
                }
                len
            })
            .collect();
        CacheStats {
            used: self.used,
            capacity: self.entries.len(),
            chain_lengths,
        }
    }
}

/// Bucket count for a cache of `capacity` entries: one bucket per 25, within 5..=500.
pub fn bucket_count_for(capacity: usize) -> usize {
    (capacity / 25).clamp(5, 500)
}
