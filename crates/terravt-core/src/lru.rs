//! LRU Cache
//!
//! Least-recently-used map backed by a doubly linked list stored in an
//! index-linked arena. Lookups go through an `AHashMap` from key to arena
//! index and released nodes go to a free list, so every operation is O(1)
//! and the arena never shrinks or reallocates once warm.

use std::hash::Hash;

use ahash::AHashMap;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

/// Fixed-capacity LRU map
#[derive(Debug)]
pub struct LruCache<K, V> {
    payloads: Vec<Option<(K, V)>>,
    links: Vec<Link>,
    free: Vec<usize>,
    index: AHashMap<K, usize>,
    /// Most recently used
    head: usize,
    /// Least recently used
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create an empty cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            payloads: Vec::with_capacity(capacity),
            links: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: AHashMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up without changing recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.payloads[idx].as_ref().map(|(_, v)| v)
    }

    /// Mark `key` as most recently used and return its value on a hit
    pub fn touch(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        if idx != self.head {
            self.detach(idx);
            self.attach_front(idx);
        }
        self.payloads[idx].as_ref().map(|(_, v)| v)
    }

    /// Insert `key` as most recently used
    ///
    /// Returns `false` without modifying the cache if the key is already
    /// present or the cache is full.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.is_full() || self.index.contains_key(&key) {
            return false;
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                self.payloads[idx] = Some((key.clone(), value));
                idx
            }
            None => {
                self.payloads.push(Some((key.clone(), value)));
                self.links.push(Link { prev: NIL, next: NIL });
                self.payloads.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.attach_front(idx);
        true
    }

    /// Least recently used entry without removing it
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        if self.tail == NIL {
            return None;
        }
        self.payloads[self.tail].as_ref().map(|(k, v)| (k, v))
    }

    /// Remove and return the least recently used entry
    pub fn remove_last(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        self.release(self.tail)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.release(idx).map(|(_, v)| v)
    }

    /// Iterate from most to least recently used
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cache: self,
            cursor: self.head,
        }
    }

    fn detach(&mut self, idx: usize) {
        let Link { prev, next } = self.links[idx];
        if prev != NIL {
            self.links[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.links[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn attach_front(&mut self, idx: usize) {
        self.links[idx] = Link {
            prev: NIL,
            next: self.head,
        };
        if self.head != NIL {
            self.links[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn release(&mut self, idx: usize) -> Option<(K, V)> {
        let (key, value) = self.payloads[idx].take()?;
        self.detach(idx);
        self.index.remove(&key);
        self.free.push(idx);
        Some((key, value))
    }
}

/// Recency-ordered iterator over an [`LruCache`]
pub struct Iter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let idx = self.cursor;
        self.cursor = self.cache.links[idx].next;
        self.cache.payloads[idx].as_ref().map(|(k, v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LruKey;
    use std::collections::VecDeque;

    fn keys(cache: &LruCache<u32, u32>) -> Vec<u32> {
        cache.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_touch_moves_to_front() {
        let mut cache = LruCache::new(4);
        for k in 0..4 {
            assert!(cache.insert(k, k * 10));
        }
        assert_eq!(keys(&cache), vec![3, 2, 1, 0]);

        assert_eq!(cache.touch(&1), Some(&10));
        assert_eq!(keys(&cache), vec![1, 3, 2, 0]);
        assert_eq!(cache.touch(&7), None);
        assert_eq!(cache.peek_lru(), Some((&0, &0)));
    }

    #[test]
    fn test_insert_rejects_duplicates_and_overflow() {
        let mut cache = LruCache::new(2);
        assert!(cache.insert(1, 'a'));
        assert!(!cache.insert(1, 'b'));
        assert_eq!(cache.peek(&1), Some(&'a'));
        assert!(cache.insert(2, 'b'));
        assert!(!cache.insert(3, 'c'));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&3));
    }

    #[test]
    fn test_remove_last_then_insert_reuses_node() {
        let mut cache = LruCache::new(3);
        for k in 0..3 {
            cache.insert(k, k);
        }
        cache.touch(&0);

        let (evicted_key, slot) = cache.remove_last().unwrap();
        assert_eq!((evicted_key, slot), (1, 1));
        assert!(cache.insert(42, slot));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.payloads.len(), 3);
        assert_eq!(keys(&cache), vec![42, 0, 2]);
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_matches_reference_model() {
        const CAPACITY: usize = 8;
        let mut cache = LruCache::new(CAPACITY);
        let mut model: VecDeque<(u32, u32)> = VecDeque::new();
        let mut state = 0x1234_5678u32;

        for step in 0..2000u32 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let key = state % 16;
            let position = model.iter().position(|e| e.0 == key);

            match state % 5 {
                0 => {
                    let expected = position.and_then(|i| model.remove(i)).map(|e| e.1);
                    assert_eq!(cache.remove(&key), expected);
                }
                1 => {
                    assert_eq!(cache.remove_last(), model.pop_back());
                }
                2 => {
                    let expected = position.and_then(|i| model.remove(i)).map(|e| {
                        model.push_front(e);
                        e.1
                    });
                    assert_eq!(cache.touch(&key).copied(), expected);
                }
                _ => {
                    let accepted = position.is_none() && model.len() < CAPACITY;
                    if accepted {
                        model.push_front((key, step));
                    }
                    assert_eq!(cache.insert(key, step), accepted);
                }
            }

            assert!(cache.len() <= CAPACITY);
            let cached: Vec<(u32, u32)> = cache.iter().map(|(k, v)| (*k, *v)).collect();
            let expected: Vec<(u32, u32)> = model.iter().copied().collect();
            assert_eq!(cached, expected);
        }
    }

    #[test]
    fn test_placeholders_evicted_before_real_pages() {
        const CAPACITY: u16 = 6;
        let mut cache = LruCache::new(CAPACITY as usize);
        for slot in 0..CAPACITY {
            cache.insert(LruKey::placeholder(slot as u32), slot);
        }

        // Each new page evicts exactly one placeholder, in slot order
        for page in 0..CAPACITY {
            let (evicted, slot) = cache.remove_last().unwrap();
            assert!(evicted.is_placeholder());
            assert_eq!(evicted, LruKey::placeholder(page as u32));
            assert_eq!(slot, page);
            assert!(cache.insert(LruKey((page as u64 + 1) << 32), slot));
        }

        assert!(cache.iter().all(|(k, _)| !k.is_placeholder()));
        let (first_real, _) = cache.remove_last().unwrap();
        assert_eq!(first_real, LruKey(1 << 32));
    }
}
