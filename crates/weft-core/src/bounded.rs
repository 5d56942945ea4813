//! Bounded containers - 容量上限付きのコレクション
//!
//! Task Store, Agent Registry, Message Bus はすべてプロセス内メモリに状態を持つため、
//! 長時間稼働してもメモリが増え続けないよう、上限と退避ポリシーを型で表現します。
//!
//! - [`BoundedMap`]: 挿入順を保持する map。上限超過時は最古のエントリを退避
//! - [`BoundedDeque`]: 固定長の FIFO。上限超過時は先頭（最古）を破棄

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Slot<V> {
    seq: u64,
    value: V,
}

/// Insertion-ordered map with a hard capacity and oldest-first eviction.
///
/// Replacing the value of an existing key refreshes its position, so the key
/// becomes the newest entry.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Insert (or replace) a value, evicting the oldest entries if the map
    /// would exceed its capacity. Returns the evicted entries, oldest first.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.seq);
        } else {
            while !self.entries.is_empty() && self.entries.len() >= self.capacity {
                match self.pop_oldest() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }
        self.push_slot(key, value);
        evicted
    }

    /// Insert without evicting. A new key is rejected when the map is full and
    /// the value is handed back.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<Option<V>, V> {
        if !self.entries.contains_key(&key) && self.is_full() {
            return Err(value);
        }
        let previous = self.entries.remove(&key).map(|old| {
            self.order.remove(&old.seq);
            old.value
        });
        self.push_slot(key, value);
        Ok(previous)
    }

    fn push_slot(&mut self, key: K, value: V) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, Slot { seq, value });
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.value)
    }

    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.value))
    }

    /// Evict oldest entries until the map is within its capacity again.
    pub fn enforce_capacity(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.pop_oldest() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    /// Iterate in insertion order (oldest first).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.values().filter_map(move |key| {
            self.entries
                .get_key_value(key)
                .map(|(key, slot)| (key, &slot.value))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut().map(|slot| &mut slot.value)
    }

    /// Keep only the entries for which `keep` returns true. Returns the removed
    /// entries in insertion order.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .iter()
            .filter(|(key, value)| !keep(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Fixed-capacity FIFO. Pushing onto a full deque drops the oldest element.
#[derive(Debug, Clone)]
pub struct BoundedDeque<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedDeque<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Append at the tail. Returns the dropped head when the deque was full.
    pub fn push_back(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let dropped = if self.is_full() {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    /// Put an element back at the head. When full, the tail is dropped instead
    /// so the returning element keeps its turn.
    pub fn push_front(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let dropped = if self.is_full() {
            self.items.pop_back()
        } else {
            None
        };
        self.items.push_front(item);
        dropped
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.items.len();
        self.items.retain(keep);
        before - self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: PartialEq> BoundedDeque<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Remove every occurrence of `item`; returns how many were removed.
    pub fn remove_all(&mut self, item: &T) -> usize {
        self.retain(|existing| existing != item)
    }
}
