//! Probabilistic ordered map keyed by `u64`.
//!
//! Nodes live in an arena and link to each other by slot index. Callers hold
//! [`NodeId`] handles; a handle carries the slot generation, so once its node
//! is deleted every accessor on that handle returns `None`.

use std::ops::ControlFlow;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Upper bound on tower height.
pub const MAX_LEVEL: usize = 32;

/// Default probability of promoting a node one more level.
pub const DEFAULT_P: f64 = 1.0 / 3.0;

/// Handle to a node of a [`SkipList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    generation: u64,
}

struct Node<V> {
    key: u64,
    value: V,
    forward: Vec<Option<usize>>,
    backward: Option<usize>,
}

struct Slot<V> {
    generation: u64,
    node: Option<Node<V>>,
}

/// Skiplist ordered by key, ascending.
pub struct SkipList<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    head: Vec<Option<usize>>,
    tail: Option<usize>,
    len: usize,
    p: f64,
    rng: StdRng,
}

impl<V> Default for SkipList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SkipList<V> {
    /// Empty list with `p = 1/3`, seeded from the wall clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::with_seed(DEFAULT_P, seed)
    }

    /// Empty list with an explicit promotion probability and seed.
    ///
    /// `p` is clamped into `[0, 1)`.
    pub fn with_seed(p: f64, seed: u64) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: vec![None],
            tail: None,
            len: 0,
            p: p.clamp(0.0, 0.999),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current height of the head tower.
    pub fn level(&self) -> usize {
        self.head.len()
    }

    /// Insert `key`. If it is already present the existing node is returned
    /// with `false` and `value` is dropped.
    pub fn insert(&mut self, key: u64, value: V) -> (NodeId, bool) {
        let mut update = self.predecessors(key);
        if let Some(idx) = self.forward(update[0], 0) {
            if self.node(idx).key == key {
                return (self.handle(idx), false);
            }
        }

        let level = self.random_level();
        if level > self.head.len() {
            update.resize(level, None);
            self.head.resize(level, None);
        }

        let forward = (0..level).map(|i| self.forward(update[i], i)).collect();
        let idx = self.alloc(Node {
            key,
            value,
            forward,
            backward: update[0],
        });
        for (i, pred) in update.iter().enumerate().take(level) {
            self.set_forward(*pred, i, Some(idx));
        }
        match self.node(idx).forward[0] {
            Some(next) => self.node_mut(next).backward = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
        (self.handle(idx), true)
    }

    /// Remove `key`, returning its entry.
    pub fn delete(&mut self, key: u64) -> Option<(u64, V)> {
        let update = self.predecessors(key);
        let idx = self.forward(update[0], 0)?;
        if self.node(idx).key != key {
            return None;
        }

        let height = self.node(idx).forward.len();
        for (i, pred) in update.iter().enumerate().take(height) {
            if self.forward(*pred, i) == Some(idx) {
                let next = self.node(idx).forward[i];
                self.set_forward(*pred, i, next);
            }
        }
        let (next, prev) = {
            let node = self.node(idx);
            (node.forward[0], node.backward)
        };
        match next {
            Some(n) => self.node_mut(n).backward = prev,
            None => self.tail = prev,
        }
        while self.head.len() > 1 && self.head.last() == Some(&None) {
            self.head.pop();
        }

        self.len -= 1;
        let slot = &mut self.slots[idx];
        slot.generation += 1;
        let node = slot.node.take()?;
        self.free.push(idx);
        Some((node.key, node.value))
    }

    /// Node holding exactly `key`.
    pub fn search(&self, key: u64) -> Option<NodeId> {
        self.lower_bound(key)
            .filter(|&idx| self.node(idx).key == key)
            .map(|idx| self.handle(idx))
    }

    /// Value stored under `key`.
    pub fn get(&self, key: u64) -> Option<&V> {
        self.search(key).and_then(|id| self.value(id))
    }

    /// Smallest node.
    pub fn first(&self) -> Option<NodeId> {
        self.head[0].map(|idx| self.handle(idx))
    }

    /// Largest node.
    pub fn last(&self) -> Option<NodeId> {
        self.tail.map(|idx| self.handle(idx))
    }

    /// First node whose key is `>= key`.
    pub fn seek(&self, key: u64) -> Option<NodeId> {
        self.lower_bound(key).map(|idx| self.handle(idx))
    }

    /// Visit nodes with key `>= from` in ascending order until the visitor
    /// breaks. Returns how many nodes were visited.
    pub fn iterate<F>(&self, from: u64, mut visitor: F) -> usize
    where
        F: FnMut(u64, &V) -> ControlFlow<()>,
    {
        let mut visited = 0;
        let mut cursor = self.lower_bound(from);
        while let Some(idx) = cursor {
            let node = self.node(idx);
            visited += 1;
            if visitor(node.key, &node.value).is_break() {
                break;
            }
            cursor = node.forward[0];
        }
        visited
    }

    pub fn key(&self, id: NodeId) -> Option<u64> {
        self.live(id).map(|n| n.key)
    }

    pub fn value(&self, id: NodeId) -> Option<&V> {
        self.live(id).map(|n| &n.value)
    }

    /// Replace the value of a live node; returns the previous value.
    pub fn set(&mut self, id: NodeId, value: V) -> Option<V> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node
            .as_mut()
            .map(|n| std::mem::replace(&mut n.value, value))
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.live(id)
            .and_then(|n| n.forward[0])
            .map(|idx| self.handle(idx))
    }

    pub fn previous(&self, id: NodeId) -> Option<NodeId> {
        self.live(id)
            .and_then(|n| n.backward)
            .map(|idx| self.handle(idx))
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::with_capacity(self.len);
        self.iterate(0, |k, _| {
            keys.push(k);
            ControlFlow::Continue(())
        });
        keys
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < self.p {
            level += 1;
        }
        level
    }

    /// Rightmost node strictly below `key` at every level; `None` is the head.
    fn predecessors(&self, key: u64) -> Vec<Option<usize>> {
        let mut update = vec![None; self.head.len()];
        let mut x: Option<usize> = None;
        for i in (0..self.head.len()).rev() {
            while let Some(next) = self.forward(x, i) {
                if self.node(next).key < key {
                    x = Some(next);
                } else {
                    break;
                }
            }
            update[i] = x;
        }
        update
    }

    fn lower_bound(&self, key: u64) -> Option<usize> {
        let update = self.predecessors(key);
        self.forward(update[0], 0)
    }

    fn forward(&self, at: Option<usize>, level: usize) -> Option<usize> {
        match at {
            None => self.head.get(level).copied().flatten(),
            Some(idx) => self.node(idx).forward.get(level).copied().flatten(),
        }
    }

    fn set_forward(&mut self, at: Option<usize>, level: usize, to: Option<usize>) {
        match at {
            None => self.head[level] = to,
            Some(idx) => self.node_mut(idx).forward[level] = to,
        }
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx].node = Some(node);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        }
    }

    fn handle(&self, index: usize) -> NodeId {
        NodeId {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn live(&self, id: NodeId) -> Option<&Node<V>> {
        self.slots
            .get(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    // Linked indexes always point at occupied slots.
    fn node(&self, idx: usize) -> &Node<V> {
        match self.slots[idx].node.as_ref() {
            Some(n) => n,
            None => unreachable!("skiplist link to vacant slot {}", idx),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        match self.slots[idx].node.as_mut() {
            Some(n) => n,
            None => unreachable!("skiplist link to vacant slot {}", idx),
        }
    }
}

impl<V> std::fmt::Debug for SkipList<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("len", &self.len)
            .field("level", &self.head.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> SkipList<&'static str> {
        SkipList::with_seed(DEFAULT_P, 7)
    }

    #[test]
    fn test_insert_and_search() {
        let mut sl = list();
        let (a, inserted) = sl.insert(10, "ten");
        assert!(inserted);
        sl.insert(5, "five");
        sl.insert(20, "twenty");

        let (again, inserted) = sl.insert(10, "other");
        assert!(!inserted);
        assert_eq!(again, a);
        assert_eq!(sl.get(10), Some(&"ten"));
        assert_eq!(sl.len(), 3);
        assert!(sl.search(11).is_none());
    }

    #[test]
    fn test_first_last_and_navigation() {
        let mut sl = list();
        for k in [30, 10, 20] {
            sl.insert(k, "");
        }
        let first = sl.first().unwrap();
        let last = sl.last().unwrap();
        assert_eq!(sl.key(first), Some(10));
        assert_eq!(sl.key(last), Some(30));

        let mid = sl.next(first).unwrap();
        assert_eq!(sl.key(mid), Some(20));
        assert_eq!(sl.previous(mid), Some(first));
        assert!(sl.previous(first).is_none());
        assert!(sl.next(last).is_none());
    }

    #[test]
    fn test_delete_invalidates_handle() {
        let mut sl = list();
        sl.insert(1, "a");
        let (b, _) = sl.insert(2, "b");
        sl.insert(3, "c");

        assert_eq!(sl.delete(2), Some((2, "b")));
        assert_eq!(sl.delete(2), None);
        assert!(sl.key(b).is_none());
        assert!(sl.next(b).is_none());
        assert!(sl.previous(b).is_none());
        assert!(sl.set(b, "z").is_none());

        // The slot is reused, but the stale handle stays dead.
        let (d, _) = sl.insert(4, "d");
        assert_ne!(d, b);
        assert!(sl.value(b).is_none());
        assert_eq!(sl.keys(), vec![1, 3, 4]);
    }

    #[test]
    fn test_delete_tail_updates_last() {
        let mut sl = list();
        sl.insert(1, "a");
        sl.insert(2, "b");
        sl.delete(2);
        assert_eq!(sl.key(sl.last().unwrap()), Some(1));
        sl.delete(1);
        assert!(sl.first().is_none());
        assert!(sl.last().is_none());
        assert_eq!(sl.level(), 1);
    }

    #[test]
    fn test_iterate_from_and_stop() {
        let mut sl = list();
        for k in 0..10u64 {
            sl.insert(k * 10, "");
        }

        let mut seen = Vec::new();
        let visited = sl.iterate(35, |k, _| {
            seen.push(k);
            if k >= 60 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(seen, vec![40, 50, 60]);
        assert_eq!(visited, 3);
        assert_eq!(sl.iterate(1000, |_, _| ControlFlow::Continue(())), 0);
    }

    #[test]
    fn test_set_replaces_value() {
        let mut sl = list();
        let (id, _) = sl.insert(1, "a");
        assert_eq!(sl.set(id, "b"), Some("a"));
        assert_eq!(sl.value(id), Some(&"b"));
    }

    #[test]
    fn test_head_grows_and_shrinks() {
        let mut sl: SkipList<()> = SkipList::with_seed(0.9, 1);
        for k in 0..64 {
            sl.insert(k, ());
        }
        assert!(sl.level() > 1);
        for k in 0..64 {
            assert!(sl.delete(k).is_some());
        }
        assert_eq!(sl.level(), 1);
        assert!(sl.is_empty());
    }

    #[test]
    fn test_many_keys_stay_sorted() {
        let mut sl = SkipList::with_seed(DEFAULT_P, 99);
        let mut rng = StdRng::seed_from_u64(3);
        let mut expected = std::collections::BTreeSet::new();
        for _ in 0..2000 {
            let k: u64 = rng.gen_range(0..500);
            if rng.gen_bool(0.3) {
                assert_eq!(sl.delete(k).is_some(), expected.remove(&k));
            } else {
                assert_eq!(sl.insert(k, ()).1, expected.insert(k));
            }
        }
        assert_eq!(sl.keys(), expected.iter().copied().collect::<Vec<_>>());
        assert_eq!(sl.len(), expected.len());
    }
}
