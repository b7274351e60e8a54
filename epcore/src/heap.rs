//! Binary min-heap keyed by a 64-bit scan index, with an `id -> position`
//! side array so a caller-chosen id can be deleted or re-keyed in
//! `O(log n)` without a linear scan. Direct port of `bheap.c`'s array-backed
//! heap (Shane Saunders' Dijkstra frontier-set heap) onto scan indices
//! instead of graph distances.

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug)]
struct Item {
    id: usize,
    key: u64,
}

/// Fixed-capacity binary min-heap. No allocation after construction.
pub struct BinaryHeap {
    items: Vec<Item>,
    /// `pos[id]` is the index of `id` in `items`, or `usize::MAX` if absent.
    pos: Vec<usize>,
    max_size: usize,
}

const ABSENT: usize = usize::MAX;

impl BinaryHeap {
    pub fn alloc(capacity: usize) -> Self {
        BinaryHeap {
            items: Vec::with_capacity(capacity),
            pos: vec![ABSENT; capacity],
            max_size: capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        id < self.pos.len() && self.pos[id] != ABSENT
    }

    /// Returns the id with the minimum key, without removing it.
    pub fn min(&self) -> Option<usize> {
        self.items.first().map(|it| it.id)
    }

    pub fn min_key(&self) -> Option<u64> {
        self.items.first().map(|it| it.key)
    }

    pub fn insert(&mut self, id: usize, key: u64) -> Result<()> {
        if self.items.len() >= self.max_size {
            return Err(Error::NoSpace);
        }
        if id >= self.pos.len() {
            return Err(Error::InvalidArgument(format!(
                "heap id {} out of range (max {})",
                id,
                self.pos.len()
            )));
        }
        let idx = self.items.len();
        self.items.push(Item { id, key });
        self.pos[id] = idx;
        self.sift_up(idx);
        Ok(())
    }

    /// Removes `id` wherever it sits in the heap.
    pub fn delete(&mut self, id: usize) {
        let Some(&idx) = self.pos.get(id).filter(|&&p| p != ABSENT) else {
            return;
        };
        let last = self.items.len() - 1;
        if idx == last {
            self.items.pop();
            self.pos[id] = ABSENT;
            return;
        }
        self.items.swap(idx, last);
        let moved_id = self.items[idx].id;
        self.pos[moved_id] = idx;
        self.items.pop();
        self.pos[id] = ABSENT;
        // the element now at `idx` may need to move either way.
        if idx < self.items.len() {
            let parent_key = self.parent_key(idx);
            if parent_key.map_or(false, |pk| self.items[idx].key < pk) {
                self.sift_up(idx);
            } else {
                self.sift_down(idx);
            }
        }
    }

    /// Decreases `id`'s key and sifts it toward the root accordingly.
    pub fn decrease_key(&mut self, id: usize, new_key: u64) {
        let Some(&idx) = self.pos.get(id).filter(|&&p| p != ABSENT) else {
            return;
        };
        self.items[idx].key = new_key;
        self.sift_up(idx);
    }

    fn parent_key(&self, idx: usize) -> Option<u64> {
        if idx == 0 {
            None
        } else {
            Some(self.items[(idx - 1) / 2].key)
        }
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.items[idx].key < self.items[parent].key {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let n = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < n && self.items[left].key < self.items[smallest].key {
                smallest = left;
            }
            if right < n && self.items[right].key < self.items[smallest].key {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.pos[self.items[a].id] = a;
        self.pos[self.items[b].id] = b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_min_order_is_nondecreasing() {
        let mut h = BinaryHeap::alloc(8);
        for (id, key) in [(0u64, 5u64), (1, 1), (2, 9), (3, 3), (4, 3)] {
            h.insert(id as usize, key).unwrap();
        }
        let mut out = Vec::new();
        while let Some(id) = h.min() {
            out.push(h.min_key().unwrap());
            h.delete(id);
        }
        let mut sorted = out.clone();
        sorted.sort();
        assert_eq!(out, sorted);
    }

    #[test]
    fn decrease_key_moves_item_toward_root() {
        let mut h = BinaryHeap::alloc(4);
        h.insert(0, 10).unwrap();
        h.insert(1, 20).unwrap();
        h.insert(2, 30).unwrap();
        assert_eq!(h.min(), Some(0));
        h.decrease_key(2, 1);
        assert_eq!(h.min(), Some(2));
    }

    #[test]
    fn delete_by_id_from_middle() {
        let mut h = BinaryHeap::alloc(4);
        h.insert(0, 1).unwrap();
        h.insert(1, 2).unwrap();
        h.insert(2, 3).unwrap();
        h.delete(1);
        assert!(!h.contains(1));
        assert_eq!(h.len(), 2);
        assert_eq!(h.min(), Some(0));
    }

    #[test]
    fn insert_beyond_capacity_fails() {
        let mut h = BinaryHeap::alloc(1);
        h.insert(0, 1).unwrap();
        assert_eq!(h.insert(1, 2), Err(Error::NoSpace));
    }

    #[test]
    fn duplicate_keys_are_permitted() {
        let mut h = BinaryHeap::alloc(4);
        h.insert(0, 5).unwrap();
        h.insert(1, 5).unwrap();
        assert_eq!(h.len(), 2);
    }
}
