//! Least-recently-used ordering.
//!
//! `LruList<K>` keeps a set of keys ordered by recency of use. It backs every
//! eviction decision in the core: the block cache's disposable pages, the
//! swap area's clean swapped-in slots, and the VM's resident logical pages.
//! Unlike a full cache it stores no values and never evicts on its own;
//! each subsystem decides when to [`pop_least`] and what that means.
//!
//! Links are kept as explicit predecessor/successor keys inside a `BTreeMap`,
//! so membership in an `LruList` never entangles the ownership of the
//! element it orders.
//!
//! [`pop_least`]: LruList::pop_least

use std::collections::BTreeMap;

struct Node<K: Clone> {
    prev: Option<K>,
    next: Option<K>,
}

/// A set of keys ordered from least to most recently used.
pub struct LruList<K: Ord + Clone> {
    nodes: BTreeMap<K, Node<K>>,

    // Recency chain: `least` is the eviction candidate, `most` the latest use.
    least: Option<K>,
    most: Option<K>,
}

impl<K: Ord + Clone> Default for LruList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> LruList<K> {
    /// Makes a new, empty `LruList`.
    ///
    /// Does not allocate anything on its own.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            least: None,
            most: None,
        }
    }

    // Append the key at the most-recently-used end.
    fn attach(&mut self, k: K) {
        if let Some(most) = self.most.take() {
            self.nodes.get_mut(&most).unwrap().next = Some(k.clone());
            self.most = Some(most);
        } else {
            self.least = Some(k.clone());
        }
        let prev = self.most.clone();
        self.most = Some(k.clone());
        let node = self.nodes.get_mut(&k).unwrap();
        node.prev = prev;
        node.next = None;
    }

    // Unlink the key's neighbors from each other.
    fn detach(&mut self, prev: Option<K>, next: Option<K>) {
        if let Some(next) = next.as_ref() {
            self.nodes.get_mut(next).unwrap().prev = prev.clone();
        } else {
            self.most = prev.clone();
        }

        if let Some(prev) = prev {
            self.nodes.get_mut(&prev).unwrap().next = next;
        } else {
            self.least = next;
        }
    }

    /// Marks `k` as just used, inserting it if it is not a member.
    pub fn touch(&mut self, k: K) {
        if let Some(node) = self.nodes.get_mut(&k) {
            let (prev, next) = (node.prev.take(), node.next.take());
            self.detach(prev, next);
        } else {
            self.nodes.insert(
                k.clone(),
                Node {
                    prev: None,
                    next: None,
                },
            );
        }
        self.attach(k);
    }

    /// Removes `k` from the list, returning whether it was a member.
    pub fn remove(&mut self, k: &K) -> bool {
        match self.nodes.remove(k) {
            Some(mut node) => {
                self.detach(node.prev.take(), node.next.take());
                true
            }
            None => false,
        }
    }

    /// Returns the least recently used key without removing it.
    pub fn peek_least(&self) -> Option<&K> {
        self.least.as_ref()
    }

    /// Removes and returns the least recently used key.
    pub fn pop_least(&mut self) -> Option<K> {
        let least = self.least.clone()?;
        self.remove(&least);
        Some(least)
    }

    /// Returns whether `k` is a member of the list.
    pub fn contains(&self, k: &K) -> bool {
        self.nodes.contains_key(k)
    }

    /// Number of keys in the list.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether the list holds no keys.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_follows_use_order() {
        let mut lru = LruList::new();
        lru.touch(1);
        lru.touch(2);
        lru.touch(3);
        assert_eq!(lru.peek_least(), Some(&1));

        // Reusing 1 makes 2 the eviction candidate.
        lru.touch(1);
        assert_eq!(lru.pop_least(), Some(2));
        assert_eq!(lru.pop_least(), Some(3));
        assert_eq!(lru.pop_least(), Some(1));
        assert_eq!(lru.pop_least(), None);
        assert!(lru.is_empty());
    }

    #[test]
    fn remove_unlinks_interior_keys() {
        let mut lru = LruList::new();
        for k in 0..5 {
            lru.touch(k);
        }
        assert!(lru.remove(&2));
        assert!(!lru.remove(&2));
        assert_eq!(lru.len(), 4);

        let drained: Vec<_> = std::iter::from_fn(|| lru.pop_least()).collect();
        assert_eq!(drained, vec![0, 1, 3, 4]);
    }

    #[test]
    fn touch_is_idempotent_on_singleton() {
        let mut lru = LruList::new();
        lru.touch("a");
        lru.touch("a");
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.pop_least(), Some("a"));
        assert!(lru.peek_least().is_none());
    }
}
