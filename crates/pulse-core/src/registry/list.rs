//! Arena-backed delta list with a hash index.
//!
//! Every node stores its time-to-live *relative to its predecessor* in expiry
//! order: for the node at position N, `delta(N) = ttl(N) - ttl(N - 1)` with
//! `ttl(-1) = 0`. Advancing time by one tick therefore only touches the head,
//! and expiring `k` entries costs O(k) regardless of list length.
//!
//! The list relies on every entry sharing one fixed `interval`: a node linked
//! now never expires before a node linked earlier, so appending at the tail
//! keeps the list sorted without a search.
//!
//! Nodes live in a slot arena addressed by `Handle`. Two indices point into
//! it, the hash map (key → handle) and the prev/next links, and every
//! mutation goes through `take`/`link_tail`/`unlink` so they never diverge.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

type Handle = usize;

struct Node<K, V> {
    key: K,
    value: V,
    /// Ticks between the predecessor's expiry and this node's expiry.
    delta: u32,
    prev: Option<Handle>,
    next: Option<Handle>,
}

pub(crate) struct DeltaList<K, V, S> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<Handle>,
    index: HashMap<K, Handle, S>,
    head: Option<Handle>,
    tail: Option<Handle>,
    /// Ticks until the tail expires, i.e. the sum of every delta.
    delta_sum: u32,
    interval: u32,
}

impl<K, V, S> DeltaList<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    pub(crate) fn new(interval: u32, buckets: usize, hasher: S) -> Self {
        debug_assert!(interval > 0);
        Self {
            slots: Vec::with_capacity(buckets),
            free: Vec::new(),
            index: HashMap::with_capacity_and_hasher(buckets, hasher),
            head: None,
            tail: None,
            delta_sum: 0,
            interval,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Link a new entry at the tail with a full TTL.
    /// Returns false, dropping `value`, if the key is already present.
    pub(crate) fn insert(&mut self, key: K, value: V) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        let handle = self.alloc(Node {
            key: key.clone(),
            value,
            delta: 0,
            prev: None,
            next: None,
        });
        self.index.insert(key, handle);
        self.link_tail(handle);
        true
    }

    /// Move an existing entry to the tail with a full TTL, or insert it.
    /// Returns true if the entry existed; its payload is kept and `value`
    /// is dropped.
    pub(crate) fn update(&mut self, key: K, value: V) -> bool {
        if self.touch(&key) {
            return true;
        }
        self.insert(key, value);
        false
    }

    /// Move an existing entry to the tail with a full TTL.
    pub(crate) fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.index.get(key).copied() {
            Some(handle) => {
                self.unlink(handle);
                self.link_tail(handle);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let handle = self.index.get(key).copied()?;
        Some(self.take(handle))
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let handle = self.index.get(key).copied()?;
        Some(&self.node(handle).value)
    }

    pub(crate) fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Absolute ticks remaining for an entry: the sum of deltas from the head
    /// up to and including it. O(position).
    pub(crate) fn ttl<Q>(&self, key: &Q) -> Option<u32>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let target = self.index.get(key).copied()?;
        let mut total = 0;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let node = self.node(handle);
            total += node.delta;
            if handle == target {
                return Some(total);
            }
            cursor = node.next;
        }
        None
    }

    /// Entries in expiry order, soonest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.node(cursor?);
            cursor = node.next;
            Some((&node.key, &node.value))
        })
    }

    /// Advance time by one tick and unlink every entry whose TTL reached
    /// zero, returned in expiry order.
    ///
    /// Only the head's delta and `delta_sum` change when nothing expires.
    pub(crate) fn tick(&mut self) -> Vec<(K, V)> {
        let Some(head) = self.head else {
            return Vec::new();
        };

        // The head always carries a non-zero delta between ticks: zero-delta
        // heads are expired below before the tick returns.
        debug_assert!(self.node(head).delta > 0);
        self.delta_sum -= 1;
        self.node_mut(head).delta -= 1;

        let mut expired = Vec::new();
        while let Some(handle) = self.head {
            if self.node(handle).delta != 0 {
                break;
            }
            expired.push(self.take(handle));
        }
        expired
    }

    /// Unlink every entry, returned in expiry order, and reclaim the arena.
    pub(crate) fn drain(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(handle) = self.head {
            drained.push(self.take(handle));
        }
        self.slots.clear();
        self.free.clear();
        drained
    }

    // ── Primitives ────────────────────────────────────────────────────────────

    fn alloc(&mut self, node: Node<K, V>) -> Handle {
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle] = Some(node);
                handle
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Remove a node from both indices and free its slot.
    fn take(&mut self, handle: Handle) -> (K, V) {
        self.unlink(handle);
        let node = self.slots[handle]
            .take()
            .expect("delta list handle points at a live node");
        self.index.remove(&node.key);
        self.free.push(handle);
        (node.key, node.value)
    }

    /// Append a node at the tail with a full `interval` TTL.
    ///
    /// Post: the node's absolute TTL is `interval` and `delta_sum == interval`.
    fn link_tail(&mut self, handle: Handle) {
        let delta = self.interval - self.delta_sum;
        let tail = self.tail;
        {
            let node = self.node_mut(handle);
            node.delta = delta;
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(t) => self.node_mut(t).next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.delta_sum = self.interval;
    }

    /// Remove a node from the expiry order only (the fold rule).
    ///
    /// Pre: `handle` is linked. Post: every remaining node keeps its absolute
    /// TTL. The successor absorbs the removed delta; removing the tail
    /// shrinks `delta_sum` instead.
    fn unlink(&mut self, handle: Handle) {
        let (prev, next, delta) = {
            let node = self.node(handle);
            (node.prev, node.next, node.delta)
        };
        match next {
            Some(n) => {
                let next_node = self.node_mut(n);
                next_node.delta += delta;
                next_node.prev = prev;
            }
            None => {
                self.delta_sum -= delta;
                self.tail = prev;
            }
        }
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
    }

    fn node(&self, handle: Handle) -> &Node<K, V> {
        self.slots[handle]
            .as_ref()
            .expect("delta list handle points at a live node")
    }

    fn node_mut(&mut self, handle: Handle) -> &mut Node<K, V> {
        self.slots[handle]
            .as_mut()
            .expect("delta list handle points at a live node")
    }
}
