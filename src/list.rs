//! Handle-based doubly linked list
//!
//! Records live in a generational arena and are threaded into one ordering by
//! slot index. Removal is O(1) given a handle, and a handle whose slot has
//! been freed (and possibly reused) is detected through its generation instead
//! of pointing at someone else's record.

use std::fmt;

/// Stable reference to an element of a [`List`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index (unique among live elements of one list)
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Node<T> {
    value: T,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Ordered collection addressed by [`Handle`]
pub struct List<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert at the head of the traversal order
    pub fn push_front(&mut self, value: T) -> Handle {
        let index = self.alloc(value);
        self.link_before(index, self.head);
        self.handle_at(index)
    }

    /// Insert at the tail of the traversal order
    pub fn push_back(&mut self, value: T) -> Handle {
        let index = self.alloc(value);
        self.link_before(index, None);
        self.handle_at(index)
    }

    /// Insert directly in front of `before`; appends when `before` is stale
    pub fn insert_before(&mut self, before: Handle, value: T) -> Handle {
        let anchor = self.live_index(before);
        let index = self.alloc(value);
        self.link_before(index, anchor);
        self.handle_at(index)
    }

    /// Unlink and return the element, `None` for a stale handle
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.live_index(handle)?;
        let slot = &mut self.slots[index as usize];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }

        self.free.push(index);
        self.len -= 1;
        Some(node.value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.live_index(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let index = self.live_index(handle)?;
        self.slots[index as usize].node.as_ref().map(|n| &n.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = self.live_index(handle)?;
        self.slots[index as usize].node.as_mut().map(|n| &mut n.value)
    }

    pub fn front(&self) -> Option<Handle> {
        self.head.map(|i| self.handle_at(i))
    }

    pub fn back(&self) -> Option<Handle> {
        self.tail.map(|i| self.handle_at(i))
    }

    /// Element following `handle` in traversal order
    pub fn next(&self, handle: Handle) -> Option<Handle> {
        let index = self.live_index(handle)?;
        self.node(index).next.map(|i| self.handle_at(i))
    }

    /// Element preceding `handle` in traversal order
    pub fn prev(&self, handle: Handle) -> Option<Handle> {
        let index = self.live_index(handle)?;
        self.node(index).prev.map(|i| self.handle_at(i))
    }

    /// Head-to-tail iteration
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
            reverse: false,
        }
    }

    /// Tail-to-head iteration
    pub fn iter_rev(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.tail,
            reverse: true,
        }
    }

    /// Snapshot of all handles, head to tail
    ///
    /// Walk the snapshot when the list may change underneath the walk and
    /// re-check each handle with [`List::contains`].
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }

    fn alloc(&mut self, value: T) -> u32 {
        let node = Node {
            value,
            prev: None,
            next: None,
        };
        self.len += 1;

        if let Some(index) = self.free.pop() {
            self.slots[index as usize].node = Some(node);
            return index;
        }

        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        (self.slots.len() - 1) as u32
    }

    fn link_before(&mut self, index: u32, anchor: Option<u32>) {
        let prev = match anchor {
            Some(a) => self.node(a).prev,
            None => self.tail,
        };

        {
            let node = self.node_mut(index);
            node.prev = prev;
            node.next = anchor;
        }

        match prev {
            Some(p) => self.node_mut(p).next = Some(index),
            None => self.head = Some(index),
        }
        match anchor {
            Some(a) => self.node_mut(a).prev = Some(index),
            None => self.tail = Some(index),
        }
    }

    fn live_index(&self, handle: Handle) -> Option<u32> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation == handle.generation && slot.node.is_some() {
            Some(handle.index)
        } else {
            None
        }
    }

    fn handle_at(&self, index: u32) -> Handle {
        Handle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    // Links only ever point at occupied slots.
    fn node(&self, index: u32) -> &Node<T> {
        match self.slots[index as usize].node.as_ref() {
            Some(node) => node,
            None => unreachable!("list link to vacant slot {}", index),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<T> {
        match self.slots[index as usize].node.as_mut() {
            Some(node) => node,
            None => unreachable!("list link to vacant slot {}", index),
        }
    }
}

/// Iterator over `(Handle, &T)` pairs
pub struct Iter<'a, T> {
    list: &'a List<T>,
    cursor: Option<u32>,
    reverse: bool,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.node(index);
        self.cursor = if self.reverse { node.prev } else { node.next };
        Some((self.list.handle_at(index), &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<T: Clone>(list: &List<T>) -> Vec<T> {
        list.iter().map(|(_, v)| v.clone()).collect()
    }

    #[test]
    fn test_push_front_and_back() {
        let mut list = List::new();
        list.push_back("b");
        list.push_front("a");
        list.push_back("c");
        assert_eq!(values(&list), vec!["a", "b", "c"]);
        assert_eq!(
            list.iter_rev().map(|(_, v)| *v).collect::<Vec<_>>(),
            vec!["c", "b", "a"]
        );
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut list = List::new();
        let a = list.push_back(1);
        let b = list.push_back(2);
        let c = list.push_back(3);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(values(&list), vec![1, 3]);
        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert!(list.front().is_none());
        assert!(list.back().is_none());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut list = List::new();
        let old = list.push_back("old");
        list.remove(old);
        let new = list.push_back("new");

        assert_eq!(old.index(), new.index());
        assert!(!list.contains(old));
        assert!(list.get(old).is_none());
        assert_eq!(list.remove(old), None);
        assert_eq!(list.get(new), Some(&"new"));
    }

    #[test]
    fn test_insert_before() {
        let mut list = List::new();
        let a = list.push_back('a');
        let c = list.push_back('c');
        list.insert_before(c, 'b');
        list.insert_before(a, '0');
        assert_eq!(values(&list), vec!['0', 'a', 'b', 'c']);

        list.remove(c);
        list.insert_before(c, 'z');
        assert_eq!(values(&list), vec!['0', 'a', 'b', 'z']);
    }

    #[test]
    fn test_next_prev_navigation() {
        let mut list = List::new();
        let a = list.push_back(10);
        let b = list.push_back(20);
        assert_eq!(list.next(a), Some(b));
        assert_eq!(list.prev(b), Some(a));
        assert_eq!(list.next(b), None);
    }

    #[test]
    fn test_handles_snapshot_survives_removal() {
        let mut list = List::new();
        for i in 0..4 {
            list.push_back(i);
        }
        let snapshot = list.handles();
        list.remove(snapshot[1]);

        let seen: Vec<i32> = snapshot
            .iter()
            .filter_map(|h| list.get(*h).copied())
            .collect();
        assert_eq!(seen, vec![0, 2, 3]);
    }
}
