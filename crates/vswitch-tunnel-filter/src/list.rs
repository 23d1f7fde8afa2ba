//! Intrusive circular doubly-linked lists over an arena
//!
//! Every linked collection in this layer is built on this primitive. Nodes
//! live in a [`ListArena`] and are addressed by copyable [`NodeId`] handles
//! instead of raw pointers, so membership costs no per-operation allocation
//! and relinking can never leave a dangling address behind.
//!
//! A list head is an ordinary node with no payload (a sentinel); an empty
//! list is a sentinel linked to itself. Every node is either solitary
//! (self-linked) or a member of exactly one circular ring.
//!
//! Operations are not internally synchronized; callers hold whatever lock
//! protects the arena.

/// Handle to a node in a [`ListArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline(always)]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Freed slots get poison links so stale handles trip the debug checks
/// instead of silently corrupting a ring.
const POISON: u32 = u32::MAX;

struct Node<T> {
    prev: u32,
    next: u32,
    item: Option<T>,
}

/// Arena owning the nodes of any number of circular lists
pub struct ListArena<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
}

impl<T> Default for ListArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListArena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc_slot(&mut self, item: Option<T>) -> NodeId {
        let id = match self.free.pop() {
            Some(idx) => {
                let node = &mut self.nodes[idx as usize];
                node.item = item;
                node.prev = idx;
                node.next = idx;
                idx
            }
            None => {
                let idx = self.nodes.len() as u32;
                self.nodes.push(Node {
                    prev: idx,
                    next: idx,
                    item,
                });
                idx
            }
        };
        NodeId(id)
    }

    /// Allocate a sentinel node: an empty list
    pub fn new_list(&mut self) -> NodeId {
        self.alloc_slot(None)
    }

    /// Allocate a solitary payload node, not yet a member of any list
    pub fn alloc(&mut self, item: T) -> NodeId {
        self.alloc_slot(Some(item))
    }

    /// Release a node and return its payload.
    ///
    /// Precondition: the node is solitary (remove it first). Violations are
    /// caught by a debug assertion rather than corrupting its former ring.
    pub fn free(&mut self, node: NodeId) -> Option<T> {
        debug_assert!(
            self.is_solitary(node),
            "freeing a node that is still linked"
        );
        let slot = &mut self.nodes[node.index()];
        slot.prev = POISON;
        slot.next = POISON;
        let item = slot.item.take();
        self.free.push(node.0);
        item
    }

    /// Payload access; `None` for sentinels
    #[inline]
    pub fn get(&self, node: NodeId) -> Option<&T> {
        self.nodes[node.index()].item.as_ref()
    }

    /// Mutable payload access; `None` for sentinels
    #[inline]
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut T> {
        self.nodes[node.index()].item.as_mut()
    }

    /// Successor of `node` in its ring
    #[inline]
    pub fn next(&self, node: NodeId) -> NodeId {
        let n = self.nodes[node.index()].next;
        debug_assert_ne!(n, POISON, "link through a freed node");
        NodeId(n)
    }

    /// Predecessor of `node` in its ring
    #[inline]
    pub fn prev(&self, node: NodeId) -> NodeId {
        let p = self.nodes[node.index()].prev;
        debug_assert_ne!(p, POISON, "link through a freed node");
        NodeId(p)
    }

    #[inline]
    fn set_next(&mut self, node: NodeId, next: NodeId) {
        self.nodes[node.index()].next = next.0;
    }

    #[inline]
    fn set_prev(&mut self, node: NodeId, prev: NodeId) {
        self.nodes[node.index()].prev = prev.0;
    }

    #[inline]
    fn is_solitary(&self, node: NodeId) -> bool {
        let n = &self.nodes[node.index()];
        n.prev == node.0 && n.next == node.0
    }

    /// Insert `node` just before `before`. `node` must be solitary.
    pub fn insert_before(&mut self, before: NodeId, node: NodeId) {
        debug_assert!(self.is_solitary(node), "inserting a node that is already linked");
        let prev = self.prev(before);
        self.set_prev(node, prev);
        self.set_next(node, before);
        self.set_next(prev, node);
        self.set_prev(before, node);
    }

    /// Insert `node` at the front of `list`
    pub fn push_front(&mut self, list: NodeId, node: NodeId) {
        let first = self.next(list);
        self.insert_before(first, node);
    }

    /// Insert `node` at the back of `list`
    pub fn push_back(&mut self, list: NodeId, node: NodeId) {
        self.insert_before(list, node);
    }

    /// Move nodes `first..last` (exclusive of `last`) out of their current
    /// ring and insert them just before `before`. No-op when the range is
    /// empty. Source and destination rings both end up correctly linked.
    pub fn splice(&mut self, before: NodeId, first: NodeId, last: NodeId) {
        if first == last {
            return;
        }
        let last = self.prev(last);

        // Close the gap in the source ring.
        let first_prev = self.prev(first);
        let last_next = self.next(last);
        self.set_next(first_prev, last_next);
        self.set_prev(last_next, first_prev);

        // Stitch the run into the destination ring.
        let dst_prev = self.prev(before);
        self.set_prev(first, dst_prev);
        self.set_next(last, before);
        self.set_next(dst_prev, first);
        self.set_prev(before, last);
    }

    /// Unlink `node` from its ring and return the node that followed it.
    /// `node` is left solitary. The node must currently be linked into a
    /// ring (caller obligation; debug-checked).
    pub fn remove(&mut self, node: NodeId) -> NodeId {
        debug_assert!(!self.is_solitary(node), "removing an unlinked node");
        let prev = self.prev(node);
        let next = self.next(node);
        self.set_next(prev, next);
        self.set_prev(next, prev);
        self.set_prev(node, node);
        self.set_next(node, node);
        next
    }

    /// Remove and return the front node. Asserts `list` is non-empty.
    pub fn pop_front(&mut self, list: NodeId) -> NodeId {
        let front = self.front(list);
        self.remove(front);
        front
    }

    /// Remove and return the back node. Asserts `list` is non-empty.
    pub fn pop_back(&mut self, list: NodeId) -> NodeId {
        let back = self.back(list);
        self.remove(back);
        back
    }

    /// Front node of `list`. Asserts the list is non-empty.
    pub fn front(&self, list: NodeId) -> NodeId {
        assert!(!self.is_empty(list), "front() on an empty list");
        self.next(list)
    }

    /// Back node of `list`. Asserts the list is non-empty.
    pub fn back(&self, list: NodeId) -> NodeId {
        assert!(!self.is_empty(list), "back() on an empty list");
        self.prev(list)
    }

    /// Put `element` in the ring position currently occupied by `position`;
    /// `position` is left solitary.
    pub fn replace(&mut self, element: NodeId, position: NodeId) {
        debug_assert!(self.is_solitary(element));
        let prev = self.prev(position);
        let next = self.next(position);
        self.set_next(element, next);
        self.set_prev(next, element);
        self.set_prev(element, prev);
        self.set_next(prev, element);
        self.set_prev(position, position);
        self.set_next(position, position);
    }

    /// Rebuild `dst` as the head of the elements currently headed by `src`
    /// (relocation support for heads embedded in moved structures). `src` is
    /// left an empty list.
    pub fn move_list(&mut self, dst: NodeId, src: NodeId) {
        debug_assert!(self.is_solitary(dst));
        if self.is_empty(src) {
            return;
        }
        self.replace(dst, src);
    }

    /// Number of payload nodes in `list`. O(n).
    pub fn len(&self, list: NodeId) -> usize {
        let mut count = 0;
        let mut cur = self.next(list);
        while cur != list {
            count += 1;
            cur = self.next(cur);
        }
        count
    }

    /// O(1) emptiness check
    #[inline]
    pub fn is_empty(&self, list: NodeId) -> bool {
        self.next(list) == list
    }

    /// True if `list` has exactly one element. O(1).
    #[inline]
    pub fn is_singleton(&self, list: NodeId) -> bool {
        self.is_short(list) && !self.is_empty(list)
    }

    /// True if `list` has zero or one elements. O(1).
    #[inline]
    pub fn is_short(&self, list: NodeId) -> bool {
        self.next(list) == self.prev(list)
    }

    /// Forward traversal of `list`, yielding payload nodes
    pub fn iter(&self, list: NodeId) -> Iter<'_, T> {
        Iter {
            arena: self,
            head: list,
            cur: self.next(list),
        }
    }
}

/// Forward iterator over a list's payload nodes
pub struct Iter<'a, T> {
    arena: &'a ListArena<T>,
    head: NodeId,
    cur: NodeId,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.head {
            return None;
        }
        let id = self.cur;
        self.cur = self.arena.next(id);
        let item = self.arena.nodes[id.index()]
            .item
            .as_ref()
            .expect("payload node without payload");
        Some((id, item))
    }
}
