//! Michael–Scott linked queue with logical deletion.
//!
//! # Structure
//!
//! The queue is a singly linked list starting at a dummy node. `head` and
//! `tail` are hints: `tail` may lag the true last node by a hop, and
//! `head` may point at a logically deleted node until the next traversal
//! advances it. An element is *logically* removed by clearing its node's
//! `live` flag; *physical* removal happens when a traversal advances
//! `head` past a dead prefix.
//!
//! A node whose `next` points to itself has been advanced past by `head`;
//! traversals that observe a self-link restart from the current head.
//!
//! # Reclamation
//!
//! Nodes are freed through `crossbeam-epoch`. Ownership of retired nodes
//! is unambiguous: the traversal that wins the head CAS from `h` to `p`
//! owns exactly the nodes it walked in `[h, p)` and defers their
//! destruction. Iterator removal only clears the `live` flag; the dead
//! node is reclaimed once every element ahead of it has been removed and
//! `head` passes over it. This keeps reclamation single-owner without
//! hazard-pointer bookkeeping, at the cost of dead interior nodes staying
//! chained until the prefix before them drains.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

struct Node<T> {
    /// The element. `None` only for the initial dummy node. Never
    /// mutated after construction; `live` gates logical presence.
    value: Option<T>,
    /// Cleared exactly once when the element is polled or removed.
    live: AtomicBool,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn element(value: T) -> Owned<Node<T>> {
        Owned::new(Node {
            value: Some(value),
            live: AtomicBool::new(true),
            next: Atomic::null(),
        })
    }

    fn dummy() -> Owned<Node<T>> {
        Owned::new(Node {
            value: None,
            live: AtomicBool::new(false),
            next: Atomic::null(),
        })
    }

    /// Claims the element, clearing `live`. Exactly one caller wins.
    fn claim(&self) -> bool {
        self.live
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// A lock-free MPMC FIFO queue.
///
/// `len` is O(n) and saturates at `i32::MAX`; like all observations of a
/// concurrent queue it may be stale by the time it returns.
pub struct LinkedQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
}

// SAFETY: nodes are only shared across threads through the atomics, and
// elements cross threads on poll.
unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send + Sync> Sync for LinkedQueue<T> {}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let dummy = Node::dummy();
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };
        let guard = &epoch::pin();
        let dummy = dummy.into_shared(guard);
        queue.head.store(dummy, Ordering::Relaxed);
        queue.tail.store(dummy, Ordering::Relaxed);
        queue
    }

    /// Inserts `value` at the tail.
    pub fn offer(&self, value: T) {
        let guard = &epoch::pin();
        let new = Node::element(value).into_shared(guard);

        let mut t = self.tail.load(Ordering::Acquire, guard);
        let mut p = t;
        loop {
            // SAFETY: reachable nodes are not reclaimed under the pin.
            let node = unsafe { p.deref() };
            let q = node.next.load(Ordering::Acquire, guard);
            if q.is_null() {
                // p is the last node; try to append.
                if node
                    .next
                    .compare_exchange(
                        Shared::null(),
                        new,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                {
                    if p != t {
                        // Hop two nodes at a time; failure is fine.
                        let _ = self.tail.compare_exchange(
                            t,
                            new,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        );
                    }
                    return;
                }
                // Lost the append race; re-read next.
            } else if p == q {
                // Fallen off the list: jump to the new tail if it moved,
                // otherwise to head, from which all live nodes are
                // reachable.
                let old_t = t;
                t = self.tail.load(Ordering::Acquire, guard);
                p = if t != old_t {
                    t
                } else {
                    self.head.load(Ordering::Acquire, guard)
                };
            } else if p != t {
                // Check for a tail update after two hops.
                let old_t = t;
                t = self.tail.load(Ordering::Acquire, guard);
                p = if t != old_t { t } else { q };
            } else {
                p = q;
            }
        }
    }

    /// Advances `head` from `h` to `p` and retires the walked prefix.
    ///
    /// `visited` must be exactly the nodes walked from `h` (inclusive) to
    /// `p` (exclusive), every one of them logically dead. The winner of
    /// the head CAS is the sole owner of those nodes.
    fn advance_head<'g>(
        &self,
        h: Shared<'g, Node<T>>,
        p: Shared<'g, Node<T>>,
        visited: &[Shared<'g, Node<T>>],
        guard: &'g Guard,
    ) {
        if h == p {
            return;
        }
        if self
            .head
            .compare_exchange(h, p, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_err()
        {
            return;
        }

        // Mark the old head as fallen off so stale traversals restart.
        // SAFETY: `h` is in `visited`; destruction is deferred below.
        unsafe { h.deref() }.next.store(h, Ordering::Release);

        // `tail` may still point into the retired prefix; push it out
        // before freeing. On CAS failure an offer has already moved the
        // tail to a freshly appended node.
        let t = self.tail.load(Ordering::Acquire, guard);
        if visited.iter().any(|n| *n == t) {
            let _ = self
                .tail
                .compare_exchange(t, p, Ordering::AcqRel, Ordering::Acquire, guard);
        }

        for node in visited {
            // SAFETY: the head CAS made this prefix unreachable from the
            // queue roots; `next` edges only point forward, so no later
            // head/tail update can land on these nodes again.
            unsafe { guard.defer_destroy(*node) };
        }
    }
}

impl<T: Clone> LinkedQueue<T> {
    /// Removes and returns the head element, or `None` if the queue is
    /// empty.
    pub fn poll(&self) -> Option<T> {
        let guard = &epoch::pin();
        'restart: loop {
            let h = self.head.load(Ordering::Acquire, guard);
            let mut visited: Vec<Shared<'_, Node<T>>> = Vec::new();
            let mut p = h;
            loop {
                // SAFETY: see `offer`.
                let node = unsafe { p.deref() };
                if node.live.load(Ordering::Acquire) && node.claim() {
                    // The claim CAS is the linearization point.
                    let value = node.value.clone();
                    if p != h {
                        let q = node.next.load(Ordering::Acquire, guard);
                        if q.is_null() {
                            self.advance_head(h, p, &visited, guard);
                        } else {
                            // p itself is dead now; retire it too.
                            visited.push(p);
                            self.advance_head(h, q, &visited, guard);
                        }
                    }
                    return value;
                }

                let q = node.next.load(Ordering::Acquire, guard);
                if q.is_null() {
                    self.advance_head(h, p, &visited, guard);
                    return None;
                }
                if p == q {
                    continue 'restart;
                }
                visited.push(p);
                p = q;
            }
        }
    }

    /// Returns the head element without removing it, or `None` if the
    /// queue is empty. May race a concurrent `poll` and return an element
    /// that has just been taken.
    pub fn peek(&self) -> Option<T> {
        let guard = &epoch::pin();
        'restart: loop {
            let h = self.head.load(Ordering::Acquire, guard);
            let mut visited: Vec<Shared<'_, Node<T>>> = Vec::new();
            let mut p = h;
            loop {
                // SAFETY: see `offer`.
                let node = unsafe { p.deref() };
                if node.live.load(Ordering::Acquire) {
                    let value = node.value.clone();
                    self.advance_head(h, p, &visited, guard);
                    return value;
                }
                let q = node.next.load(Ordering::Acquire, guard);
                if q.is_null() {
                    self.advance_head(h, p, &visited, guard);
                    return None;
                }
                if p == q {
                    continue 'restart;
                }
                visited.push(p);
                p = q;
            }
        }
    }

    /// Returns whether the queue holds no live elements.
    pub fn is_empty(&self) -> bool {
        !self.has_live()
    }

    /// Returns the number of live elements, saturating at `i32::MAX`.
    ///
    /// O(n): the asynchronous nature of the queue requires a traversal,
    /// and the result may be stale under concurrent updates.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        'restart: loop {
            let mut count: usize = 0;
            let mut p = self.head.load(Ordering::Acquire, guard);
            while !p.is_null() {
                // SAFETY: see `offer`.
                let node = unsafe { p.deref() };
                if node.live.load(Ordering::Acquire) {
                    count += 1;
                    if count == i32::MAX as usize {
                        return count;
                    }
                }
                let q = node.next.load(Ordering::Acquire, guard);
                if p == q {
                    continue 'restart;
                }
                p = q;
            }
            return count;
        }
    }

    /// Returns an iterator over the live elements.
    ///
    /// The iterator tolerates concurrent offers and polls; `has_next` and
    /// `next` are not atomic with respect to each other.
    pub fn iter(&self) -> QueueIter<'_, T> {
        QueueIter::new(self)
    }

    /// Whether any live node exists, advancing head past the dead prefix
    /// on the way.
    fn has_live(&self) -> bool {
        let guard = &epoch::pin();
        'restart: loop {
            let h = self.head.load(Ordering::Acquire, guard);
            let mut visited: Vec<Shared<'_, Node<T>>> = Vec::new();
            let mut p = h;
            loop {
                // SAFETY: see `offer`.
                let node = unsafe { p.deref() };
                if node.live.load(Ordering::Acquire) {
                    self.advance_head(h, p, &visited, guard);
                    return true;
                }
                let q = node.next.load(Ordering::Acquire, guard);
                if q.is_null() {
                    self.advance_head(h, p, &visited, guard);
                    return false;
                }
                if p == q {
                    continue 'restart;
                }
                visited.push(p);
                p = q;
            }
        }
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes concurrent access; retired nodes
        // already sit in the epoch collector and are not reachable from
        // the chain.
        unsafe {
            let guard = epoch::unprotected();
            let mut p = self.head.load(Ordering::Relaxed, guard);
            while !p.is_null() {
                let next = p.deref().next.load(Ordering::Relaxed, guard);
                if next == p {
                    break;
                }
                drop(p.into_owned());
                p = next;
            }
        }
    }
}

impl<T> std::fmt::Debug for LinkedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedQueue").finish_non_exhaustive()
    }
}

/// Iterator over a [`LinkedQueue`].
///
/// Holds an epoch pin for its whole lifetime, so the nodes it stands on
/// cannot be reclaimed mid-iteration. Drop it promptly: a long-lived
/// iterator delays reclamation crate-wide.
pub struct QueueIter<'q, T> {
    queue: &'q LinkedQueue<T>,
    guard: Guard,
    next_node: *const Node<T>,
    next_value: Option<T>,
    last_returned: *const Node<T>,
}

impl<'q, T: Clone> QueueIter<'q, T> {
    fn new(queue: &'q LinkedQueue<T>) -> Self {
        let guard = epoch::pin();
        let (next_node, next_value) = Self::seek_first(queue, &guard);
        Self {
            queue,
            guard,
            next_node,
            next_value,
            last_returned: std::ptr::null(),
        }
    }

    fn seek_first(queue: &LinkedQueue<T>, guard: &Guard) -> (*const Node<T>, Option<T>) {
        'restart: loop {
            let h = queue.head.load(Ordering::Acquire, guard);
            let mut visited: Vec<Shared<'_, Node<T>>> = Vec::new();
            let mut p = h;
            loop {
                // SAFETY: see `LinkedQueue::offer`.
                let node = unsafe { p.deref() };
                if node.live.load(Ordering::Acquire) {
                    let value = node.value.clone();
                    queue.advance_head(h, p, &visited, guard);
                    return (p.as_raw(), value);
                }
                let q = node.next.load(Ordering::Acquire, guard);
                if q.is_null() {
                    queue.advance_head(h, p, &visited, guard);
                    return (std::ptr::null(), None);
                }
                if p == q {
                    continue 'restart;
                }
                visited.push(p);
                p = q;
            }
        }
    }

    /// Whether another element is available.
    pub fn has_next(&self) -> bool {
        self.next_value.is_some()
    }

    /// Returns the next element, advancing past logically removed nodes.
    pub fn next(&mut self) -> Option<T> {
        if self.next_node.is_null() {
            return None;
        }
        self.last_returned = self.next_node;
        let result = self.next_value.take();

        // Advance to the following live node.
        let guard = &self.guard;
        // SAFETY: `next_node` was captured under `self.guard`, which has
        // been pinned continuously since.
        let mut p = Self::successor(unsafe { Shared::from(self.next_node) }, self.queue, guard);
        loop {
            if p.is_null() {
                self.next_node = std::ptr::null();
                self.next_value = None;
                break;
            }
            // SAFETY: see `LinkedQueue::offer`.
            let node = unsafe { p.deref() };
            if node.live.load(Ordering::Acquire) {
                self.next_node = p.as_raw();
                self.next_value = node.value.clone();
                break;
            }
            p = Self::successor(p, self.queue, guard);
        }
        result
    }

    /// Logically removes the element last returned by [`next`].
    ///
    /// The node stays chained until the prefix before it drains and a
    /// traversal advances head past it.
    ///
    /// [`next`]: QueueIter::next
    pub fn remove(&mut self) {
        if self.last_returned.is_null() {
            return;
        }
        // SAFETY: see `next`.
        let node = unsafe { &*self.last_returned };
        node.live.store(false, Ordering::Release);
        self.last_returned = std::ptr::null();
    }

    fn successor<'g>(
        node: Shared<'g, Node<T>>,
        queue: &LinkedQueue<T>,
        guard: &'g Guard,
    ) -> Shared<'g, Node<T>> {
        // SAFETY: see `LinkedQueue::offer`.
        let next = unsafe { node.deref() }.next.load(Ordering::Acquire, guard);
        if next == node {
            // Fell off the list; all live nodes are reachable from head.
            queue.head.load(Ordering::Acquire, guard)
        } else {
            next
        }
    }
}
