//! Pointer-swapped immutable state.
//!
//! Several components in this crate publish immutable state records that
//! readers snapshot once per operation and writers replace wholesale: the
//! circuit breaker state, the sliding-window counter's current bucket and
//! snapshot, and the installed load balancer. [`AtomicRef`] is that
//! pattern extracted: an `Arc<T>` slot with lock-free `load`, `store`,
//! and `compare_exchange`, reclaimed through `crossbeam-epoch` so readers
//! never observe a freed slot.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

struct Slot<T> {
    value: Arc<T>,
}

/// A lock-free cell holding an `Arc<T>`.
///
/// `load` is wait-free; `compare_exchange` succeeds only if the cell
/// still holds the exact `Arc` the caller observed (pointer identity,
/// not value equality). Replaced slots are retired through the epoch
/// collector, so the ABA window of a recycled allocation cannot occur
/// while any reader is pinned.
pub struct AtomicRef<T> {
    inner: Atomic<Slot<T>>,
}

impl<T> AtomicRef<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: Arc<T>) -> Self {
        Self {
            inner: Atomic::new(Slot { value }),
        }
    }

    /// Returns a clone of the currently held `Arc`.
    pub fn load(&self) -> Arc<T> {
        let guard = epoch::pin();
        let shared = self.inner.load(Ordering::Acquire, &guard);
        // SAFETY: the slot is never null and cannot be reclaimed while
        // the guard is pinned.
        unsafe { shared.deref() }.value.clone()
    }

    /// Replaces the held `Arc` unconditionally.
    ///
    /// Intended for single-writer positions; concurrent writers are safe
    /// but last-write-wins.
    pub fn store(&self, value: Arc<T>) {
        let guard = epoch::pin();
        let old = self
            .inner
            .swap(Owned::new(Slot { value }), Ordering::AcqRel, &guard);
        // SAFETY: `old` is unlinked and no new reference to it can be
        // created; destruction is deferred past all pinned readers.
        unsafe { guard.defer_destroy(old) };
    }

    /// Replaces the held `Arc` with `new` iff the cell still holds
    /// `current`. Returns whether the exchange took place.
    pub fn compare_exchange(&self, current: &Arc<T>, new: Arc<T>) -> bool {
        let guard = epoch::pin();
        let shared = self.inner.load(Ordering::Acquire, &guard);
        // SAFETY: see `load`.
        if !Arc::ptr_eq(&unsafe { shared.deref() }.value, current) {
            return false;
        }
        match self.inner.compare_exchange(
            shared,
            Owned::new(Slot { value: new }),
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        ) {
            Ok(_) => {
                // SAFETY: see `store`.
                unsafe { guard.defer_destroy(shared) };
                true
            }
            Err(_) => false,
        }
    }
}

impl<T> Drop for AtomicRef<T> {
    fn drop(&mut self) {
        // SAFETY: we hold `&mut self`, so no other thread can access the
        // slot; the unprotected guard is sufficient.
        unsafe {
            let guard = epoch::unprotected();
            let shared = self.inner.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(shared.into_owned());
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for AtomicRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AtomicRef").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn load_returns_stored_value() {
        let cell = AtomicRef::new(Arc::new(7usize));
        assert_eq!(*cell.load(), 7);

        cell.store(Arc::new(11));
        assert_eq!(*cell.load(), 11);
    }

    #[test]
    fn compare_exchange_requires_identity() {
        let cell = AtomicRef::new(Arc::new(1usize));
        let seen = cell.load();

        // A different Arc with an equal value must not match.
        assert!(!cell.compare_exchange(&Arc::new(1usize), Arc::new(2)));
        assert!(cell.compare_exchange(&seen, Arc::new(2)));
        assert_eq!(*cell.load(), 2);

        // The stale snapshot loses the second time around.
        assert!(!cell.compare_exchange(&seen, Arc::new(3)));
    }

    #[test]
    fn contended_compare_exchange_admits_one_winner() {
        let cell = Arc::new(AtomicRef::new(Arc::new(0usize)));
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let cell = Arc::clone(&cell);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    let snapshot = cell.load();
                    if cell.compare_exchange(&snapshot, Arc::new(i)) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Every thread raced the same initial snapshot; exactly one CAS
        // can have replaced it.
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_ne!(*cell.load(), 0);
    }

    #[test]
    fn concurrent_loads_and_stores() {
        let cell = Arc::new(AtomicRef::new(Arc::new(0u64)));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 1..=10_000u64 {
                    cell.store(Arc::new(i));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..10_000 {
                        let v = *cell.load();
                        assert!(v <= 10_000);
                        last = v;
                    }
                    last
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(*cell.load(), 10_000);
    }
}
