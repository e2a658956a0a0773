//! Contention-sharded accumulator core.
//!
//! A lazily-initialized table of cache-padded cells plus a `base` field.
//! Under low contention every update lands on `base` with a single CAS;
//! once a CAS fails, updates disperse over the cell table, which grows by
//! doubling up to [`max_cells`]. The table is published through an
//! epoch-protected pointer; growth and cell installation are serialized
//! by a CAS `busy` flag that never blocks readers or the CAS fast paths.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;

/// Upper bound for the cell table: `clamp(4 * num_cpus, 64, 2048)`.
pub(super) fn max_cells() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus << 2).clamp(64, 2048)
    })
}

/// Draws a non-zero probe for the calling thread.
fn random_probe() -> u32 {
    let p: u32 = rand::random();
    if p == 0 {
        1
    } else {
        p
    }
}

/// Advances a probe along the xorshift sequence.
fn rehash(mut probe: u32) -> u32 {
    probe ^= probe << 13;
    probe ^= probe >> 17;
    probe ^= probe << 5;
    probe
}

/// A 64-bit value that can live in a striped cell.
pub(super) trait StripedValue: Copy + PartialEq + Send + Sync + 'static {
    type Atom: Send + Sync;

    const ZERO: Self;

    fn new_atom(value: Self) -> Self::Atom;
    fn load(atom: &Self::Atom) -> Self;
    fn store(atom: &Self::Atom, value: Self);
    fn cas(atom: &Self::Atom, old: Self, new: Self) -> bool;
    fn combine(left: Self, right: Self) -> Self;
}

impl StripedValue for i64 {
    type Atom = AtomicI64;

    const ZERO: i64 = 0;

    fn new_atom(value: i64) -> AtomicI64 {
        AtomicI64::new(value)
    }

    fn load(atom: &AtomicI64) -> i64 {
        atom.load(Ordering::Relaxed)
    }

    fn store(atom: &AtomicI64, value: i64) {
        atom.store(value, Ordering::Relaxed);
    }

    fn cas(atom: &AtomicI64, old: i64, new: i64) -> bool {
        atom.compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn combine(left: i64, right: i64) -> i64 {
        left.wrapping_add(right)
    }
}

/// f64 cells operate on the bit pattern so the hardware CAS applies.
impl StripedValue for f64 {
    type Atom = AtomicU64;

    const ZERO: f64 = 0.0;

    fn new_atom(value: f64) -> AtomicU64 {
        AtomicU64::new(value.to_bits())
    }

    fn load(atom: &AtomicU64) -> f64 {
        f64::from_bits(atom.load(Ordering::Relaxed))
    }

    fn store(atom: &AtomicU64, value: f64) {
        atom.store(value.to_bits(), Ordering::Relaxed);
    }

    fn cas(atom: &AtomicU64, old: f64, new: f64) -> bool {
        atom.compare_exchange(
            old.to_bits(),
            new.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        )
        .is_ok()
    }

    fn combine(left: f64, right: f64) -> f64 {
        left + right
    }
}

type Cell<V> = CachePadded<<V as StripedValue>::Atom>;

struct CellTable<V: StripedValue> {
    slots: Box<[Atomic<Cell<V>>]>,
}

impl<V: StripedValue> CellTable<V> {
    fn with_len(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            slots: (0..len).map(|_| Atomic::null()).collect(),
        }
    }
}

pub(super) struct Striped<V: StripedValue> {
    cells: Atomic<CellTable<V>>,
    busy: AtomicBool,
    base: CachePadded<V::Atom>,
}

impl<V: StripedValue> Default for Striped<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: StripedValue> Striped<V> {
    pub(super) fn new() -> Self {
        Self {
            cells: Atomic::null(),
            busy: AtomicBool::new(false),
            base: CachePadded::new(V::new_atom(V::ZERO)),
        }
    }

    fn try_lock(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn cas_base(&self, old: V, new: V) -> bool {
        V::cas(&self.base, old, new)
    }

    pub(super) fn add(&self, x: V) {
        let guard = &epoch::pin();
        let table = self.cells.load(Ordering::Acquire, guard);

        let Some(table) = (unsafe { table.as_ref() }) else {
            let b = V::load(&self.base);
            if self.cas_base(b, V::combine(b, x)) {
                return;
            }
            // Base is contended; move to the cells.
            self.accumulate(0, x, true, guard);
            return;
        };

        let probe = random_probe();
        let mask = table.slots.len() - 1;
        let cell = table.slots[probe as usize & mask].load(Ordering::Acquire, guard);
        if cell.is_null() {
            self.accumulate(probe, x, true, guard);
            return;
        }
        // SAFETY: cells are only reclaimed past all pinned readers.
        let cell = unsafe { cell.deref() };
        let v = V::load(cell);
        if !V::cas(cell, v, V::combine(v, x)) {
            self.accumulate(probe, x, false, guard);
        }
    }

    /// Slow path: place `x` somewhere in the cell table, initializing or
    /// growing the table as needed. `was_uncontended` is false when the
    /// caller's cell CAS is already known to have failed.
    fn accumulate(&self, mut probe: u32, x: V, mut was_uncontended: bool, guard: &Guard) {
        if probe == 0 {
            probe = random_probe();
            was_uncontended = true;
        }
        let mut collide = false;

        loop {
            let table_shared = self.cells.load(Ordering::Acquire, guard);
            if let Some(table) = unsafe { table_shared.as_ref() } {
                let n = table.slots.len();
                let slot = &table.slots[probe as usize & (n - 1)];
                let cell_shared = slot.load(Ordering::Acquire, guard);

                if cell_shared.is_null() {
                    // Try to attach a new cell.
                    if !self.busy.load(Ordering::Relaxed) {
                        let cell = Owned::new(CachePadded::new(V::new_atom(x)));
                        if self.try_lock() {
                            // Recheck under the flag: the table may have
                            // grown and the slot may have been taken.
                            let current = self.cells.load(Ordering::Acquire, guard);
                            // SAFETY: a published table is never null here.
                            let ct = unsafe { current.deref() };
                            let j = probe as usize & (ct.slots.len() - 1);
                            let installed = if ct.slots[j].load(Ordering::Acquire, guard).is_null()
                            {
                                ct.slots[j].store(cell, Ordering::Release);
                                true
                            } else {
                                false
                            };
                            self.unlock();
                            if installed {
                                break;
                            }
                            continue;
                        }
                    }
                    collide = false;
                } else if !was_uncontended {
                    // The caller's CAS already failed; rehash first.
                    was_uncontended = true;
                } else {
                    // SAFETY: see `add`.
                    let cell = unsafe { cell_shared.deref() };
                    let v = V::load(cell);
                    if V::cas(cell, v, V::combine(v, x)) {
                        break;
                    }
                    let fresh = self.cells.load(Ordering::Acquire, guard);
                    if n >= max_cells() || fresh != table_shared {
                        // At max size or working on a stale table.
                        collide = false;
                    } else if !collide {
                        collide = true;
                    } else if self.try_lock() {
                        // Double the table if ours is still current.
                        let current = self.cells.load(Ordering::Acquire, guard);
                        if current == table_shared {
                            let grown = CellTable::with_len(n << 1);
                            for (i, s) in table.slots.iter().enumerate() {
                                let c = s.load(Ordering::Acquire, guard);
                                if !c.is_null() {
                                    grown.slots[i].store(c, Ordering::Relaxed);
                                }
                            }
                            let old =
                                self.cells
                                    .swap(Owned::new(grown), Ordering::AcqRel, guard);
                            // SAFETY: the retired table is unreachable;
                            // its cells live on in the new table.
                            unsafe { guard.defer_destroy(old) };
                        }
                        self.unlock();
                        collide = false;
                        continue;
                    }
                }
                probe = rehash(probe);
            } else if !self.busy.load(Ordering::Relaxed)
                && self.cells.load(Ordering::Acquire, guard).is_null()
                && self.try_lock()
            {
                // Initialize the table: length 2, one cell holding x.
                let init = if self.cells.load(Ordering::Acquire, guard).is_null() {
                    let table = CellTable::with_len(2);
                    table.slots[probe as usize & 1]
                        .store(Owned::new(CachePadded::new(V::new_atom(x))), Ordering::Release);
                    self.cells.store(Owned::new(table), Ordering::Release);
                    true
                } else {
                    false
                };
                self.unlock();
                if init {
                    break;
                }
            } else {
                // Fall back on base while another thread initializes.
                let b = V::load(&self.base);
                if self.cas_base(b, V::combine(b, x)) {
                    break;
                }
            }
        }
    }

    /// Sums `base` and every cell. Not an atomic snapshot: concurrent
    /// updates may or may not be reflected.
    pub(super) fn sum(&self) -> V {
        let guard = &epoch::pin();
        let mut sum = V::load(&self.base);
        let table = self.cells.load(Ordering::Acquire, guard);
        if let Some(table) = unsafe { table.as_ref() } {
            for slot in table.slots.iter() {
                let cell = slot.load(Ordering::Acquire, guard);
                if let Some(cell) = unsafe { cell.as_ref() } {
                    sum = V::combine(sum, V::load(cell));
                }
            }
        }
        sum
    }

    /// Sets `base` to `value` and replaces every populated slot with a
    /// fresh zero cell. Only meaningful without concurrent updaters.
    pub(super) fn set(&self, value: V) {
        let guard = &epoch::pin();
        V::store(&self.base, value);
        let table = self.cells.load(Ordering::Acquire, guard);
        if let Some(table) = unsafe { table.as_ref() } {
            let fresh = CellTable::with_len(table.slots.len());
            for slot in fresh.slots.iter() {
                slot.store(
                    Owned::new(CachePadded::new(V::new_atom(V::ZERO))),
                    Ordering::Relaxed,
                );
            }
            let old = self.cells.swap(Owned::new(fresh), Ordering::AcqRel, guard);
            // SAFETY: the old table and its cells are unreachable once
            // all pinned readers move on.
            unsafe {
                let ot = old.deref();
                for slot in ot.slots.iter() {
                    let cell = slot.load(Ordering::Acquire, guard);
                    if !cell.is_null() {
                        guard.defer_destroy(cell);
                    }
                }
                guard.defer_destroy(old);
            }
        }
    }
}

impl<V: StripedValue> Drop for Striped<V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes concurrent access.
        unsafe {
            let guard = epoch::unprotected();
            let table = self.cells.load(Ordering::Relaxed, guard);
            if let Some(t) = table.as_ref() {
                for slot in t.slots.iter() {
                    let cell = slot.load(Ordering::Relaxed, guard);
                    if !cell.is_null() {
                        drop(cell.into_owned());
                    }
                }
                drop(table.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rehash_follows_xorshift() {
        let p = 0x9e3779b9u32;
        let mut expect = p;
        expect ^= expect << 13;
        expect ^= expect >> 17;
        expect ^= expect << 5;
        assert_eq!(rehash(p), expect);
        assert_ne!(rehash(p), p);
    }

    #[test]
    fn max_cells_is_clamped() {
        let m = max_cells();
        assert!((64..=2048).contains(&m));
    }

    #[test]
    fn probe_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(random_probe(), 0);
        }
    }
}
