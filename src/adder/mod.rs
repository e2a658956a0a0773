//! Thread-safe numeric accumulators for i64/f64 sums.
//!
//! When many tasks bump a shared statistic, a single atomic becomes a
//! contention hot spot. The striped adders ([`LongAdder`],
//! [`DoubleAdder`]) shard updates over cache-padded cells that grow with
//! observed contention, trading memory for throughput while staying
//! non-blocking. The plain atomic variants ([`AtomicAdder`],
//! [`AtomicDoubleAdder`]) are the low-footprint alternative for lightly
//! contended counters.
//!
//! Sums are not atomic snapshots: a `sum` that races updates may or may
//! not observe them. `reset` and `store` are only meaningful while no
//! concurrent updates are in flight.

mod atomic;
mod float;
mod long;
mod striped;

pub use atomic::{AtomicAdder, AtomicDoubleAdder};
pub use float::DoubleAdder;
pub use long::LongAdder;

/// Operations shared by every i64 accumulator.
pub trait Adder: Send + Sync {
    /// Adds `x` to the sum.
    fn add(&self, x: i64);

    /// Adds one.
    fn inc(&self) {
        self.add(1);
    }

    /// Subtracts one.
    fn dec(&self) {
        self.add(-1);
    }

    /// Returns the current sum. Not an atomic snapshot.
    fn sum(&self) -> i64;

    /// Resets the sum to zero. Only effective without concurrent
    /// updaters.
    fn reset(&self) {
        self.set(0);
    }

    /// Returns the sum and resets it. Only effective without concurrent
    /// updaters.
    fn sum_and_reset(&self) -> i64 {
        let sum = self.sum();
        self.reset();
        sum
    }

    /// Stores `value` as the new sum. Only effective without concurrent
    /// updaters.
    fn set(&self, value: i64);
}

/// Operations shared by every f64 accumulator.
pub trait FloatAdder: Send + Sync {
    /// Adds `x` to the sum.
    fn add(&self, x: f64);

    /// Adds one.
    fn inc(&self) {
        self.add(1.0);
    }

    /// Subtracts one.
    fn dec(&self) {
        self.add(-1.0);
    }

    /// Returns the current sum. Not an atomic snapshot.
    fn sum(&self) -> f64;

    /// Resets the sum to zero. Only effective without concurrent
    /// updaters.
    fn reset(&self) {
        self.set(0.0);
    }

    /// Returns the sum and resets it. Only effective without concurrent
    /// updaters.
    fn sum_and_reset(&self) -> f64 {
        let sum = self.sum();
        self.reset();
        sum
    }

    /// Stores `value` as the new sum. Only effective without concurrent
    /// updaters.
    fn set(&self, value: f64);
}

/// Selects an adder implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdderKind {
    /// Contention-sharded cells; the default.
    #[default]
    Striped,
    /// A single atomic; smallest footprint.
    Atomic,
}

/// Creates an i64 adder of the given kind.
pub fn new_adder(kind: AdderKind) -> Box<dyn Adder> {
    match kind {
        AdderKind::Striped => Box::new(LongAdder::new()),
        AdderKind::Atomic => Box::new(AtomicAdder::new()),
    }
}

/// Creates an f64 adder of the given kind.
pub fn new_float_adder(kind: AdderKind) -> Box<dyn FloatAdder> {
    match kind {
        AdderKind::Striped => Box::new(DoubleAdder::new()),
        AdderKind::Atomic => Box::new(AtomicDoubleAdder::new()),
    }
}
