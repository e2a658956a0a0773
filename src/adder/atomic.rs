//! Single-atomic adders.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::{Adder, FloatAdder};

/// An i64 accumulator backed by one atomic.
///
/// Smallest footprint; becomes a hot spot under heavy write contention,
/// where [`LongAdder`](super::LongAdder) is the better choice.
#[derive(Debug, Default)]
pub struct AtomicAdder {
    value: AtomicI64,
}

impl AtomicAdder {
    /// Creates an adder with sum zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Adder for AtomicAdder {
    fn add(&self, x: i64) {
        self.value.fetch_add(x, Ordering::Relaxed);
    }

    fn sum(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

/// An f64 accumulator backed by one atomic holding the bit pattern.
#[derive(Debug, Default)]
pub struct AtomicDoubleAdder {
    bits: AtomicU64,
}

impl AtomicDoubleAdder {
    /// Creates an adder with sum zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FloatAdder for AtomicDoubleAdder {
    fn add(&self, x: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + x).to_bits();
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}
