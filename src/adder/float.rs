//! Striped f64 adder.

use super::striped::Striped;
use super::FloatAdder;

/// A contention-sharded f64 accumulator.
///
/// The f64 counterpart of [`LongAdder`](super::LongAdder): cells hold the
/// bit pattern of an f64 and are updated via CAS on the raw bits, so the
/// adder stays non-blocking. Floating-point addition is not associative;
/// sums over differently-interleaved updates may differ in the last ulp.
#[derive(Default)]
pub struct DoubleAdder {
    inner: Striped<f64>,
}

impl DoubleAdder {
    /// Creates an adder with sum zero.
    pub fn new() -> Self {
        Self {
            inner: Striped::new(),
        }
    }

    /// Adds `x` to the sum.
    pub fn add(&self, x: f64) {
        self.inner.add(x);
    }

    /// Adds one.
    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Subtracts one.
    pub fn dec(&self) {
        self.add(-1.0);
    }

    /// Returns the current sum. Not an atomic snapshot.
    pub fn sum(&self) -> f64 {
        self.inner.sum()
    }

    /// Resets the sum to zero. Only effective without concurrent
    /// updaters.
    pub fn reset(&self) {
        self.set(0.0);
    }

    /// Returns the sum, then resets it. Only effective without
    /// concurrent updaters.
    pub fn sum_and_reset(&self) -> f64 {
        let sum = self.sum();
        self.reset();
        sum
    }

    /// Stores `value` as the new sum. Only effective without concurrent
    /// updaters.
    pub fn set(&self, value: f64) {
        self.inner.set(value);
    }
}

impl FloatAdder for DoubleAdder {
    fn add(&self, x: f64) {
        DoubleAdder::add(self, x)
    }

    fn sum(&self) -> f64 {
        DoubleAdder::sum(self)
    }

    fn set(&self, value: f64) {
        DoubleAdder::set(self, value)
    }
}

impl std::fmt::Debug for DoubleAdder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleAdder")
            .field("sum", &self.sum())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_threaded_sequence_sums_exactly() {
        let adder = DoubleAdder::new();
        adder.add(0.5);
        adder.add(1.25);
        adder.add(-0.75);
        assert_eq!(adder.sum(), 1.0);
    }

    #[test]
    fn concurrent_incs_are_not_lost() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 20_000;

        let adder = Arc::new(DoubleAdder::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let adder = Arc::clone(&adder);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        adder.inc();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Sums of 1.0 are exact in f64 well past this magnitude.
        assert_eq!(adder.sum(), (THREADS * PER_THREAD) as f64);
    }

    #[test]
    fn store_then_sum_round_trips() {
        let adder = DoubleAdder::new();
        adder.add(10.0);
        adder.set(2.5);
        assert_eq!(adder.sum(), 2.5);
        assert_eq!(adder.sum_and_reset(), 2.5);
        assert_eq!(adder.sum(), 0.0);
    }
}
