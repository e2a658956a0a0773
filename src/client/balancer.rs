//! Endpoint selection strategies.

use std::sync::atomic::{AtomicU32, Ordering};

/// Picks the index of the endpoint to try first.
pub trait Balance: Send + Sync {
    /// Index of the chosen endpoint; always `< len` for the endpoint
    /// set the balancer was built over.
    fn pick(&self) -> usize;
}

/// Which balancer the installer builds over each resolved endpoint set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BalancerKind {
    /// Rotate through the endpoints from a randomized start.
    #[default]
    RoundRobin,
    /// Always pick the first endpoint; failover still rotates.
    PickFirst,
}

impl BalancerKind {
    pub(crate) fn build(self, len: usize) -> Box<dyn Balance> {
        match self {
            BalancerKind::RoundRobin => Box::new(RoundRobin::new(len)),
            BalancerKind::PickFirst => Box::new(PickFirst),
        }
    }
}

/// Always index 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct PickFirst;

impl Balance for PickFirst {
    fn pick(&self) -> usize {
        0
    }
}

/// Atomic round-robin with a randomized start index.
#[derive(Debug)]
pub struct RoundRobin {
    index: AtomicU32,
    len: u32,
}

impl RoundRobin {
    /// Creates a round-robin balancer over `len` endpoints.
    pub fn new(len: usize) -> Self {
        Self {
            index: AtomicU32::new(rand::random()),
            len: len as u32,
        }
    }
}

impl Balance for RoundRobin {
    fn pick(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let next = self.index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        (next % self.len) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pick_first_is_constant() {
        let lb = PickFirst;
        for _ in 0..10 {
            assert_eq!(lb.pick(), 0);
        }
    }

    #[test]
    fn round_robin_cycles() {
        let lb = RoundRobin::new(3);
        let first = lb.pick();
        assert_eq!(lb.pick(), (first + 1) % 3);
        assert_eq!(lb.pick(), (first + 2) % 3);
        assert_eq!(lb.pick(), first);
    }

    #[test]
    fn round_robin_distributes_evenly_across_threads() {
        const THREADS: usize = 7;
        const PICKS: usize = 18_000;

        let lb = Arc::new(RoundRobin::new(3));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lb = Arc::clone(&lb);
                std::thread::spawn(move || {
                    let mut counts = [0usize; 3];
                    for _ in 0..PICKS {
                        counts[lb.pick()] += 1;
                    }
                    counts
                })
            })
            .collect();

        let mut totals = [0usize; 3];
        for handle in handles {
            let counts = handle.join().unwrap();
            for (total, count) in totals.iter_mut().zip(counts) {
                *total += count;
            }
        }
        // 7 threads * 18_000 picks over a shared counter: exactly even.
        assert_eq!(totals, [42_000, 42_000, 42_000]);
    }

    #[test]
    fn empty_round_robin_does_not_divide_by_zero() {
        let lb = RoundRobin::new(0);
        assert_eq!(lb.pick(), 0);
    }
}
