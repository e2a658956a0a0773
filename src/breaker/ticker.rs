//! Monotonic time source.

use std::sync::OnceLock;
use std::time::Instant;

/// A monotonic clock read as nanoseconds.
///
/// The circuit breaker and sliding-window counter take their time from a
/// `Ticker` so tests can drive the clock by hand.
pub trait Ticker: Send + Sync {
    /// Nanoseconds on a monotonic clock. The zero point is arbitrary but
    /// fixed for the lifetime of the process.
    fn tick(&self) -> i64;
}

/// The process clock, anchored at first use.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTicker;

impl Ticker for SystemTicker {
    fn tick(&self) -> i64 {
        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        let anchor = *ANCHOR.get_or_init(Instant::now);
        anchor.elapsed().as_nanos() as i64
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Ticker;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A hand-driven clock for deterministic tests.
    #[derive(Debug, Default)]
    pub(crate) struct ManualTicker {
        nanos: AtomicI64,
    }

    impl ManualTicker {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn advance(&self, nanos: i64) {
            self.nanos.fetch_add(nanos, Ordering::SeqCst);
        }

        pub(crate) fn set(&self, nanos: i64) {
            self.nanos.store(nanos, Ordering::SeqCst);
        }
    }

    impl Ticker for ManualTicker {
        fn tick(&self) -> i64 {
            self.nanos.load(Ordering::SeqCst)
        }
    }
}
