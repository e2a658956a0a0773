//! Concurrency primitives and resilience components for building
//! high-throughput clients of remote services.
//!
//! The crate is organized leaves-first:
//!
//! - [`adder`]: contention-sharded counters (striped i64/f64 adders).
//! - [`queue`]: a lock-free multi-producer multi-consumer linked queue.
//! - [`breaker`]: a sliding-window event counter and a non-blocking
//!   circuit breaker built on top of the two modules above.
//! - [`pool`]: a bounded, optionally expandable async worker pool.
//! - [`backoff`]: pure backoff strategies and a small spec language.
//! - [`client`]: a load-balanced HTTP client combining endpoint
//!   resolution, health checking, per-endpoint circuit breaking, and
//!   retry-with-backoff.

#[macro_use]
extern crate tracing;

pub mod adder;
pub mod backoff;
pub mod breaker;
pub mod client;
pub mod pool;
pub mod queue;
pub mod sync;

#[cfg(test)]
mod test_util;

/// Error type for user-supplied callbacks (transformers, decoders,
/// circuit breaker listeners).
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
