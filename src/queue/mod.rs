//! Lock-free multi-producer multi-consumer FIFO queue.
//!
//! [`LinkedQueue`] is a Michael–Scott style linked queue tuned for the
//! append-mostly, trim-periodically access pattern of the sliding-window
//! counter: concurrent `offer`/`poll` never block, and an iterator
//! supports removing elements observed mid-traversal.
//!
//! Elements are handles (`T: Clone`, typically `Arc<_>`): `poll` and the
//! iterator return clones, and the queue drops its copy when the node is
//! reclaimed.

mod linked;

pub use linked::{LinkedQueue, QueueIter};
