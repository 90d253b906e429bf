//! Concurrent queue primitives for boundq
//!
//! - `mpmc`: Bounded, lock-based multi-producer multi-consumer queue with close-and-drain shutdown

pub mod mpmc;

pub use mpmc::{BoundedQueue, Iter, PopError, PushError, QueueError, TryIter};
