//! Bounded, in-process caches and buffers (spec.md §4.2).
//!
//! Nothing here talks to disk or the network; these are pure memory
//! structures shared across the market-data and execution paths to keep
//! resident memory flat over a long-running process.

pub mod lru;
pub mod ring;
pub mod window;

pub use lru::{CacheStats, LruCache};
pub use ring::BoundedRing;
pub use window::WindowedCounter;
