//! Monotonic identifier allocation.
//!
//! An [`Allocator`] hands out a gap-free, strictly increasing sequence of
//! `u64` values to any number of concurrent callers. It is used for short
//! keys by the map and log backends and for owner ids by the service layer.

mod allocator;
pub mod error;

pub use allocator::Allocator;
pub use error::Error;
