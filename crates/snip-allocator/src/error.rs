use thiserror::Error;

/// Errors returned by [`Allocator::next`](crate::Allocator::next).
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Error {
    #[error("allocator has been shut down")]
    Shutdown,
    #[error("allocator exhausted the u64 range")]
    Exhausted,
}
