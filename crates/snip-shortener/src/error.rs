use snip_allocator::Error as AllocatorError;
use snip_core::StorageError;
use thiserror::Error;

/// Errors raised by the deletion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("deletion pipeline is closed")]
    Closed,
    #[error("malformed delete request: {0}")]
    MalformedRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortenerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("owner allocator: {0}")]
    Allocator(#[from] AllocatorError),
}

pub type Result<T, E = ShortenerError> = std::result::Result<T, E>;
