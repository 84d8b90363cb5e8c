//! The edge-facing half of the snip URL shortener.
//!
//! This crate provides the asynchronous deletion pipeline, delete request
//! parsing, configuration loading and the [`ShortenerService`] facade that
//! ties a storage backend, the owner id allocator and the pipeline together.

pub mod config;
pub mod delete;
pub mod error;
pub mod request;
pub mod service;

pub use config::{Backend, ConfigArgs, Settings};
pub use delete::{DeletionPipeline, PipelineSettings};
pub use error::{PipelineError, Result, ShortenerError};
pub use request::parse_delete_request;
pub use service::{BatchItem, BatchResult, ListedUrl, Shortened, ShortenerService};
