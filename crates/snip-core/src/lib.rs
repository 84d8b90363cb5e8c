//! Core types and traits for the snip URL shortener.
//!
//! This crate provides the identifiers, records, error taxonomy and the
//! storage contract shared by every backend and by the service layer.

pub mod error;
pub mod ids;
pub mod record;
pub mod storage;

pub use error::{Result, StorageError};
pub use ids::{OwnerId, ShortKey};
pub use record::{Bootstrap, DeleteRequest, Stats, UrlRecord};
pub use storage::{validate_owner, validate_url, ReadStorage, Storage};
