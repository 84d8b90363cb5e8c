//! Storage backends for the snip URL shortener.
//!
//! Three interchangeable implementations of [`Storage`]:
//!
//! - [`InMemoryStorage`]: a volatile map, lost on restart.
//! - [`AppendLogStorage`]: an append-only text file replayed at startup.
//! - [`MySqlStorage`]: a single relational table.

pub mod append_log;
mod index;
pub mod memory;
pub mod mysql;

pub use append_log::AppendLogStorage;
pub use memory::InMemoryStorage;
pub use mysql::MySqlStorage;
pub use snip_core::{ReadStorage, Storage, StorageError};

use snip_allocator::Error as AllocatorError;

/// Maps an allocator failure onto the storage taxonomy.
pub(crate) fn allocator_error(err: AllocatorError) -> StorageError {
    StorageError::Unavailable(format!("key allocator: {err}"))
}
