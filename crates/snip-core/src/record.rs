use crate::ids::{OwnerId, ShortKey};
use serde::{Deserialize, Serialize};

/// A stored URL record.
///
/// `deleted` is the only mutable field and once set it stays set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub key: ShortKey,
    /// The original URL that was shortened.
    pub original_url: String,
    pub owner: OwnerId,
    pub deleted: bool,
}

/// A request to soft-delete `key` on behalf of `owner`.
///
/// The request only takes effect when `owner` matches the stored owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: ShortKey,
    pub owner: OwnerId,
}

impl DeleteRequest {
    pub fn new(key: ShortKey, owner: OwnerId) -> Self {
        Self { key, owner }
    }
}

/// High-water marks reported by a backend when it is opened.
///
/// Allocators seeded from these values never clash with anything the
/// backend already holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bootstrap {
    pub next_short_key: u64,
    pub next_owner_id: u64,
}

/// Aggregate counters for a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of records that are not deleted.
    pub urls: u64,
    /// Number of distinct owners that ever created a record.
    pub owners: u64,
}
