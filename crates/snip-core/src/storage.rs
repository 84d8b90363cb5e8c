use crate::error::{Result, StorageError};
use crate::ids::{OwnerId, ShortKey};
use crate::record::{Bootstrap, DeleteRequest, Stats, UrlRecord};
use async_trait::async_trait;

/// A read-only view of a storage backend.
#[async_trait]
pub trait ReadStorage: Send + Sync + 'static {
    /// Resolves a short key to its original URL.
    ///
    /// Fails with [`StorageError::NotFound`] if the key was never issued and
    /// with [`StorageError::Gone`] if the record is marked deleted.
    async fn lookup(&self, key: ShortKey) -> Result<String>;

    /// Returns the owner's records that are not deleted, ordered by key.
    ///
    /// Never fails: an owner without records, or a backend that cannot be
    /// read right now, yields an empty list.
    async fn list_by_owner(&self, owner: OwnerId) -> Vec<UrlRecord>;

    /// Returns aggregate counters for the backend.
    async fn stats(&self) -> Result<Stats>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// High-water marks computed when the backend was opened.
    fn bootstrap(&self) -> Bootstrap;
}

#[async_trait]
pub trait Storage: ReadStorage {
    /// Shortens `original_url` on behalf of `owner`.
    ///
    /// Creation is idempotent per original URL: if the URL is already stored
    /// this returns `Err(Conflict(existing_key))` and stores nothing.
    async fn create(&self, original_url: &str, owner: OwnerId) -> Result<ShortKey>;

    /// Shortens every URL in `original_urls`, returning keys in input order.
    ///
    /// URLs that are already stored (or repeated within the batch) resolve
    /// to their existing key. Either every new record becomes visible or,
    /// on error, none does.
    async fn create_batch(&self, original_urls: &[String], owner: OwnerId)
        -> Result<Vec<ShortKey>>;

    /// Marks the requested records deleted.
    ///
    /// Requests whose owner does not match the stored owner, or whose key
    /// does not exist, are skipped without failing the batch.
    async fn soft_delete(&self, requests: &[DeleteRequest]) -> Result<()>;

    /// Releases file handles, connections and background tasks.
    async fn close(&self) -> Result<()>;
}

/// Rejects URLs that cannot be stored by every backend.
pub fn validate_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(StorageError::InvalidUrl("URL cannot be empty".to_string()));
    }
    if url.contains(['\r', '\n']) {
        return Err(StorageError::InvalidUrl(format!(
            "URL must not contain line breaks: {:?}",
            url
        )));
    }
    Ok(())
}

/// Rejects owner ids no allocator can hand out.
///
/// An allocator stops at `u64::MAX`, so that value never names a real owner
/// and a backend holding it could not report a successor on reopen.
pub fn validate_owner(owner: OwnerId) -> Result<()> {
    if owner.get() == u64::MAX {
        return Err(StorageError::InvalidOwner(owner));
    }
    Ok(())
}
