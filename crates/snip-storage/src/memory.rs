use crate::allocator_error;
use crate::index::Index;
use async_trait::async_trait;
use snip_allocator::Allocator;
use snip_core::{
    validate_owner, validate_url, Bootstrap, DeleteRequest, OwnerId, ReadStorage, Result,
    ShortKey, Stats, Storage, StorageError, UrlRecord,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory implementation of the [`Storage`] trait.
///
/// A single readers-writer lock guards the whole map: lookups and listings
/// run concurrently with each other, creates and deletes are exclusive.
/// Nothing survives a restart, so [`bootstrap`](ReadStorage::bootstrap)
/// always reports zero.
#[derive(Debug)]
pub struct InMemoryStorage {
    index: RwLock<Index>,
    keys: Allocator,
}

impl InMemoryStorage {
    /// Creates an empty storage whose first key is `0`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            keys: Allocator::new(0),
        }
    }

    async fn allocate(&self) -> Result<ShortKey> {
        self.keys
            .next()
            .await
            .map(ShortKey::new)
            .map_err(allocator_error)
    }
}

#[async_trait]
impl ReadStorage for InMemoryStorage {
    async fn lookup(&self, key: ShortKey) -> Result<String> {
        self.index.read().await.lookup(key)
    }

    async fn list_by_owner(&self, owner: OwnerId) -> Vec<UrlRecord> {
        self.index.read().await.list_by_owner(owner)
    }

    async fn stats(&self) -> Result<Stats> {
        Ok(self.index.read().await.stats())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn bootstrap(&self) -> Bootstrap {
        Bootstrap::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create(&self, original_url: &str, owner: OwnerId) -> Result<ShortKey> {
        validate_url(original_url)?;
        validate_owner(owner)?;

        let mut index = self.index.write().await;
        if let Some(existing) = index.key_for(original_url) {
            return Err(StorageError::Conflict(existing));
        }

        let key = self.allocate().await?;
        index.apply(key, original_url.to_owned(), owner, false);
        debug!(%key, %owner, "stored short url");
        Ok(key)
    }

    async fn create_batch(
        &self,
        original_urls: &[String],
        owner: OwnerId,
    ) -> Result<Vec<ShortKey>> {
        validate_owner(owner)?;
        for url in original_urls {
            validate_url(url)?;
        }

        let mut index = self.index.write().await;
        let mut staged: HashMap<&str, ShortKey> = HashMap::new();
        let mut keys = Vec::with_capacity(original_urls.len());

        // Nothing touches the index until every key is allocated.
        for url in original_urls {
            let existing = index
                .key_for(url)
                .or_else(|| staged.get(url.as_str()).copied());
            let key = match existing {
                Some(key) => key,
                None => {
                    let key = self.allocate().await?;
                    staged.insert(url.as_str(), key);
                    key
                }
            };
            keys.push(key);
        }

        let created = staged.len();
        for (url, key) in staged {
            index.apply(key, url.to_owned(), owner, false);
        }
        debug!(%owner, created, requested = original_urls.len(), "stored short url batch");
        Ok(keys)
    }

    async fn soft_delete(&self, requests: &[DeleteRequest]) -> Result<()> {
        let mut index = self.index.write().await;
        let mut marked = 0usize;
        for request in requests {
            if index.deletable(request).is_some() {
                index.mark_deleted(request.key);
                marked += 1;
            }
        }
        debug!(marked, requested = requests.len(), "soft deleted short urls");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.keys.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn owner(id: u64) -> OwnerId {
        OwnerId::new(id)
    }

    fn key(value: u64) -> ShortKey {
        ShortKey::new(value)
    }

    fn del(key: u64, owner: u64) -> DeleteRequest {
        DeleteRequest::new(ShortKey::new(key), OwnerId::new(owner))
    }

    #[tokio::test]
    async fn create_lookup_delete_scenario() {
        let repo = InMemoryStorage::new();

        assert_eq!(repo.create("http://a", owner(1)).await, Ok(key(0)));
        assert_eq!(repo.create("http://b", owner(1)).await, Ok(key(1)));
        assert_eq!(
            repo.create("http://a", owner(1)).await,
            Err(StorageError::Conflict(key(0)))
        );

        repo.soft_delete(&[del(0, 1)]).await.unwrap();

        assert_eq!(repo.lookup(key(0)).await, Err(StorageError::Gone(key(0))));
        assert_eq!(repo.lookup(key(1)).await.unwrap(), "http://b");
    }

    #[tokio::test]
    async fn lookup_unknown_key_is_not_found() {
        let repo = InMemoryStorage::new();

        assert_eq!(repo.lookup(key(5)).await, Err(StorageError::NotFound(key(5))));
    }

    #[tokio::test]
    async fn conflict_ignores_requesting_owner() {
        let repo = InMemoryStorage::new();
        repo.create("http://a", owner(1)).await.unwrap();

        let err = repo.create("http://a", owner(2)).await.unwrap_err();

        assert_eq!(err, StorageError::Conflict(key(0)));
        assert!(repo.list_by_owner(owner(2)).await.is_empty());
    }

    #[tokio::test]
    async fn deleted_url_still_conflicts() {
        let repo = InMemoryStorage::new();
        repo.create("http://a", owner(1)).await.unwrap();
        repo.soft_delete(&[del(0, 1)]).await.unwrap();

        let err = repo.create("http://a", owner(1)).await.unwrap_err();
        assert_eq!(err, StorageError::Conflict(key(0)));
    }

    #[tokio::test]
    async fn create_rejects_invalid_url() {
        let repo = InMemoryStorage::new();

        let err = repo.create("", owner(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl(_)));
        // No key was burned.
        assert_eq!(repo.create("http://a", owner(1)).await, Ok(key(0)));
    }

    #[tokio::test]
    async fn create_rejects_unissuable_owner() {
        let repo = InMemoryStorage::new();
        let last = OwnerId::new(u64::MAX);

        assert_eq!(
            repo.create("http://a", last).await,
            Err(StorageError::InvalidOwner(last))
        );
        assert_eq!(
            repo.create_batch(&["http://a".to_string()], last).await,
            Err(StorageError::InvalidOwner(last))
        );
        assert_eq!(repo.create("http://a", owner(1)).await, Ok(key(0)));
    }

    #[tokio::test]
    async fn batch_keys_follow_input_order() {
        let repo = InMemoryStorage::new();
        repo.create("http://existing", owner(7)).await.unwrap();

        let urls = vec![
            "http://one".to_string(),
            "http://existing".to_string(),
            "http://two".to_string(),
            "http://one".to_string(),
        ];
        let keys = repo.create_batch(&urls, owner(1)).await.unwrap();

        assert_eq!(keys, vec![key(1), key(0), key(2), key(1)]);
        assert_eq!(repo.lookup(key(2)).await.unwrap(), "http://two");

        let listed: Vec<_> = repo
            .list_by_owner(owner(1))
            .await
            .into_iter()
            .map(|record| record.key)
            .collect();
        assert_eq!(listed, vec![key(1), key(2)]);
    }

    #[tokio::test]
    async fn batch_with_invalid_url_stores_nothing() {
        let repo = InMemoryStorage::new();
        let urls = vec!["http://one".to_string(), "bad\nurl".to_string()];

        assert!(repo.create_batch(&urls, owner(1)).await.is_err());
        assert!(repo.list_by_owner(owner(1)).await.is_empty());
    }

    #[tokio::test]
    async fn batch_after_close_stores_nothing() {
        let repo = InMemoryStorage::new();
        repo.close().await.unwrap();

        let urls = vec!["http://one".to_string()];
        let err = repo.create_batch(&urls, owner(1)).await.unwrap_err();

        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(repo.list_by_owner(owner(1)).await.is_empty());
    }

    #[tokio::test]
    async fn soft_delete_skips_foreign_and_unknown_keys() {
        let repo = InMemoryStorage::new();
        repo.create("http://a", owner(1)).await.unwrap();
        repo.create("http://b", owner(2)).await.unwrap();

        repo.soft_delete(&[del(0, 2), del(1, 2), del(99, 2)])
            .await
            .unwrap();

        assert_eq!(repo.lookup(key(0)).await.unwrap(), "http://a");
        assert_eq!(repo.lookup(key(1)).await, Err(StorageError::Gone(key(1))));
    }

    #[tokio::test]
    async fn list_by_owner_excludes_deleted_and_foreign_records() {
        let repo = InMemoryStorage::new();
        repo.create("http://a", owner(1)).await.unwrap();
        repo.create("http://b", owner(1)).await.unwrap();
        repo.create("http://c", owner(2)).await.unwrap();
        repo.soft_delete(&[del(1, 1)]).await.unwrap();

        let records = repo.list_by_owner(owner(1)).await;

        assert_eq!(
            records,
            vec![UrlRecord {
                key: key(0),
                original_url: "http://a".to_string(),
                owner: owner(1),
                deleted: false,
            }]
        );
        assert!(repo.list_by_owner(owner(3)).await.is_empty());
    }

    #[tokio::test]
    async fn stats_and_bootstrap() {
        let repo = InMemoryStorage::new();
        assert_eq!(repo.bootstrap(), Bootstrap::default());

        repo.create("http://a", owner(1)).await.unwrap();
        repo.create("http://b", owner(2)).await.unwrap();
        repo.soft_delete(&[del(1, 2)]).await.unwrap();

        assert_eq!(repo.stats().await.unwrap(), Stats { urls: 1, owners: 2 });
        assert!(repo.ping().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_get_distinct_keys() {
        let repo = Arc::new(InMemoryStorage::new());
        let mut handles = vec![];

        for i in 0..20u64 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.create(&format!("https://example{i}.com"), OwnerId::new(i % 3))
                    .await
                    .unwrap()
            }));
        }

        let mut keys = HashSet::new();
        for handle in handles {
            keys.insert(handle.await.unwrap());
        }

        let expected: HashSet<ShortKey> = (0..20).map(ShortKey::new).collect();
        assert_eq!(keys, expected);
    }
}
