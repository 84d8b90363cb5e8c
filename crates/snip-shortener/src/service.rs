use crate::config::{Backend, Settings};
use crate::delete::{DeletionPipeline, PipelineSettings};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use snip_allocator::Allocator;
use snip_core::{OwnerId, ShortKey, Stats, Storage, StorageError};
use snip_storage::{AppendLogStorage, InMemoryStorage, MySqlStorage};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`ShortenerService::shorten`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortened {
    pub key: ShortKey,
    pub short_url: String,
    /// `true` when the URL was already stored and `key` is the existing key.
    pub conflict: bool,
}

/// One element of a batch shorten request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub correlation_id: String,
    pub original_url: String,
}

/// One element of a batch shorten response, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub correlation_id: String,
    pub short_url: String,
}

/// An entry of [`ShortenerService::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedUrl {
    pub short_url: String,
    pub original_url: String,
}

/// The operations the edge layer calls.
///
/// Wraps one storage backend, an owner id allocator seeded past every owner
/// the backend already knows, and the deletion pipeline.
pub struct ShortenerService {
    storage: Arc<dyn Storage>,
    owners: Allocator,
    base_url: String,
    deletions: DeletionPipeline,
}

impl ShortenerService {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        storage: Arc<dyn Storage>,
        base_url: impl Into<String>,
        pipeline: PipelineSettings,
    ) -> Self {
        let owners = Allocator::new(storage.bootstrap().next_owner_id);
        let deletions = DeletionPipeline::start(Arc::clone(&storage), pipeline);

        Self {
            storage,
            owners,
            base_url: base_url.into(),
            deletions,
        }
    }

    /// Opens the backend selected by `settings` and builds the service on it.
    pub async fn open(settings: &Settings) -> Result<Self> {
        let storage: Arc<dyn Storage> = match &settings.backend {
            Backend::Memory => Arc::new(InMemoryStorage::new()),
            Backend::Log(path) => Arc::new(AppendLogStorage::open(path).await?),
            Backend::MySql(dsn) => Arc::new(MySqlStorage::connect(dsn).await?),
        };

        let bootstrap = storage.bootstrap();
        info!(
            backend = %settings.backend.kind(),
            base_url = %settings.base_url,
            next_short_key = bootstrap.next_short_key,
            next_owner_id = bootstrap.next_owner_id,
            "opened storage"
        );

        Ok(Self::new(
            storage,
            settings.base_url.clone(),
            settings.pipeline.clone(),
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Shortens one URL. A URL that is already stored is not an error: the
    /// existing key comes back with `conflict` set.
    pub async fn shorten(&self, original_url: &str, owner: OwnerId) -> Result<Shortened> {
        let (key, conflict) = match self.storage.create(original_url, owner).await {
            Ok(key) => (key, false),
            Err(StorageError::Conflict(key)) => (key, true),
            Err(err) => return Err(err.into()),
        };

        debug!(%key, %owner, conflict, "shortened url");
        Ok(Shortened {
            key,
            short_url: key.to_url(&self.base_url),
            conflict,
        })
    }

    pub async fn shorten_batch(
        &self,
        items: Vec<BatchItem>,
        owner: OwnerId,
    ) -> Result<Vec<BatchResult>> {
        let urls: Vec<String> = items.iter().map(|item| item.original_url.clone()).collect();
        let keys = self.storage.create_batch(&urls, owner).await?;

        Ok(items
            .into_iter()
            .zip(keys)
            .map(|(item, key)| BatchResult {
                correlation_id: item.correlation_id,
                short_url: key.to_url(&self.base_url),
            })
            .collect())
    }

    /// Returns the original URL, or `NotFound` / `Gone`.
    pub async fn resolve(&self, key: ShortKey) -> Result<String> {
        Ok(self.storage.lookup(key).await?)
    }

    pub async fn list(&self, owner: OwnerId) -> Vec<ListedUrl> {
        self.storage
            .list_by_owner(owner)
            .await
            .into_iter()
            .map(|record| ListedUrl {
                short_url: record.key.to_url(&self.base_url),
                original_url: record.original_url,
            })
            .collect()
    }

    /// Queues a raw JSON delete payload. Returns how many keys were accepted;
    /// they are marked deleted asynchronously.
    pub fn delete(&self, raw: &str, owner: OwnerId) -> Result<usize> {
        Ok(self.deletions.submit_raw(raw, &self.base_url, owner)?)
    }

    /// Number of delete batches not yet committed or dropped.
    pub fn pending_deletes(&self) -> usize {
        self.deletions.pending()
    }

    /// Mints a fresh owner id.
    pub async fn register_owner(&self) -> Result<OwnerId> {
        let owner = OwnerId::new(self.owners.next().await?);
        debug!(%owner, "registered owner");
        Ok(owner)
    }

    /// `true` iff `owner` was issued by this service or predates it in the
    /// backend.
    pub fn is_registered_owner(&self, owner: OwnerId) -> bool {
        self.owners.is_issued(owner.get())
    }

    pub async fn stats(&self) -> Result<Stats> {
        Ok(self.storage.stats().await?)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.storage.ping().await?)
    }

    /// Closes the deletion pipeline, the owner allocator and the backend,
    /// in that order.
    pub async fn close(&self) -> Result<()> {
        self.deletions.close().await;
        self.owners.shutdown();
        self.storage.close().await?;
        info!("shortener service closed");
        Ok(())
    }
}
