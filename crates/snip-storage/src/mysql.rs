use async_trait::async_trait;
use snip_core::{
    validate_owner, validate_url, Bootstrap, DeleteRequest, OwnerId, ReadStorage, Result,
    ShortKey, Stats, Storage, StorageError, UrlRecord,
};
use sqlx::{MySql, MySqlConnection, MySqlPool, QueryBuilder, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// DDL for the single `short_urls` table.
pub const SCHEMA: &str = include_str!("../ddl/mysql/short_urls.sql");

/// MySQL implementation of the storage contract.
///
/// Keys come from the table's `AUTO_INCREMENT` column, so unlike the map and
/// log backends no [`Allocator`](snip_allocator::Allocator) is involved. The
/// unique constraint on `original_url` provides create idempotency; batch
/// creates and soft deletes each run inside one transaction.
#[derive(Debug, Clone)]
pub struct MySqlStorage {
    pool: MySqlPool,
    bootstrap: Bootstrap,
}

enum Inserted {
    Created(ShortKey),
    Existing(ShortKey),
}

impl Inserted {
    fn key(&self) -> ShortKey {
        match self {
            Inserted::Created(key) | Inserted::Existing(key) => *key,
        }
    }
}

impl MySqlStorage {
    /// Creates a storage from an existing pool, scanning the table for its
    /// high-water marks. The schema must already exist.
    pub async fn new(pool: MySqlPool) -> Result<Self> {
        let bootstrap = scan_bootstrap(&pool).await?;
        info!(
            next_short_key = bootstrap.next_short_key,
            next_owner_id = bootstrap.next_owner_id,
            "opened mysql storage"
        );
        Ok(Self { pool, bootstrap })
    }

    /// Opens a new connection pool, creates the schema if missing and scans
    /// the table.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPool::connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Self::migrate(&pool).await?;
        Self::new(pool).await
    }

    /// Creates the `short_urls` table and its owner index if they do not exist.
    pub async fn migrate(pool: &MySqlPool) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

async fn scan_bootstrap(pool: &MySqlPool) -> Result<Bootstrap> {
    let (max_key, max_owner): (Option<u64>, Option<u64>) =
        sqlx::query_as("SELECT MAX(short_key), MAX(owner_id) FROM short_urls")
            .fetch_one(pool)
            .await
            .map_err(map_sqlx_error)?;

    Ok(Bootstrap {
        next_short_key: successor(max_key, "short_key")?,
        next_owner_id: successor(max_owner, "owner_id")?,
    })
}

fn successor(max: Option<u64>, column: &str) -> Result<u64> {
    match max {
        None => Ok(0),
        Some(max) => max.checked_add(1).ok_or_else(|| {
            StorageError::InvalidData(format!("{column} {max} leaves no successor"))
        }),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

/// Inserts `original_url`, or finds the key already holding it.
///
/// The lookup is a locking read so that, inside a transaction, it sees a row
/// committed after the transaction's snapshot was taken.
async fn insert_url(
    conn: &mut MySqlConnection,
    original_url: &str,
    owner: OwnerId,
) -> Result<Inserted> {
    let result = sqlx::query("INSERT INTO short_urls (original_url, owner_id) VALUES (?, ?)")
        .bind(original_url)
        .bind(owner.get())
        .execute(&mut *conn)
        .await;

    match result {
        Ok(done) => Ok(Inserted::Created(ShortKey::new(done.last_insert_id()))),
        Err(err) if is_unique_violation(&err) => {
            let existing: u64 = sqlx::query_scalar(
                "SELECT short_key FROM short_urls WHERE original_url = ? FOR SHARE",
            )
            .bind(original_url)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
            Ok(Inserted::Existing(ShortKey::new(existing)))
        }
        Err(err) => Err(map_sqlx_error(err)),
    }
}

async fn rollback(tx: Transaction<'_, MySql>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "failed to roll back transaction");
    }
}

#[async_trait]
impl ReadStorage for MySqlStorage {
    async fn lookup(&self, key: ShortKey) -> Result<String> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT original_url, deleted FROM short_urls WHERE short_key = ?")
                .bind(key.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        match row {
            None => Err(StorageError::NotFound(key)),
            Some((_, true)) => Err(StorageError::Gone(key)),
            Some((original_url, false)) => Ok(original_url),
        }
    }

    async fn list_by_owner(&self, owner: OwnerId) -> Vec<UrlRecord> {
        let rows: std::result::Result<Vec<(u64, String)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT short_key, original_url
            FROM short_urls
            WHERE owner_id = ?
              AND deleted = FALSE
            ORDER BY short_key
            "#,
        )
        .bind(owner.get())
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .into_iter()
                .map(|(key, original_url)| UrlRecord {
                    key: ShortKey::new(key),
                    original_url,
                    owner,
                    deleted: false,
                })
                .collect(),
            Err(err) => {
                warn!(%owner, error = %err, "failed to list short urls");
                Vec::new()
            }
        }
    }

    async fn stats(&self) -> Result<Stats> {
        let (urls, owners): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
              (SELECT COUNT(*) FROM short_urls WHERE deleted = FALSE),
              (SELECT COUNT(DISTINCT owner_id) FROM short_urls)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Stats {
            urls: urls.max(0) as u64,
            owners: owners.max(0) as u64,
        })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    fn bootstrap(&self) -> Bootstrap {
        self.bootstrap
    }
}

#[async_trait]
impl Storage for MySqlStorage {
    async fn create(&self, original_url: &str, owner: OwnerId) -> Result<ShortKey> {
        validate_url(original_url)?;
        validate_owner(owner)?;

        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        match insert_url(&mut conn, original_url, owner).await? {
            Inserted::Created(key) => {
                debug!(%key, %owner, "inserted short url");
                Ok(key)
            }
            Inserted::Existing(key) => Err(StorageError::Conflict(key)),
        }
    }

    /// Runs every insert in one transaction. The statement is prepared once
    /// per connection and reused for each element.
    async fn create_batch(
        &self,
        original_urls: &[String],
        owner: OwnerId,
    ) -> Result<Vec<ShortKey>> {
        validate_owner(owner)?;
        for url in original_urls {
            validate_url(url)?;
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut keys = Vec::with_capacity(original_urls.len());

        for url in original_urls {
            match insert_url(&mut tx, url, owner).await {
                Ok(inserted) => keys.push(inserted.key()),
                Err(err) => {
                    rollback(tx).await;
                    return Err(err);
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(%owner, requested = original_urls.len(), "inserted short url batch");
        Ok(keys)
    }

    /// Issues one bulk `UPDATE` per distinct owner in the batch, all inside
    /// one transaction.
    async fn soft_delete(&self, requests: &[DeleteRequest]) -> Result<()> {
        let mut by_owner: BTreeMap<OwnerId, Vec<u64>> = BTreeMap::new();
        for request in requests {
            by_owner.entry(request.owner).or_default().push(request.key.get());
        }
        if by_owner.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut marked = 0;

        for (owner, keys) in &by_owner {
            let mut query: QueryBuilder<MySql> =
                QueryBuilder::new("UPDATE short_urls SET deleted = TRUE WHERE owner_id = ");
            query.push_bind(owner.get());
            query.push(" AND deleted = FALSE AND short_key IN (");
            let mut separated = query.separated(", ");
            for key in keys {
                separated.push_bind(*key);
            }
            separated.push_unseparated(")");

            match query.build().execute(&mut *tx).await {
                Ok(done) => marked += done.rows_affected(),
                Err(err) => {
                    rollback(tx).await;
                    return Err(map_sqlx_error(err));
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(marked, requested = requests.len(), "soft deleted short urls");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
