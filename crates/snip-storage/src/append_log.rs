use crate::allocator_error;
use crate::index::Index;
use async_trait::async_trait;
use snip_allocator::Allocator;
use snip_core::{
    validate_owner, validate_url, Bootstrap, DeleteRequest, OwnerId, ReadStorage, Result,
    ShortKey, Stats, Storage, StorageError, UrlRecord,
};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const FIELD_SEPARATOR: char = '|';

/// One line of the log: `owner|key|original_url|deleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogLine {
    owner: OwnerId,
    key: ShortKey,
    original_url: String,
    deleted: bool,
}

impl LogLine {
    fn render(&self) -> String {
        format!(
            "{owner}{sep}{key}{sep}{url}{sep}{deleted}\n",
            owner = self.owner,
            key = self.key,
            url = self.original_url,
            deleted = self.deleted,
            sep = FIELD_SEPARATOR,
        )
    }

    /// Parses a line without its terminator. The URL may itself contain the
    /// separator, so the two numeric fields are split from the left and the
    /// flag from the right.
    fn parse(line_no: usize, line: &str) -> Result<Self> {
        let malformed = |reason: String| StorageError::MalformedRecord {
            line: line_no,
            reason,
        };
        let missing = || malformed("expected 4 fields".to_string());

        let (owner, rest) = line.split_once(FIELD_SEPARATOR).ok_or_else(missing)?;
        let (key, rest) = rest.split_once(FIELD_SEPARATOR).ok_or_else(missing)?;
        let (original_url, deleted) = rest.rsplit_once(FIELD_SEPARATOR).ok_or_else(missing)?;

        let owner = owner
            .parse::<OwnerId>()
            .map_err(|e| malformed(format!("owner id {owner:?}: {e}")))?;
        let key = key
            .parse::<ShortKey>()
            .map_err(|e| malformed(format!("short key {key:?}: {e}")))?;
        let deleted = match deleted {
            "true" => true,
            "false" => false,
            other => return Err(malformed(format!("deleted flag {other:?}"))),
        };
        if original_url.is_empty() {
            return Err(malformed("empty original url".to_string()));
        }

        Ok(Self {
            owner,
            key,
            original_url: original_url.to_string(),
            deleted,
        })
    }
}

/// Where appended lines go. Besides writing, the log needs the current size
/// and the ability to cut a failed append back off.
#[async_trait]
trait LogSink: AsyncWrite + Unpin + Send + Sync + Debug {
    async fn size(&self) -> io::Result<u64>;

    async fn truncate(&self, size: u64) -> io::Result<()>;

    async fn sync(&self) -> io::Result<()>;
}

#[async_trait]
impl LogSink for File {
    async fn size(&self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn truncate(&self, size: u64) -> io::Result<()> {
        self.set_len(size).await
    }

    async fn sync(&self) -> io::Result<()> {
        self.sync_all().await
    }
}

#[derive(Debug)]
struct LogState {
    /// `None` once the storage has been closed.
    file: Option<Box<dyn LogSink>>,
    index: Index,
}

impl LogState {
    fn parts(&mut self) -> Result<(&mut dyn LogSink, &mut Index)> {
        match self.file.as_mut() {
            Some(file) => Ok((file.as_mut(), &mut self.index)),
            None => Err(StorageError::Unavailable("append log is closed".to_string())),
        }
    }
}

/// Append-only text file implementation of the [`Storage`] trait.
///
/// Every create appends one line; a soft delete appends a superseding line
/// for the same key with the flag set. The whole file is replayed into an
/// in-memory index at [`open`](Self::open), where the last line for a key
/// wins. A single mutex serializes every read and append.
#[derive(Debug)]
pub struct AppendLogStorage {
    path: PathBuf,
    state: Mutex<LogState>,
    keys: Allocator,
    bootstrap: Bootstrap,
}

impl AppendLogStorage {
    /// Opens (creating if needed) the log at `path` and replays it.
    ///
    /// Fails with [`StorageError::MalformedRecord`] if any line cannot be
    /// parsed. Must be called from within a Tokio runtime.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (index, bootstrap, records) = replay(&path).await?;
        info!(
            path = %path.display(),
            records,
            next_short_key = bootstrap.next_short_key,
            next_owner_id = bootstrap.next_owner_id,
            "opened append log storage"
        );

        Ok(Self {
            keys: Allocator::new(bootstrap.next_short_key),
            state: Mutex::new(LogState {
                file: Some(Box::new(file)),
                index,
            }),
            path,
            bootstrap,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn allocate(&self) -> Result<ShortKey> {
        self.keys
            .next()
            .await
            .map(ShortKey::new)
            .map_err(allocator_error)
    }
}

async fn replay(path: &Path) -> Result<(Index, Bootstrap, usize)> {
    let mut lines = BufReader::new(File::open(path).await?).lines();
    let mut index = Index::default();
    let mut bootstrap = Bootstrap::default();
    let mut records = 0;
    let mut line_no = 0;

    loop {
        line_no += 1;
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                return Err(StorageError::MalformedRecord {
                    line: line_no,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if line.is_empty() {
            continue;
        }

        let record = LogLine::parse(line_no, &line)?;
        records += 1;
        let next_key = successor(line_no, "short key", record.key.get())?;
        let next_owner = successor(line_no, "owner id", record.owner.get())?;
        bootstrap.next_short_key = bootstrap.next_short_key.max(next_key);
        bootstrap.next_owner_id = bootstrap.next_owner_id.max(next_owner);
        index.apply(record.key, record.original_url, record.owner, record.deleted);
    }

    Ok((index, bootstrap, records))
}

/// An id at `u64::MAX` cannot have been issued and leaves nothing to resume
/// from.
fn successor(line_no: usize, field: &str, value: u64) -> Result<u64> {
    value
        .checked_add(1)
        .ok_or_else(|| StorageError::MalformedRecord {
            line: line_no,
            reason: format!("{field} {value} leaves no successor"),
        })
}

/// Appends `payload` as one unit. On failure the bytes written by this call
/// are cut off again so no partial line remains.
async fn append(file: &mut dyn LogSink, payload: &str) -> Result<()> {
    let start = file.size().await?;
    let written = write_payload(file, payload.as_bytes()).await;

    if let Err(err) = written {
        if let Err(rollback) = file.truncate(start).await {
            warn!(error = %rollback, "failed to roll back partial append");
        }
        return Err(err.into());
    }
    Ok(())
}

async fn write_payload(file: &mut dyn LogSink, payload: &[u8]) -> io::Result<()> {
    file.write_all(payload).await?;
    file.flush().await
}

#[async_trait]
impl ReadStorage for AppendLogStorage {
    async fn lookup(&self, key: ShortKey) -> Result<String> {
        self.state.lock().await.index.lookup(key)
    }

    async fn list_by_owner(&self, owner: OwnerId) -> Vec<UrlRecord> {
        self.state.lock().await.index.list_by_owner(owner)
    }

    async fn stats(&self) -> Result<Stats> {
        Ok(self.state.lock().await.index.stats())
    }

    async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.parts()?;
        tokio::fs::metadata(&self.path).await?;
        Ok(())
    }

    fn bootstrap(&self) -> Bootstrap {
        self.bootstrap
    }
}

#[async_trait]
impl Storage for AppendLogStorage {
    async fn create(&self, original_url: &str, owner: OwnerId) -> Result<ShortKey> {
        validate_url(original_url)?;
        validate_owner(owner)?;

        let mut state = self.state.lock().await;
        let (file, index) = state.parts()?;
        if let Some(existing) = index.key_for(original_url) {
            return Err(StorageError::Conflict(existing));
        }

        let key = self.allocate().await?;
        let line = LogLine {
            owner,
            key,
            original_url: original_url.to_owned(),
            deleted: false,
        };
        append(file, &line.render()).await?;
        index.apply(key, line.original_url, owner, false);

        debug!(%key, %owner, "appended short url");
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

        let mut state = self.state.lock().await;
        let (file, index) = state.parts()?;
        let mut staged: HashMap<&str, ShortKey> = HashMap::new();
        let mut lines = Vec::new();
        let mut keys = Vec::with_capacity(original_urls.len());

        for url in original_urls {
            let existing = index
                .key_for(url)
                .or_else(|| staged.get(url.as_str()).copied());
            let key = match existing {
                Some(key) => key,
                None => {
                    let key = self.allocate().await?;
                    staged.insert(url.as_str(), key);
                    lines.push(LogLine {
                        owner,
                        key,
                        original_url: url.clone(),
                        deleted: false,
                    });
                    key
                }
            };
            keys.push(key);
        }

        if !lines.is_empty() {
            let payload: String = lines.iter().map(LogLine::render).collect();
            append(file, &payload).await?;
        }
        let created = lines.len();
        for line in lines {
            index.apply(line.key, line.original_url, owner, false);
        }

        debug!(%owner, created, requested = original_urls.len(), "appended short url batch");
        Ok(keys)
    }

    async fn soft_delete(&self, requests: &[DeleteRequest]) -> Result<()> {
        let mut state = self.state.lock().await;
        let (file, index) = state.parts()?;
        let mut seen = HashSet::new();

        let superseding: Vec<LogLine> = requests
            .iter()
            .filter_map(|request| index.deletable(request))
            .filter(|record| seen.insert(record.key))
            .map(|record| LogLine {
                owner: record.owner,
                key: record.key,
                original_url: record.original_url,
                deleted: true,
            })
            .collect();

        if !superseding.is_empty() {
            let payload: String = superseding.iter().map(LogLine::render).collect();
            append(file, &payload).await?;
        }
        for line in &superseding {
            index.mark_deleted(line.key);
        }

        debug!(
            marked = superseding.len(),
            requested = requests.len(),
            "appended soft deletes"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.keys.shutdown();
        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.sync().await?;
            info!(path = %self.path.display(), "closed append log storage");
        }
        Ok(())
    }
}
