use snip_core::{DeleteRequest, OwnerId, ShortKey, Stats, StorageError, UrlRecord};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
struct Entry {
    original_url: String,
    owner: OwnerId,
    deleted: bool,
}

impl Entry {
    fn to_record(&self, key: ShortKey) -> UrlRecord {
        UrlRecord {
            key,
            original_url: self.original_url.clone(),
            owner: self.owner,
            deleted: self.deleted,
        }
    }
}

/// The key and URL lookup tables shared by the map and log backends.
///
/// Callers provide the locking.
#[derive(Debug, Default)]
pub(crate) struct Index {
    entries: BTreeMap<ShortKey, Entry>,
    by_url: HashMap<String, ShortKey>,
}

impl Index {
    pub(crate) fn key_for(&self, original_url: &str) -> Option<ShortKey> {
        self.by_url.get(original_url).copied()
    }

    /// Stores or supersedes the record for `key`.
    pub(crate) fn apply(
        &mut self,
        key: ShortKey,
        original_url: String,
        owner: OwnerId,
        deleted: bool,
    ) {
        if let Some(previous) = self.entries.get(&key) {
            if previous.original_url != original_url
                && self.by_url.get(&previous.original_url) == Some(&key)
            {
                self.by_url.remove(&previous.original_url);
            }
        }
        self.by_url.insert(original_url.clone(), key);
        self.entries.insert(
            key,
            Entry {
                original_url,
                owner,
                deleted,
            },
        );
    }

    pub(crate) fn lookup(&self, key: ShortKey) -> Result<String, StorageError> {
        match self.entries.get(&key) {
            None => Err(StorageError::NotFound(key)),
            Some(entry) if entry.deleted => Err(StorageError::Gone(key)),
            Some(entry) => Ok(entry.original_url.clone()),
        }
    }

    pub(crate) fn list_by_owner(&self, owner: OwnerId) -> Vec<UrlRecord> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner && !entry.deleted)
            .map(|(key, entry)| entry.to_record(*key))
            .collect()
    }

    /// Returns the live record a delete request would mark, if any.
    pub(crate) fn deletable(&self, request: &DeleteRequest) -> Option<UrlRecord> {
        self.entries
            .get(&request.key)
            .filter(|entry| entry.owner == request.owner && !entry.deleted)
            .map(|entry| entry.to_record(request.key))
    }

    pub(crate) fn mark_deleted(&mut self, key: ShortKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.deleted = true;
        }
    }

    pub(crate) fn stats(&self) -> Stats {
        let urls = self.entries.values().filter(|entry| !entry.deleted).count();
        let owners: HashSet<OwnerId> = self.entries.values().map(|entry| entry.owner).collect();
        Stats {
            urls: urls as u64,
            owners: owners.len() as u64,
        }
    }
}
