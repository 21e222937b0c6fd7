use crate::error::Result;
use crate::models::TicketId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    blob: Vec<u8>,
    stored_at: DateTime<Utc>,
}

/// Persistent key/value store for contract PDFs, keyed `ticket:<id>`.
///
/// Entries survive process restarts and are only removed explicitly.
#[derive(Clone)]
pub struct ArtifactCache {
    db: sled::Db,
}

impl ArtifactCache {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Cache key for a ticket's contract
    #[must_use]
    pub fn ticket_key(ticket_id: TicketId) -> String {
        format!("ticket:{ticket_id}")
    }

    /// Store `blob` under `key`, replacing any previous entry.
    pub fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        let entry = CacheEntry {
            blob: blob.to_vec(),
            stored_at: Utc::now(),
        };

        let data = bincode::serialize(&entry)?;
        self.db.insert(key.as_bytes(), data)?;
        self.db.flush()?;

        Ok(())
    }

    /// Blob stored under `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entry(key)?.map(|entry| entry.blob))
    }

    /// When the blob under `key` was written.
    pub fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entry(key)?.map(|entry| entry.stored_at))
    }

    /// Remove `key`; missing keys are fine.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }

    fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        let key = ArtifactCache::ticket_key(7);
        assert_eq!(key, "ticket:7");

        assert_eq!(cache.get(&key).unwrap(), None);
        cache.put(&key, b"%PDF-1.4 fake").unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(b"%PDF-1.4 fake".to_vec()));
        assert!(cache.stored_at(&key).unwrap().is_some());

        cache.delete(&key).unwrap();
        assert_eq!(cache.get(&key).unwrap(), None);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = ArtifactCache::open(dir.path()).unwrap();
            cache.put("ticket:1", b"one").unwrap();
        }
        let reopened = ArtifactCache::open(dir.path()).unwrap();
        assert_eq!(reopened.get("ticket:1").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn test_last_write_wins_and_keys_are_independent() {
        let dir = tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        cache.put("ticket:1", b"first").unwrap();
        cache.put("ticket:2", b"other").unwrap();
        cache.put("ticket:1", b"second").unwrap();
        assert_eq!(cache.get("ticket:1").unwrap(), Some(b"second".to_vec()));
        assert_eq!(cache.get("ticket:2").unwrap(), Some(b"other".to_vec()));

        cache.clear().unwrap();
        assert_eq!(cache.get("ticket:2").unwrap(), None);
    }
}
