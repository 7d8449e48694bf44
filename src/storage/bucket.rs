//! Durable key/value store backed by sled.
//!
//! Holds engine control flags (the first-run marker) and whatever side data
//! user handlers want to stash. Keys are unique; `set` overwrites.

use crate::config::Config;
use crate::storage::{now_millis, Bucket, StorageError, StorageResult};
use rkyv::{Archive, Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct BucketEntry {
    value: String,
    created: u64,
    updated: u64,
}

fn encode(entry: &BucketEntry) -> StorageResult<Vec<u8>> {
    let bytes = rkyv::to_bytes::<_, 1024>(entry)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize: {}", e)))?;
    Ok(bytes.to_vec())
}

fn decode(bytes: &[u8]) -> StorageResult<BucketEntry> {
    let owned = bytes.to_vec();
    unsafe { rkyv::from_bytes_unchecked(&owned) }
        .map_err(|e| StorageError::Serialization(format!("Failed to deserialize: {}", e)))
}

pub struct SledBucket {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledBucket {
    /// Open or create a bucket database at the given directory.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> StorageResult<Self> {
        let db = sled::open(data_dir)?;
        let tree = db.open_tree("bucket")?;
        Ok(Self { db, tree })
    }

    fn check_len(text: &str) -> StorageResult<()> {
        if text.len() > Config::MAX_RECORD_BYTES {
            return Err(StorageError::RecordTooLarge(Config::MAX_RECORD_BYTES));
        }
        Ok(())
    }
}

impl Bucket for SledBucket {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        Self::check_len(key)?;
        Self::check_len(value)?;

        let now = now_millis();
        // Overwrite keeps the original created timestamp.
        let created = match self.tree.get(key.as_bytes())? {
            Some(existing) => decode(&existing)?.created,
            None => now,
        };
        let entry = BucketEntry {
            value: value.to_string(),
            created,
            updated: now,
        };
        self.tree.insert(key.as_bytes(), encode(&entry)?)?;
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<String> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?.value),
            None => Err(StorageError::NotExist),
        }
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        match self.tree.remove(key.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(StorageError::NotExist),
        }
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for result in self.tree.iter() {
            let (key, _) = result?;
            if let Ok(key) = String::from_utf8(key.to_vec()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn truncate(&self) -> StorageResult<()> {
        self.tree.clear()?;
        Ok(())
    }
}

impl Drop for SledBucket {
    fn drop(&mut self) {
        let _ = self.db.flush();
    }
}
