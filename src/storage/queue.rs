//! Durable priority URL queue backed by sled.
//!
//! Rows live in two trees keyed by `[priority][id]` (big-endian id), so the
//! first key of the `waiting` tree is exactly the next row to pop:
//! priority ascending, insertion id ascending within a priority. A third
//! tree maps each URL to its state and row key, giving URL uniqueness and
//! O(1) lookup/finish.
//!
//! Pop and collect serialize on a process-level mutex; sled is an embedded
//! single-process store, so the mutex is what `SELECT ... FOR UPDATE` is to
//! a relational backing: no two callers can ever receive the same row.

use crate::config::Config;
use crate::storage::{
    now_millis, Filter, Priority, Queue, QueueItem, StorageError, StorageResult, UrlState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const KEY_LEN: usize = 9;

fn item_key(priority: Priority, id: u64) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[0] = priority.as_u8();
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

fn state_byte(state: UrlState) -> u8 {
    match state {
        UrlState::Processing => 1,
        _ => 0,
    }
}

/// `urls` tree value: state byte followed by the row key.
fn url_entry(state: UrlState, key: &[u8; KEY_LEN]) -> [u8; KEY_LEN + 1] {
    let mut entry = [0u8; KEY_LEN + 1];
    entry[0] = state_byte(state);
    entry[1..].copy_from_slice(key);
    entry
}

fn encode(item: &QueueItem) -> StorageResult<Vec<u8>> {
    let bytes = rkyv::to_bytes::<_, 1024>(item)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize: {}", e)))?;
    Ok(bytes.to_vec())
}

fn decode(bytes: &[u8]) -> StorageResult<QueueItem> {
    let owned = bytes.to_vec();
    unsafe { rkyv::from_bytes_unchecked(&owned) }
        .map_err(|e| StorageError::Serialization(format!("Failed to deserialize: {}", e)))
}

pub struct SledQueue {
    db: sled::Db,
    waiting: sled::Tree,
    processing: sled::Tree,
    urls: sled::Tree,
    filter: Arc<dyn Filter>,
    timeout: Duration,
    // Serializes pop/collect/finish so row reads and state updates are one
    // atomic step per caller.
    op_lock: Mutex<()>,
}

impl SledQueue {
    /// Open or create a queue database at the given directory. Finished
    /// URLs are recorded in `filter`; rows stuck in Processing longer than
    /// `timeout` become eligible for [`Queue::collect`].
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        filter: Arc<dyn Filter>,
        timeout: Duration,
    ) -> StorageResult<Self> {
        let db = sled::open(data_dir)?;
        let waiting = db.open_tree("waiting")?;
        let processing = db.open_tree("processing")?;
        let urls = db.open_tree("urls")?;
        Ok(Self {
            db,
            waiting,
            processing,
            urls,
            filter,
            timeout,
            op_lock: Mutex::new(()),
        })
    }

    fn tree_for(&self, state: UrlState) -> Option<&sled::Tree> {
        match state {
            UrlState::Waiting => Some(&self.waiting),
            UrlState::Processing => Some(&self.processing),
            UrlState::NotExist => None,
        }
    }
}

impl Queue for SledQueue {
    fn add_direct(&self, url: &str, priority: Priority) -> StorageResult<bool> {
        if url.len() > Config::MAX_RECORD_BYTES {
            return Err(StorageError::RecordTooLarge(Config::MAX_RECORD_BYTES));
        }

        let id = self.db.generate_id()?;
        let key = item_key(priority, id);

        // Claim the URL first; losing the race means a duplicate row.
        let claim = self.urls.compare_and_swap(
            url.as_bytes(),
            None as Option<&[u8]>,
            Some(&url_entry(UrlState::Waiting, &key)[..]),
        )?;
        if claim.is_err() {
            return Ok(false);
        }

        let now = now_millis();
        let item = QueueItem {
            id,
            url: url.to_string(),
            state: UrlState::Waiting,
            priority,
            created: now,
            updated: now,
        };
        self.waiting.insert(key, encode(&item)?)?;
        Ok(true)
    }

    fn add(&self, url: &str, priority: Priority) -> StorageResult<bool> {
        if self.filter.contains(url)? {
            return Ok(false);
        }
        self.add_direct(url, priority)
    }

    fn pop(&self) -> StorageResult<QueueItem> {
        let _guard = self.op_lock.lock();

        let (key, value) = match self.waiting.first()? {
            Some(entry) => entry,
            None => return Err(StorageError::EndOfStream),
        };

        let mut item = decode(&value)?;
        item.state = UrlState::Processing;
        item.updated = now_millis();

        self.waiting.remove(&key)?;
        self.processing.insert(&key, encode(&item)?)?;
        let mut row_key = [0u8; KEY_LEN];
        row_key.copy_from_slice(&key);
        self.urls.insert(
            item.url.as_bytes(),
            &url_entry(UrlState::Processing, &row_key)[..],
        )?;

        Ok(item)
    }

    fn length(&self, state: UrlState) -> StorageResult<HashMap<Priority, usize>> {
        let mut counts = HashMap::new();
        let tree = match self.tree_for(state) {
            Some(tree) => tree,
            None => return Ok(counts),
        };
        for result in tree.iter() {
            let (key, _) = result?;
            if let Some(priority) = key.first().copied().and_then(Priority::from_u8) {
                *counts.entry(priority).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn truncate(&self) -> StorageResult<()> {
        let _guard = self.op_lock.lock();
        self.waiting.clear()?;
        self.processing.clear()?;
        self.urls.clear()?;
        self.filter.truncate()?;
        Ok(())
    }

    fn collect(&self) -> StorageResult<Vec<QueueItem>> {
        let _guard = self.op_lock.lock();
        let now = now_millis();
        let timeout_ms = self.timeout.as_millis() as u64;

        let mut expired = Vec::new();
        for result in self.processing.iter() {
            let (key, value) = result?;
            let item = decode(&value)?;
            if now.saturating_sub(item.updated) > timeout_ms {
                expired.push((key, item));
            }
        }

        // Delete in pages so no single batch grows unbounded.
        for page in expired.chunks(Config::COLLECT_PAGE_SIZE) {
            let mut rows = sled::Batch::default();
            let mut index = sled::Batch::default();
            for (key, item) in page {
                rows.remove(key.clone());
                index.remove(item.url.as_bytes());
            }
            self.processing.apply_batch(rows)?;
            self.urls.apply_batch(index)?;
        }

        if !expired.is_empty() {
            debug!(reclaimed = expired.len(), "collected timed-out processing rows");
        }
        Ok(expired.into_iter().map(|(_, item)| item).collect())
    }

    fn finish(&self, url: &str) -> StorageResult<bool> {
        // Filter first: a crash after this point leaves the row behind, but
        // the URL can never be re-added through the filtered path.
        self.filter.insert(url)?;

        let _guard = self.op_lock.lock();
        let entry = match self.urls.remove(url.as_bytes())? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let tree = if entry[0] == 1 {
            &self.processing
        } else {
            &self.waiting
        };
        let removed = tree.remove(&entry[1..])?;
        Ok(removed.is_some())
    }

    fn lookup(&self, url: &str) -> StorageResult<UrlState> {
        match self.urls.get(url.as_bytes())? {
            Some(entry) if entry[0] == 1 => Ok(UrlState::Processing),
            Some(_) => Ok(UrlState::Waiting),
            None => Ok(UrlState::NotExist),
        }
    }
}

impl Drop for SledQueue {
    fn drop(&mut self) {
        let _ = self.db.flush();
    }
}
