//! Storage contracts for the crawler engine.
//!
//! The engine talks to three durable collaborators and nothing else:
//! - [`Queue`]: priority URL queue with timeout reclamation
//! - [`Bucket`]: small key/value store for control flags and handler side data
//! - [`Filter`]: approximate membership set of completed URLs
//!
//! The bundled implementations are sled-backed ([`queue::SledQueue`],
//! [`bucket::SledBucket`]) and a memory-mapped cuckoo filter
//! ([`filter::CuckooFilter`]), but the reactor only ever sees these traits.

pub mod bucket;
pub mod filter;
pub mod queue;

pub use bucket::SledBucket;
pub use filter::CuckooFilter;
pub use queue::SledQueue;

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("record does not exist")]
    NotExist,

    #[error("queue is empty")]
    EndOfStream,

    #[error("filter cannot place fingerprint")]
    FilterFull,

    #[error("record exceeds {0} bytes")]
    RecordTooLarge(usize),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// URL priority. Lower ordinal is served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::P0,
        Priority::P1,
        Priority::P2,
        Priority::P3,
        Priority::P4,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
            Priority::P4 => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Priority> {
        match value {
            0 => Some(Priority::P0),
            1 => Some(Priority::P1),
            2 => Some(Priority::P2),
            3 => Some(Priority::P3),
            4 => Some(Priority::P4),
            _ => None,
        }
    }
}

/// Queue state of a URL. `NotExist` covers both never-added and
/// already-finished URLs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum UrlState {
    NotExist,
    Waiting,
    Processing,
}

/// A URL held by the queue. Timestamps are unix epoch milliseconds;
/// `updated` changes on every state transition.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct QueueItem {
    pub id: u64,
    pub url: String,
    pub state: UrlState,
    pub priority: Priority,
    pub created: u64,
    pub updated: u64,
}

/// Durable priority queue of URLs.
///
/// `pop` must be linearizable against itself and against `collect`: no two
/// concurrent callers may ever receive the same row.
pub trait Queue: Send + Sync {
    /// Insert `(url, Waiting, priority)` without consulting the filter.
    /// Returns `Ok(false)` when a row with the same URL already exists.
    fn add_direct(&self, url: &str, priority: Priority) -> StorageResult<bool>;

    /// Like [`Queue::add_direct`], but a filter hit short-circuits to
    /// `Ok(false)` so finished URLs are never re-enqueued.
    fn add(&self, url: &str, priority: Priority) -> StorageResult<bool>;

    /// Atomically move the Waiting row with the lowest `(priority, id)` to
    /// Processing and return it. Fails with [`StorageError::EndOfStream`]
    /// when no Waiting rows exist.
    fn pop(&self) -> StorageResult<QueueItem>;

    /// Per-priority row counts for the given state.
    fn length(&self, state: UrlState) -> StorageResult<HashMap<Priority, usize>>;

    /// Remove every row and truncate the filter.
    fn truncate(&self) -> StorageResult<()>;

    /// Delete all Processing rows whose `updated` is older than the queue
    /// timeout and return them. Deleted, not reset: callers that want a
    /// retry must re-add.
    fn collect(&self) -> StorageResult<Vec<QueueItem>>;

    /// Record `url` in the filter, then delete its row. The filter write
    /// comes first so a crash in between cannot re-enqueue a completed URL.
    /// Returns `Ok(true)` iff exactly one row was deleted.
    fn finish(&self, url: &str) -> StorageResult<bool>;

    /// State of `url`, `NotExist` if absent.
    fn lookup(&self, url: &str) -> StorageResult<UrlState>;
}

/// Durable key/value store with pure overwrite semantics.
pub trait Bucket: Send + Sync {
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    /// Fails with [`StorageError::NotExist`] for missing keys.
    fn get(&self, key: &str) -> StorageResult<String>;
    /// Fails with [`StorageError::NotExist`] when nothing was removed.
    fn delete(&self, key: &str) -> StorageResult<()>;
    /// All keys, in no particular order.
    fn keys(&self) -> StorageResult<Vec<String>>;
    fn truncate(&self) -> StorageResult<()>;
}

/// Approximate membership set keyed by URL bytes.
///
/// Lookups may report false positives; a URL that was inserted and never
/// deleted is always reported present.
pub trait Filter: Send + Sync {
    /// Fails with [`StorageError::FilterFull`] when no slot can be found
    /// within the displacement bound.
    fn insert(&self, url: &str) -> StorageResult<()>;

    /// Remove one matching fingerprint. Fails with
    /// [`StorageError::NotExist`] if none matches. On a false-positive key
    /// this removes some other key's fingerprint; the queue never deletes
    /// through the filter, so only direct callers face that trade-off.
    fn delete(&self, url: &str) -> StorageResult<()>;

    fn contains(&self, url: &str) -> StorageResult<bool>;

    /// Approximate population.
    fn count(&self) -> StorageResult<u64>;

    /// Zero the structure.
    fn truncate(&self) -> StorageResult<()>;
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
