//! Memory-mapped cuckoo filter over completed URLs.
//!
//! The backing file is a flat array of 4-slot buckets holding 16-bit
//! fingerprints, preceded by a small header, so the filter survives
//! restarts without a rebuild. Lookups can report false positives; a key
//! that was inserted and never deleted is always reported present.

use crate::config::Config;
use crate::storage::{Filter, StorageError, StorageResult};
use memmap2::MmapMut;
use parking_lot::Mutex;
use rand::Rng;
use std::fs::OpenOptions;
use std::path::Path;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

const MAGIC: u64 = 0x43_4b_46_31_54_52_57_4c; // "TRWLCKF1" tag bytes
const HEADER_LEN: usize = 24;
const SLOT_LEN: usize = 2;
const BUCKET_LEN: usize = Config::FILTER_BUCKET_SLOTS * SLOT_LEN;
const FP_SEED: u64 = 0x5bd1_e995;

struct FilterInner {
    mmap: MmapMut,
    num_buckets: usize,
}

impl FilterInner {
    fn read_count(&self) -> u64 {
        let bytes: [u8; 8] = self.mmap[16..24].try_into().unwrap_or_default();
        u64::from_le_bytes(bytes)
    }

    fn write_count(&mut self, count: u64) {
        self.mmap[16..24].copy_from_slice(&count.to_le_bytes());
    }

    fn slot(&self, bucket: usize, slot: usize) -> u16 {
        let offset = HEADER_LEN + bucket * BUCKET_LEN + slot * SLOT_LEN;
        u16::from_le_bytes([self.mmap[offset], self.mmap[offset + 1]])
    }

    fn set_slot(&mut self, bucket: usize, slot: usize, fingerprint: u16) {
        let offset = HEADER_LEN + bucket * BUCKET_LEN + slot * SLOT_LEN;
        self.mmap[offset..offset + SLOT_LEN].copy_from_slice(&fingerprint.to_le_bytes());
    }

    fn find_slot(&self, bucket: usize, fingerprint: u16) -> Option<usize> {
        (0..Config::FILTER_BUCKET_SLOTS).find(|&s| self.slot(bucket, s) == fingerprint)
    }

    /// Write `fingerprint` into a free slot of `bucket`, if any.
    fn try_place(&mut self, bucket: usize, fingerprint: u16) -> bool {
        if let Some(free) = self.find_slot(bucket, 0) {
            self.set_slot(bucket, free, fingerprint);
            return true;
        }
        false
    }
}

/// Cuckoo filter persisted in a memory-mapped file.
pub struct CuckooFilter {
    inner: Mutex<FilterInner>,
}

impl CuckooFilter {
    /// Open or create a filter file sized for `capacity` fingerprints.
    ///
    /// An existing file keeps its own geometry; `capacity` only matters on
    /// first creation.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        let existing_len = file.metadata()?.len() as usize;
        let num_buckets = if existing_len >= HEADER_LEN {
            // Adopt the on-disk geometry.
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            let magic = u64::from_le_bytes(mmap[0..8].try_into().unwrap_or_default());
            if magic != MAGIC {
                return Err(StorageError::Serialization(
                    "filter file has an unknown layout".to_string(),
                ));
            }
            let buckets = u64::from_le_bytes(mmap[8..16].try_into().unwrap_or_default()) as usize;
            if existing_len < HEADER_LEN + buckets * BUCKET_LEN {
                return Err(StorageError::Serialization(
                    "filter file is truncated".to_string(),
                ));
            }
            buckets
        } else {
            let slots = capacity.max(Config::FILTER_BUCKET_SLOTS);
            let buckets = (slots / Config::FILTER_BUCKET_SLOTS).next_power_of_two();
            file.set_len((HEADER_LEN + buckets * BUCKET_LEN) as u64)?;
            let mut mmap = unsafe { MmapMut::map_mut(&file)? };
            mmap[0..8].copy_from_slice(&MAGIC.to_le_bytes());
            mmap[8..16].copy_from_slice(&(buckets as u64).to_le_bytes());
            mmap[16..24].copy_from_slice(&0u64.to_le_bytes());
            mmap.flush()?;
            buckets
        };

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            inner: Mutex::new(FilterInner { mmap, num_buckets }),
        })
    }

    /// Fingerprint and primary bucket index for a key.
    fn index_fingerprint(&self, key: &[u8], num_buckets: usize) -> (usize, u16) {
        let hash = xxh3_64(key);
        let index = (hash as usize) & (num_buckets - 1);
        let mut fingerprint = (hash >> 32) as u16;
        if fingerprint == 0 {
            // Zero marks an empty slot.
            fingerprint = 1;
        }
        (index, fingerprint)
    }

    fn alt_index(&self, index: usize, fingerprint: u16, num_buckets: usize) -> usize {
        let hash = xxh3_64_with_seed(&fingerprint.to_le_bytes(), FP_SEED) as usize;
        (index ^ hash) & (num_buckets - 1)
    }
}

impl Filter for CuckooFilter {
    fn insert(&self, url: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let num_buckets = inner.num_buckets;
        let (i1, fingerprint) = self.index_fingerprint(url.as_bytes(), num_buckets);
        let i2 = self.alt_index(i1, fingerprint, num_buckets);

        // Idempotent for already-present keys, so finishing the same URL
        // twice does not consume extra slots.
        if inner.find_slot(i1, fingerprint).is_some() || inner.find_slot(i2, fingerprint).is_some()
        {
            return Ok(());
        }

        if inner.try_place(i1, fingerprint) || inner.try_place(i2, fingerprint) {
            let count = inner.read_count();
            inner.write_count(count + 1);
            return Ok(());
        }

        // Both buckets full: displace residents until something sticks.
        let mut rng = rand::thread_rng();
        let mut index = if rng.gen::<bool>() { i1 } else { i2 };
        let mut carried = fingerprint;
        for _ in 0..Config::FILTER_MAX_KICKS {
            let victim_slot = rng.gen_range(0..Config::FILTER_BUCKET_SLOTS);
            let victim = inner.slot(index, victim_slot);
            inner.set_slot(index, victim_slot, carried);
            carried = victim;
            index = self.alt_index(index, carried, num_buckets);
            if inner.try_place(index, carried) {
                let count = inner.read_count();
                inner.write_count(count + 1);
                return Ok(());
            }
        }
        // The displaced fingerprint could not be rehoused; one resident key
        // may now report absent. Inherent to cuckoo displacement.
        Err(StorageError::FilterFull)
    }

    fn delete(&self, url: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let num_buckets = inner.num_buckets;
        let (i1, fingerprint) = self.index_fingerprint(url.as_bytes(), num_buckets);
        let i2 = self.alt_index(i1, fingerprint, num_buckets);

        for index in [i1, i2] {
            if let Some(slot) = inner.find_slot(index, fingerprint) {
                inner.set_slot(index, slot, 0);
                let count = inner.read_count();
                inner.write_count(count.saturating_sub(1));
                return Ok(());
            }
        }
        Err(StorageError::NotExist)
    }

    fn contains(&self, url: &str) -> StorageResult<bool> {
        let inner = self.inner.lock();
        let num_buckets = inner.num_buckets;
        let (i1, fingerprint) = self.index_fingerprint(url.as_bytes(), num_buckets);
        let i2 = self.alt_index(i1, fingerprint, num_buckets);
        Ok(inner.find_slot(i1, fingerprint).is_some()
            || inner.find_slot(i2, fingerprint).is_some())
    }

    fn count(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().read_count())
    }

    fn truncate(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let end = HEADER_LEN + inner.num_buckets * BUCKET_LEN;
        inner.mmap[HEADER_LEN..end].fill(0);
        inner.write_count(0);
        inner.mmap.flush()?;
        Ok(())
    }
}

impl Drop for CuckooFilter {
    fn drop(&mut self) {
        // Push dirty pages out when the filter goes away.
        let _ = self.inner.lock().mmap.flush();
    }
}
