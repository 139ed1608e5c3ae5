//! Indexed archive cache.
//!
//! Bounded LRU of open archives keyed by root content hash. A miss opens the
//! archive file, parses its embedded index and rebuilds it into a
//! [`BucketedIndex`]. Each entry owns its file handle; eviction drops the
//! entry and the handle closes once no in-flight read still holds it.

use crate::archive::{ArchiveDir, ArchiveReader};
use crate::error::{Result, StoreError};
use crate::index::BucketedIndex;
use crate::sampling::{sample_block, sample_blocks, select_asset};
use cid::Cid;
use common::content_hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Default number of archives kept open.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// One cached archive: open reader plus its bucketed index.
pub struct CachedArchive {
    reader: ArchiveReader,
    index: Arc<BucketedIndex>,
    open_handles: Arc<AtomicUsize>,
}

impl CachedArchive {
    pub fn index(&self) -> &Arc<BucketedIndex> {
        &self.index
    }

    pub fn reader(&self) -> &ArchiveReader {
        &self.reader
    }

    /// Bytes of a block, if the archive holds it.
    pub fn read(&self, block: &Cid) -> Result<Vec<u8>> {
        let record = self
            .index
            .get(block)
            .ok_or_else(|| StoreError::BlockNotFound {
                archive: self.reader.name().to_string(),
                block: block.to_string(),
            })?;
        self.reader.read_block(record)
    }
}

impl Drop for CachedArchive {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
        debug!(archive = %self.reader.name(), "Closed archive handle");
    }
}

pub struct IndexedArchiveCache {
    dir: ArchiveDir,
    bucket_count: u32,
    entries: Mutex<LruCache<String, Arc<CachedArchive>>>,
    open_handles: Arc<AtomicUsize>,
}

impl IndexedArchiveCache {
    pub fn new(dir: ArchiveDir, capacity: usize, bucket_count: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dir,
            bucket_count,
            entries: Mutex::new(LruCache::new(capacity)),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dir(&self) -> &ArchiveDir {
        &self.dir
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archive file handles currently open through this cache.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Relaxed)
    }

    /// Whether an archive is currently cached. Does not touch recency.
    pub fn is_cached(&self, root: &Cid) -> bool {
        self.entries.lock().contains(&content_hash(root))
    }

    /// Cached entry for a root content hash, loading it on a miss.
    pub fn entry_by_hash(&self, hash: &str) -> Result<Arc<CachedArchive>> {
        if let Some(entry) = self.entries.lock().get(hash) {
            return Ok(entry.clone());
        }

        // File IO happens outside the lock
        let loaded = Arc::new(self.load(hash)?);

        let evicted = {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get(hash) {
                // Another caller won the race; ours is dropped
                return Ok(existing.clone());
            }
            entries.push(hash.to_string(), loaded.clone())
        };
        if let Some((key, _)) = evicted {
            debug!(archive = %key, "Evicted archive from cache");
        }
        Ok(loaded)
    }

    fn load(&self, hash: &str) -> Result<CachedArchive> {
        let reader = self.dir.open_reader(hash).inspect_err(|e| {
            if matches!(e, StoreError::IndexCorrupt { .. }) {
                warn!(archive = %hash, error = %e, "Archive index corrupt");
            }
        })?;
        let index = BucketedIndex::build(reader.records().iter().cloned(), self.bucket_count);
        self.open_handles.fetch_add(1, Ordering::Relaxed);
        debug!(archive = %hash, blocks = index.len(), "Loaded archive index");
        Ok(CachedArchive {
            reader,
            index: Arc::new(index),
            open_handles: self.open_handles.clone(),
        })
    }

    /// Bytes of `block` in archive `root`.
    pub fn get(&self, root: &Cid, block: &Cid) -> Result<Vec<u8>> {
        self.entry_by_hash(&content_hash(root))?.read(block)
    }

    /// Whether archive `root` holds `block`.
    pub fn has(&self, root: &Cid, block: &Cid) -> Result<bool> {
        Ok(self
            .entry_by_hash(&content_hash(root))?
            .index
            .contains(block))
    }

    pub fn index_of(&self, root: &Cid) -> Result<Arc<BucketedIndex>> {
        Ok(self.entry_by_hash(&content_hash(root))?.index.clone())
    }

    /// CIDs a challenged node must produce for draws `0..count` under `seed`.
    pub fn blocks_of_asset(&self, root: &Cid, seed: u64, count: usize) -> Result<Vec<Cid>> {
        let hash = content_hash(root);
        let entry = self.entry_by_hash(&hash)?;
        if entry.index.is_empty() {
            return Err(StoreError::EmptyArchive(hash));
        }
        Ok(sample_blocks(seed, &entry.index, count))
    }

    /// Drop an archive from the cache. Returns whether it was cached.
    pub fn remove(&self, root: &Cid) -> bool {
        self.entries.lock().pop(&content_hash(root)).is_some()
    }

    /// Start a seeded random walk. With no `root`, the archive is chosen
    /// from this node's asset buckets with the same seed.
    pub fn random_check(&self, root: Option<&Cid>, seed: u64) -> Result<RandomCheck> {
        let hash = match root {
            Some(root) => content_hash(root),
            None => {
                let listing = self.dir.asset_buckets(self.bucket_count)?;
                select_asset(seed, &listing)
                    .ok_or(StoreError::NoAssets)?
                    .to_string()
            }
        };
        let archive = self.entry_by_hash(&hash)?;
        if archive.index.is_empty() {
            return Err(StoreError::EmptyArchive(hash));
        }
        Ok(RandomCheck {
            archive,
            seed,
            draw: 0,
        })
    }
}

/// Endless stream of sampled blocks from one archive.
pub struct RandomCheck {
    archive: Arc<CachedArchive>,
    seed: u64,
    draw: u64,
}

impl RandomCheck {
    pub fn archive_name(&self) -> &str {
        self.archive.reader.name()
    }

    /// Number of blocks drawn so far.
    pub fn draws(&self) -> u64 {
        self.draw
    }
}

impl Iterator for RandomCheck {
    type Item = Result<(Cid, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = sample_block(self.seed, &self.archive.index, self.draw)?;
        self.draw += 1;
        Some(
            self.archive
                .reader
                .read_block(record)
                .map(|data| (record.cid, data)),
        )
    }
}
