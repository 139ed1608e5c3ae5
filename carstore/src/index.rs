//! Bucketed block index.
//!
//! An archive's flat index (one record per block) is partitioned into a fixed
//! number of buckets by `bucket_of(multihash) mod B`. Each bucket is sorted by
//! multihash bytes, so:
//! - membership is a bucket lookup plus a binary search
//! - a uniformly random block is a bucket draw plus a record draw
//!
//! Archives are immutable, so an index is never modified after `build`.

use cid::Cid;
use common::{DEFAULT_BUCKET_COUNT, bucket_of};

/// Location of one block inside an archive file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub cid: Cid,
    /// Byte offset of the block data in the archive file
    pub offset: u64,
    /// Length of the block data in bytes
    pub len: u32,
}

impl IndexRecord {
    fn key(&self) -> Vec<u8> {
        self.cid.hash().to_bytes()
    }
}

#[derive(Clone, Debug)]
struct Entry {
    key: Vec<u8>,
    record: IndexRecord,
}

/// Sorted, fixed-cardinality partition of an archive's blocks.
#[derive(Clone, Debug)]
pub struct BucketedIndex {
    buckets: Vec<Vec<Entry>>,
    len: usize,
}

impl BucketedIndex {
    /// Build an index with the default bucket count.
    pub fn new(records: impl IntoIterator<Item = IndexRecord>) -> Self {
        Self::build(records, DEFAULT_BUCKET_COUNT)
    }

    /// Build an index with `bucket_count` buckets. Duplicate blocks (same
    /// multihash) keep their first record.
    pub fn build(records: impl IntoIterator<Item = IndexRecord>, bucket_count: u32) -> Self {
        let bucket_count = bucket_count.max(1);
        let mut buckets: Vec<Vec<Entry>> = vec![Vec::new(); bucket_count as usize];

        for record in records {
            let key = record.key();
            let bucket = bucket_of(&key, bucket_count) as usize;
            buckets[bucket].push(Entry { key, record });
        }

        let mut len = 0;
        for bucket in &mut buckets {
            // Stable sort keeps the first occurrence ahead of its duplicates
            bucket.sort_by(|a, b| a.key.cmp(&b.key));
            bucket.dedup_by(|later, earlier| later.key == earlier.key);
            len += bucket.len();
        }

        Self { buckets, len }
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Number of distinct blocks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records of one bucket, sorted by multihash. Out-of-range buckets are empty.
    pub fn bucket(&self, bucket: u32) -> impl ExactSizeIterator<Item = &IndexRecord> {
        self.buckets
            .get(bucket as usize)
            .map(|b| b.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|e| &e.record)
    }

    /// Record at `position` within a bucket.
    pub fn record_in_bucket(&self, bucket: u32, position: usize) -> Option<&IndexRecord> {
        self.buckets
            .get(bucket as usize)
            .and_then(|b| b.get(position))
            .map(|e| &e.record)
    }

    pub fn bucket_len(&self, bucket: u32) -> usize {
        self.buckets.get(bucket as usize).map_or(0, Vec::len)
    }

    /// Bucket numbers holding at least one record, ascending.
    pub fn non_empty_buckets(&self) -> Vec<u32> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Bucket a block belongs to.
    pub fn bucket_for(&self, cid: &Cid) -> u32 {
        bucket_of(&cid.hash().to_bytes(), self.bucket_count())
    }

    /// Look up a block by CID. Matching is by multihash, so CIDv0 and CIDv1
    /// over the same bytes find the same record.
    pub fn get(&self, cid: &Cid) -> Option<&IndexRecord> {
        let key = cid.hash().to_bytes();
        let bucket = &self.buckets[bucket_of(&key, self.bucket_count()) as usize];
        bucket
            .binary_search_by(|e| e.key.as_slice().cmp(key.as_slice()))
            .ok()
            .map(|i| &bucket[i].record)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.get(cid).is_some()
    }

    /// All records, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &IndexRecord> {
        self.buckets.iter().flatten().map(|e| &e.record)
    }
}
