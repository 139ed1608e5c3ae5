//! Deterministic block sampling.
//!
//! A challenged node and its referee must pick the same "random" blocks. Both
//! derive every choice from the round seed alone:
//! - [`select_asset`] picks an archive from a node's asset bucket listing
//! - [`sample_block`] picks draw `i` from an archive's bucketed index
//!
//! Each draw gets its own generator seeded from `blake3(seed || draw)`, so
//! draw `i` never depends on how many earlier draws were taken.

use crate::index::{BucketedIndex, IndexRecord};
use cid::Cid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

fn draw_rng(seed: u64, draw: u64) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(&draw.to_le_bytes());
    StdRng::from_seed(*hasher.finalize().as_bytes())
}

fn pick<'a>(seed: u64, draw: u64, index: &'a BucketedIndex, buckets: &[u32]) -> Option<&'a IndexRecord> {
    if buckets.is_empty() {
        return None;
    }
    let mut rng = draw_rng(seed, draw);
    let bucket = buckets[rng.random_range(0..buckets.len())];
    let position = rng.random_range(0..index.bucket_len(bucket));
    index.record_in_bucket(bucket, position)
}

/// Block selected by draw number `draw` under `seed`.
///
/// Uniform over non-empty buckets (ascending), then uniform within the
/// bucket. Returns `None` only for an empty index.
pub fn sample_block(seed: u64, index: &BucketedIndex, draw: u64) -> Option<&IndexRecord> {
    pick(seed, draw, index, &index.non_empty_buckets())
}

/// CIDs of draws `0..count`.
pub fn sample_blocks(seed: u64, index: &BucketedIndex, count: usize) -> Vec<Cid> {
    let buckets = index.non_empty_buckets();
    (0..count as u64)
        .filter_map(|draw| pick(seed, draw, index, &buckets).map(|r| r.cid))
        .collect()
}

/// Archive selected from a bucket listing (bucket number to sorted members).
pub fn select_asset(seed: u64, listing: &BTreeMap<u32, Vec<String>>) -> Option<&str> {
    let buckets: Vec<&Vec<String>> = listing.values().filter(|m| !m.is_empty()).collect();
    if buckets.is_empty() {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let members = buckets[rng.random_range(0..buckets.len())];
    Some(members[rng.random_range(0..members.len())].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::cid_of_block;

    fn index(n: usize) -> BucketedIndex {
        BucketedIndex::build(
            (0..n).map(|i| IndexRecord {
                cid: cid_of_block(format!("b{i}").as_bytes()).unwrap(),
                offset: i as u64,
                len: 1,
            }),
            16,
        )
    }

    #[test]
    fn test_same_inputs_same_sequence() {
        let a = index(300);
        let b = index(300);
        assert_eq!(sample_blocks(7, &a, 50), sample_blocks(7, &b, 50));
    }

    #[test]
    fn test_draws_are_independent_of_count() {
        let idx = index(100);
        let long = sample_blocks(99, &idx, 20);
        let short = sample_blocks(99, &idx, 5);
        assert_eq!(&long[..5], &short[..]);
        assert_eq!(sample_block(99, &idx, 12).map(|r| r.cid), Some(long[12]));
    }

    #[test]
    fn test_different_seeds_diverge() {
        let idx = index(500);
        assert_ne!(sample_blocks(1, &idx, 10), sample_blocks(2, &idx, 10));
    }

    #[test]
    fn test_samples_come_from_index() {
        let idx = index(40);
        for cid in sample_blocks(3, &idx, 100) {
            assert!(idx.contains(&cid));
        }
    }

    #[test]
    fn test_empty_index_yields_nothing() {
        let idx = index(0);
        assert!(sample_block(1, &idx, 0).is_none());
        assert!(sample_blocks(1, &idx, 10).is_empty());
    }

    #[test]
    fn test_select_asset() {
        let mut listing = BTreeMap::new();
        listing.insert(3, vec!["aa".to_string(), "bb".to_string()]);
        listing.insert(9, vec!["cc".to_string()]);
        listing.insert(11, Vec::new());

        let picked = select_asset(42, &listing).unwrap();
        assert_eq!(select_asset(42, &listing), Some(picked));
        assert!(["aa", "bb", "cc"].contains(&picked));
        assert!(select_asset(42, &BTreeMap::new()).is_none());
    }
}
