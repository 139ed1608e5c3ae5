//! Property-based tests for deterministic block and asset sampling.
//!
//! A challenged node and its referee only agree if both derive the same
//! sequence from the round seed, so these properties are what validation
//! rests on:
//! - Same seed and index give the same draws
//! - Draw `i` does not depend on how many draws were requested
//! - Every draw is a member of the index
//! - Asset selection picks a listed archive, the same one for the same seed

use crate::strategies::*;
use carstore::{BucketedIndex, sample_block, sample_blocks, select_asset};
use proptest::prelude::*;
use std::collections::BTreeMap;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_sampling_is_deterministic(
        blocks in distinct_blocks_strategy(1..100),
        seed in any::<u64>(),
        count in 1usize..64,
    ) {
        // Two independently built indexes stand in for node and referee
        let ours = BucketedIndex::new(records_for(&blocks));
        let theirs = BucketedIndex::new(records_for(&blocks));
        prop_assert_eq!(sample_blocks(seed, &ours, count), sample_blocks(seed, &theirs, count));
    }

    #[test]
    fn prop_draws_are_prefix_stable(
        blocks in distinct_blocks_strategy(1..100),
        seed in any::<u64>(),
        short in 1usize..32,
        extra in 0usize..32,
    ) {
        let index = BucketedIndex::new(records_for(&blocks));
        let head = sample_blocks(seed, &index, short);
        let longer = sample_blocks(seed, &index, short + extra);
        prop_assert_eq!(head.len(), short);
        prop_assert_eq!(&longer[..short], &head[..]);

        for (draw, cid) in longer.iter().enumerate() {
            let single = sample_block(seed, &index, draw as u64).map(|r| r.cid);
            prop_assert_eq!(single, Some(*cid));
        }
    }

    #[test]
    fn prop_draws_are_members(
        blocks in distinct_blocks_strategy(1..100),
        seed in any::<u64>(),
        bucket_count in 1u32..256,
    ) {
        let index = BucketedIndex::build(records_for(&blocks), bucket_count);
        for cid in sample_blocks(seed, &index, 32) {
            prop_assert!(index.contains(&cid));
        }
    }

    #[test]
    fn prop_empty_index_yields_nothing(seed in any::<u64>(), draw in any::<u64>()) {
        let index = BucketedIndex::new(Vec::new());
        prop_assert!(sample_block(seed, &index, draw).is_none());
        prop_assert!(sample_blocks(seed, &index, 8).is_empty());
    }

    #[test]
    fn prop_select_asset_picks_listed_member(
        hashes in prop::collection::vec(archive_hash_strategy(), 0..40),
        seed in any::<u64>(),
    ) {
        let mut listing: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for hash in &hashes {
            let bytes = hex::decode(hash).unwrap();
            listing
                .entry(common::bucket_of(&bytes, common::DEFAULT_BUCKET_COUNT))
                .or_default()
                .push(hash.clone());
        }
        for members in listing.values_mut() {
            members.sort();
        }

        match select_asset(seed, &listing) {
            None => prop_assert!(hashes.is_empty()),
            Some(picked) => {
                prop_assert!(hashes.iter().any(|h| h == picked));
                prop_assert_eq!(select_asset(seed, &listing), Some(picked));
            }
        }
    }
}
