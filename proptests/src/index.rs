//! Property-based tests for the bucketed block index and archive files.
//!
//! Tests the following invariants:
//! - Every block lands in the bucket its multihash maps to
//! - Buckets are sorted by multihash bytes
//! - Membership lookups find every indexed block and nothing else
//! - An archive written to disk reads back block for block

use crate::strategies::*;
use carstore::{ArchiveDir, BucketedIndex};
use common::{bucket_of, content_hash};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_blocks_land_in_their_bucket_sorted(
        blocks in distinct_blocks_strategy(1..200),
        bucket_count in 1u32..64,
    ) {
        let index = BucketedIndex::build(records_for(&blocks), bucket_count);
        prop_assert_eq!(index.len(), blocks.len());
        prop_assert_eq!(index.bucket_count(), bucket_count);

        let mut seen = 0;
        for bucket in 0..bucket_count {
            let keys: Vec<Vec<u8>> = index.bucket(bucket).map(|r| r.cid.hash().to_bytes()).collect();
            for key in &keys {
                prop_assert_eq!(bucket_of(key, bucket_count), bucket);
            }
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]), "bucket {} not strictly sorted", bucket);
            seen += keys.len();
        }
        prop_assert_eq!(seen, blocks.len());
        prop_assert_eq!(
            index.non_empty_buckets().len(),
            (0..bucket_count).filter(|b| index.bucket_len(*b) > 0).count()
        );
    }

    #[test]
    fn prop_lookup_finds_members_only(
        blocks in distinct_blocks_strategy(1..100),
        outsider in block_strategy(65, 128),
    ) {
        let records = records_for(&blocks);
        let index = BucketedIndex::new(records.clone());
        for record in &records {
            let found = index.get(&record.cid);
            prop_assert_eq!(found, Some(record));
        }
        // Strategy blocks are at most 64 bytes, so this one is never indexed
        prop_assert!(!index.contains(&cid_for(&outsider)));
    }

    #[test]
    fn prop_duplicate_blocks_keep_first_record(
        blocks in distinct_blocks_strategy(1..50),
    ) {
        let mut doubled = blocks.clone();
        doubled.extend(blocks.iter().cloned());
        let records = records_for(&doubled);
        let index = BucketedIndex::new(records.clone());
        prop_assert_eq!(index.len(), blocks.len());
        for record in &records[..blocks.len()] {
            prop_assert_eq!(index.get(&record.cid).map(|r| r.offset), Some(record.offset));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_archive_file_roundtrip(blocks in distinct_blocks_strategy(1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let archives = ArchiveDir::open(dir.path()).unwrap();
        let summary = archives.write_archive(&blocks).unwrap();

        prop_assert_eq!(summary.root, cid_for(&blocks[0]));
        prop_assert_eq!(summary.total_blocks, blocks.len() as u64);
        prop_assert_eq!(summary.total_size, blocks.iter().map(|b| b.len() as u64).sum::<u64>());

        let hash = content_hash(&summary.root);
        prop_assert!(archives.contains(&hash));
        let reader = archives.open_reader(&hash).unwrap();
        prop_assert_eq!(reader.records().len(), blocks.len());
        for (record, block) in reader.records().iter().zip(&blocks) {
            prop_assert_eq!(record.cid, cid_for(block));
            prop_assert_eq!(&reader.read_block(record).unwrap(), block);
        }
    }
}
