//! Property-based tests for the per-node asset summary.
//!
//! Tests the following invariants:
//! - The summary depends on the membership set, not on insertion order
//! - Incremental maintenance matches a from-scratch recomputation
//! - Adding then removing an archive restores the previous summary
//! - Listings are sorted and cover every member exactly once

use crate::strategies::*;
use common::DEFAULT_BUCKET_COUNT;
use proptest::prelude::*;
use scheduler::AssetsView;
use std::collections::BTreeSet;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_summary_ignores_insertion_order(
        hashes in prop::collection::vec(archive_hash_strategy(), 1..60),
        bucket_count in 1u32..32,
    ) {
        let forward = AssetsView::new(bucket_count);
        let backward = AssetsView::new(bucket_count);
        for hash in &hashes {
            forward.add_asset("e_1", hash);
        }
        for hash in hashes.iter().rev() {
            backward.add_asset("e_1", hash);
        }

        prop_assert_eq!(forward.summary_of("e_1"), backward.summary_of("e_1"));
        prop_assert_eq!(forward.top_hash("e_1"), forward.calculate_top_hash("e_1"));
        prop_assert!(forward.diff_buckets("e_1", &backward.summary_of("e_1").unwrap().bucket_hashes).is_empty());
    }

    #[test]
    fn prop_add_then_remove_restores_summary(
        hashes in prop::collection::vec(archive_hash_strategy(), 0..40),
        extra in archive_hash_strategy(),
    ) {
        prop_assume!(!hashes.contains(&extra));
        let view = AssetsView::new(DEFAULT_BUCKET_COUNT);
        for hash in &hashes {
            view.add_asset("c_1", hash);
        }
        let before = view.summary_of("c_1");

        prop_assert!(view.add_asset("c_1", &extra));
        prop_assert!(!view.add_asset("c_1", &extra));
        prop_assert_ne!(view.summary_of("c_1"), before.clone());
        prop_assert!(view.remove_asset("c_1", &extra));
        prop_assert_eq!(view.summary_of("c_1"), before);
        prop_assert_eq!(view.node_count(), usize::from(!hashes.is_empty()));
    }

    #[test]
    fn prop_listing_covers_members_once(
        hashes in prop::collection::vec(archive_hash_strategy(), 0..60),
    ) {
        let view = AssetsView::new(DEFAULT_BUCKET_COUNT);
        for hash in &hashes {
            view.add_asset("e_2", hash);
        }
        let listing = view.bucket_listing("e_2");

        let mut listed = Vec::new();
        for (bucket, members) in &listing {
            prop_assert!(!members.is_empty(), "empty bucket {} listed", bucket);
            prop_assert!(members.windows(2).all(|w| w[0] < w[1]));
            listed.extend(members.iter().cloned());
        }
        let expected: BTreeSet<String> = hashes.into_iter().collect();
        prop_assert_eq!(listed.len(), expected.len());
        prop_assert_eq!(listed.into_iter().collect::<BTreeSet<_>>(), expected);
    }
}
