//! Property-based tests for replication tier sequencing.
//!
//! Tests the following invariants:
//! - A converged batch never moves an archive to an earlier tier
//! - Every tier reaches Done within three transitions
//! - The resume step derived from counters agrees with the tier targets

use crate::strategies::*;
use common::Step;
use proptest::prelude::*;
use scheduler::replication::{init_step, next_step};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn prop_next_step_is_monotone(
        step in step_strategy(),
        candidates in 0usize..10,
        floor in 1usize..10,
    ) {
        let next = next_step(step, candidates, floor);
        prop_assert!(next >= step);
        if step != Step::Done {
            prop_assert!(next > step);
        }
    }

    #[test]
    fn prop_every_step_reaches_done(
        step in step_strategy(),
        candidates in 0usize..10,
        floor in 1usize..10,
    ) {
        let mut current = step;
        for _ in 0..3 {
            current = next_step(current, candidates, floor);
        }
        prop_assert_eq!(current, Step::Done);
    }

    #[test]
    fn prop_init_step_matches_targets(
        candidates in 0usize..10,
        edges in 0usize..10,
        floor in 1usize..10,
        required in 0usize..10,
    ) {
        let step = init_step(candidates, edges, floor, required);
        match step {
            Step::RootCache => prop_assert_eq!(candidates, 0),
            Step::CandidateCache => prop_assert!(candidates > 0 && candidates < floor),
            Step::EdgeCache => prop_assert!(candidates >= floor && edges < required),
            Step::Done => prop_assert!(candidates >= floor && edges >= required),
        }
        // More replicas never send an archive back
        prop_assert!(init_step(candidates + 1, edges, floor, required) >= step);
        prop_assert!(init_step(candidates, edges + 1, floor, required) >= step);
    }
}
