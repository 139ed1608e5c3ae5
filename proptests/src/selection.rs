//! Property-based tests for replication node selection.
//!
//! Tests the following invariants:
//! - Never more than `needed` nodes, all of the requested role
//! - Holders and nodes above the disk ceiling are never chosen
//! - Chosen nodes are no busier than any eligible node left out
//! - An empty eligible pool is reported with a consistent breakdown

use crate::strategies::*;
use common::{NodeId, NodeRole};
use proptest::prelude::*;
use scheduler::SchedulerError;
use scheduler::replication::select_nodes;
use std::collections::HashSet;

fn role_strategy() -> impl Strategy<Value = NodeRole> {
    prop_oneof![Just(NodeRole::Candidate), Just(NodeRole::Edge)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_selection_respects_filters_and_load(
        nodes in unique_nodes_strategy(40),
        role in role_strategy(),
        holder_picks in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
        disk_max in 0.0f64..100.0,
        needed in 0usize..12,
    ) {
        let holders: HashSet<NodeId> = if nodes.is_empty() {
            HashSet::new()
        } else {
            holder_picks.iter().map(|i| i.get(&nodes).node_id.clone()).collect()
        };
        let eligible: Vec<_> = nodes
            .iter()
            .filter(|n| n.role == role && !holders.contains(&n.node_id) && n.disk_usage <= disk_max)
            .cloned()
            .collect();

        match select_nodes(nodes.clone(), role, &holders, disk_max, needed) {
            Ok(picked) => {
                prop_assert_eq!(picked.len(), needed.min(eligible.len()));
                let picked_ids: HashSet<&str> = picked.iter().map(|n| n.node_id.as_str()).collect();
                prop_assert_eq!(picked_ids.len(), picked.len());
                for node in &picked {
                    prop_assert_eq!(node.role, role);
                    prop_assert!(!holders.contains(&node.node_id));
                    prop_assert!(node.disk_usage <= disk_max);
                }
                let busiest_picked = picked.iter().map(|n| n.cache_count).max();
                for left_out in eligible.iter().filter(|n| !picked_ids.contains(n.node_id.as_str())) {
                    if let Some(busiest) = busiest_picked {
                        prop_assert!(busiest <= left_out.cache_count);
                    }
                }
            }
            Err(SchedulerError::Unavailable { total, already_cached, disk_full, needed: asked, .. }) => {
                prop_assert!(needed > 0);
                prop_assert!(eligible.is_empty());
                prop_assert_eq!(asked, needed);
                prop_assert_eq!(total, nodes.iter().filter(|n| n.role == role).count());
                prop_assert_eq!(already_cached + disk_full, total);
            }
            Err(other) => prop_assert!(false, "unexpected error {}", other),
        }
    }
}
