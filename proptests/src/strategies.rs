//! Shared proptest strategies for property-based testing.
//!
//! This module provides reusable strategies for generating:
//! - raw blocks and the index records built over them
//! - content hashes of archives
//! - candidate and edge node views
//! - replication steps

use carstore::IndexRecord;
use cid::Cid;
use common::{NodeRole, Step, cid_of_block, content_hash};
use proptest::prelude::*;
use scheduler::NodeView;
use std::collections::HashSet;

/// Generate random block data within a size range. Never empty.
pub fn block_strategy(min_size: usize, max_size: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), min_size.max(1)..=max_size.max(1))
}

/// Generate a set of blocks with pairwise distinct contents.
pub fn distinct_blocks_strategy(count: impl Into<prop::sample::SizeRange>) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(block_strategy(1, 64), count).prop_map(|blocks| {
        let mut seen = HashSet::new();
        blocks.into_iter().filter(|b| seen.insert(b.clone())).collect()
    })
}

/// CID of a block. Blocks from the strategies are never empty.
pub fn cid_for(block: &[u8]) -> Cid {
    cid_of_block(block).expect("non-empty block")
}

/// Index records for `blocks`, laid out back to back.
pub fn records_for(blocks: &[Vec<u8>]) -> Vec<IndexRecord> {
    let mut offset = 0u64;
    blocks
        .iter()
        .map(|block| {
            let record = IndexRecord {
                cid: cid_for(block),
                offset,
                len: block.len() as u32,
            };
            offset += block.len() as u64;
            record
        })
        .collect()
}

/// Generate archive content hashes (hex multihash of a random block CID).
pub fn archive_hash_strategy() -> impl Strategy<Value = String> {
    block_strategy(1, 32).prop_map(|block| content_hash(&cid_for(&block)))
}

/// Generate a node view with a role-prefixed id.
pub fn node_view_strategy() -> impl Strategy<Value = NodeView> {
    (any::<bool>(), 0u32..64, 0.0f64..100.0, 0usize..20).prop_map(|(candidate, n, disk, cache_count)| {
        let role = if candidate { NodeRole::Candidate } else { NodeRole::Edge };
        let node_id = format!("{}{n:02}", role.id_prefix());
        NodeView {
            rpc_url: format!("http://{node_id}"),
            node_id,
            role,
            validation_addr: None,
            disk_usage: disk,
            cache_count,
            online: true,
            last_seen: 0,
            access_token: String::new(),
        }
    })
}

/// Generate nodes with unique ids.
pub fn unique_nodes_strategy(max: usize) -> impl Strategy<Value = Vec<NodeView>> {
    prop::collection::vec(node_view_strategy(), 0..=max).prop_map(|nodes| {
        let mut seen = HashSet::new();
        nodes.into_iter().filter(|n| seen.insert(n.node_id.clone())).collect()
    })
}

/// Generate any replication step.
pub fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::RootCache),
        Just(Step::CandidateCache),
        Just(Step::EdgeCache),
        Just(Step::Done),
    ]
}
