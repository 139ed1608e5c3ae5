//! Per-node asset membership summary.
//!
//! Each node's succeeded archives are partitioned into buckets by
//! [`common::bucket_of`] over the archive multihash. A bucket keeps its
//! members sorted and a sha256 over them; the node's top hash is a sha256
//! over the bucket hashes in ascending bucket order. A mutation only rehashes
//! the bucket it touches plus the top hash.
//!
//! The same listing feeds [`carstore::select_asset`] on the node side, so the
//! scheduler and a challenged node agree on which archive a seed selects.

use common::{NodeId, asset_bucket_hash, asset_top_hash, hash_bytes};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Default)]
struct Bucket {
    /// Multihash bytes, sorted, unique
    members: Vec<Vec<u8>>,
    hash: [u8; 32],
}

impl Bucket {
    fn rehash(&mut self) {
        self.hash = asset_bucket_hash(self.members.iter().map(Vec::as_slice));
    }
}

#[derive(Default)]
struct NodeAssets {
    buckets: BTreeMap<u32, Bucket>,
    top_hash: [u8; 32],
}

impl NodeAssets {
    fn recompute_top(&mut self) {
        self.top_hash = asset_top_hash(self.buckets.values().map(|b| &b.hash));
    }
}

/// Summary returned to operators and compared against a node's own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssetSummary {
    pub top_hash: String,
    pub bucket_hashes: BTreeMap<u32, String>,
}

pub struct AssetsView {
    bucket_count: u32,
    nodes: DashMap<NodeId, NodeAssets>,
}

impl AssetsView {
    pub fn new(bucket_count: u32) -> Self {
        Self {
            bucket_count,
            nodes: DashMap::new(),
        }
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Record that `node_id` holds the archive with content hash `archive_hash`.
    /// Returns false when the archive was already a member.
    pub fn add_asset(&self, node_id: &str, archive_hash: &str) -> bool {
        let Ok(member) = hash_bytes(archive_hash) else {
            debug!(archive = %archive_hash, "Ignoring non-hex archive hash");
            return false;
        };
        let bucket_no = common::bucket_of(&member, self.bucket_count);

        let mut assets = self.nodes.entry(node_id.to_string()).or_default();
        let bucket = assets.buckets.entry(bucket_no).or_default();
        match bucket.members.binary_search(&member) {
            Ok(_) => false,
            Err(pos) => {
                bucket.members.insert(pos, member);
                bucket.rehash();
                assets.recompute_top();
                true
            }
        }
    }

    /// Forget one membership. Empty buckets and empty nodes are dropped.
    pub fn remove_asset(&self, node_id: &str, archive_hash: &str) -> bool {
        let Ok(member) = hash_bytes(archive_hash) else {
            return false;
        };
        let bucket_no = common::bucket_of(&member, self.bucket_count);

        let removed = {
            let Some(mut assets) = self.nodes.get_mut(node_id) else {
                return false;
            };
            let Some(bucket) = assets.buckets.get_mut(&bucket_no) else {
                return false;
            };
            let Ok(pos) = bucket.members.binary_search(&member) else {
                return false;
            };
            bucket.members.remove(pos);
            if bucket.members.is_empty() {
                assets.buckets.remove(&bucket_no);
            } else {
                bucket.rehash();
            }
            assets.recompute_top();
            true
        };
        self.nodes.remove_if(node_id, |_, assets| assets.buckets.is_empty());
        removed
    }

    pub fn summary_of(&self, node_id: &str) -> Option<AssetSummary> {
        let assets = self.nodes.get(node_id)?;
        Some(AssetSummary {
            top_hash: hex::encode(assets.top_hash),
            bucket_hashes: assets
                .buckets
                .iter()
                .map(|(n, b)| (*n, hex::encode(b.hash)))
                .collect(),
        })
    }

    pub fn top_hash(&self, node_id: &str) -> Option<String> {
        self.nodes.get(node_id).map(|a| hex::encode(a.top_hash))
    }

    /// Bucket number to sorted archive hashes, the input of asset selection.
    pub fn bucket_listing(&self, node_id: &str) -> BTreeMap<u32, Vec<String>> {
        self.nodes
            .get(node_id)
            .map(|assets| {
                assets
                    .buckets
                    .iter()
                    .map(|(n, b)| (*n, b.members.iter().map(hex::encode).collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bucket numbers whose hash differs from `other` (either side missing
    /// counts as different).
    pub fn diff_buckets(&self, node_id: &str, other: &BTreeMap<u32, String>) -> Vec<u32> {
        let ours = self
            .summary_of(node_id)
            .map(|s| s.bucket_hashes)
            .unwrap_or_default();
        let mut diff: Vec<u32> = ours
            .iter()
            .filter(|(n, h)| other.get(*n) != Some(*h))
            .map(|(n, _)| *n)
            .chain(other.keys().filter(|n| !ours.contains_key(*n)).copied())
            .collect();
        diff.sort_unstable();
        diff
    }

    /// Top hash recomputed from scratch over the stored buckets.
    pub fn calculate_top_hash(&self, node_id: &str) -> Option<String> {
        let assets = self.nodes.get(node_id)?;
        let bucket_hashes: Vec<[u8; 32]> = assets
            .buckets
            .values()
            .map(|b| asset_bucket_hash(b.members.iter().map(Vec::as_slice)))
            .collect();
        Some(hex::encode(asset_top_hash(bucket_hashes.iter())))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
