//! Common types for the carfile CDN scheduler and its storage nodes.
//!
//! This crate provides functionality shared by the scheduler and by the
//! candidate/edge node components:
//! - **Node roles**: candidate (relay) and edge (leaf) tiers
//! - **Replication states**: per-archive steps and per-node cache task statuses
//! - **Validation states**: per-node challenge outcomes
//! - **Protocol messages**: cache requests, validation challenges and reports
//! - **Content identifiers**: CID derivation and the canonical content hash
//! - **Stable bucketing**: the hash used for every bucketed structure
//! - **API key middleware**: X-API-Key authentication for operator routes
//!
//! # Bucketing
//!
//! Block indexes and node asset summaries both partition identifiers into a
//! fixed number of buckets with [`bucket_of`]. Every party computing a bucket
//! number from the same multihash bytes gets the same answer, which is what
//! lets a referee re-derive a challenged node's random sample.

pub mod cids;
pub mod middleware;

pub use cids::{
    CidError, cid_from_bytes, cid_of_block, content_hash, content_hash_of, hash_bytes, parse_cid,
    same_content,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::Hasher;
use xxhash_rust::xxh3;

/// Identifier of a storage node (`c_...` for candidates, `e_...` for edges).
pub type NodeId = String;

/// Default number of buckets used by block indexes and asset summaries.
pub const DEFAULT_BUCKET_COUNT: u32 = 128;

// ============================================================================
// Node Roles
// ============================================================================

/// Tier a storage node belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRole {
    /// Mid-tier relay. Holds early replicas and serves edges.
    Candidate,
    /// Leaf node serving end clients.
    Edge,
}

impl NodeRole {
    /// Prefix used for node ids allocated by the scheduler.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            NodeRole::Candidate => "c_",
            NodeRole::Edge => "e_",
        }
    }

    /// Infer the role from an allocated node id.
    pub fn from_node_id(node_id: &str) -> Option<Self> {
        if node_id.starts_with(NodeRole::Candidate.id_prefix()) {
            Some(NodeRole::Candidate)
        } else if node_id.starts_with(NodeRole::Edge.id_prefix()) {
            Some(NodeRole::Edge)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Candidate => "candidate",
            NodeRole::Edge => "edge",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Replication States
// ============================================================================

/// Replication tier an archive is currently working through.
///
/// Ordering follows the tier sequence, so `a < b` means `a` comes first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    RootCache,
    CandidateCache,
    EdgeCache,
    Done,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::RootCache => "root_cache",
            Step::CandidateCache => "candidate_cache",
            Step::EdgeCache => "edge_cache",
            Step::Done => "done",
        }
    }
}

/// Status of one node's copy of one archive.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CacheStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CacheStatus::Succeeded | CacheStatus::Failed | CacheStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Waiting => "waiting",
            CacheStatus::Running => "running",
            CacheStatus::Succeeded => "succeeded",
            CacheStatus::Failed => "failed",
            CacheStatus::TimedOut => "timed_out",
        }
    }
}

// ============================================================================
// Validation States
// ============================================================================

/// Outcome of one node's challenge within a validation round.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValidationStatus {
    /// Challenge issued, no answer yet
    Created,
    /// Every reported block matched the referee's derivation
    Success,
    /// At least one reported block did not match
    BlockFail,
    /// Node cancelled the stream
    Cancel,
    /// Node (or the round) did not answer in time
    NodeTimeout,
    /// Inconclusive (no referee, missing records)
    Other,
}

impl ValidationStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, ValidationStatus::Created)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Created => "created",
            ValidationStatus::Success => "success",
            ValidationStatus::BlockFail => "block_fail",
            ValidationStatus::Cancel => "cancel",
            ValidationStatus::NodeTimeout => "node_timeout",
            ValidationStatus::Other => "other",
        }
    }
}

// ============================================================================
// Protocol Messages
// ============================================================================

/// A candidate node usable as a data source for edge fan-out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DownloadSource {
    /// Candidate RPC base URL
    pub candidate_url: String,
    /// Access token presented to the candidate
    pub candidate_token: String,
}

/// Scheduler -> node: fetch and cache an archive.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CacheRequest {
    pub root_cid: String,
    /// Empty for candidates seeding from origin
    pub sources: Vec<DownloadSource>,
}

/// Node -> scheduler: progress or conclusion of a cache task.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CacheResult {
    pub archive_hash: String,
    pub node_id: NodeId,
    pub status: CacheStatus,
    #[serde(default)]
    pub done_blocks: u64,
    #[serde(default)]
    pub done_size: u64,
    #[serde(default)]
    pub message: Option<String>,
}

/// Scheduler -> challenged node.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ValidationChallenge {
    pub round_id: String,
    /// Archive to sample. When absent the node derives it from its own
    /// asset buckets using the same seed.
    pub archive_cid: Option<String>,
    pub seed: u64,
    /// Seconds of block streaming requested
    pub duration_secs: u64,
    /// Validator TCP address receiving the stream
    pub validator_addr: String,
}

/// Most blocks one validation stream carries. Responders stop sending,
/// validators stop recording and referees answer up to this many draws.
pub const MAX_VALIDATION_BLOCKS: usize = 100_000;

/// Body limit for a [`ValidationReport`] holding [`MAX_VALIDATION_BLOCKS`]
/// CIDs, with headroom for the surrounding fields.
pub const MAX_VALIDATION_REPORT_BYTES: usize = MAX_VALIDATION_BLOCKS * 128 + 64 * 1024;

/// Validator -> scheduler: what a challenged node streamed.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ValidationReport {
    pub round_id: String,
    pub node_id: NodeId,
    /// CIDs recomputed from the received bytes, in arrival order
    pub cids: Vec<String>,
    /// Bytes per second
    pub bandwidth: f64,
    /// Wall time of the stream in milliseconds
    pub cost_time_ms: u64,
    #[serde(default)]
    pub is_cancel: bool,
    #[serde(default)]
    pub is_timeout: bool,
    /// Frames received, including ones whose CID could not be derived
    #[serde(default)]
    pub random_count: u64,
}

/// Scheduler -> referee: derive the block sequence for a seed.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BlocksOfAssetRequest {
    pub root_cid: String,
    pub seed: u64,
    pub count: usize,
}

/// Node -> scheduler: connect or heartbeat.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeAnnouncement {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub rpc_url: String,
    /// TCP address for validation streams (candidates acting as validators)
    #[serde(default)]
    pub validation_addr: Option<String>,
    /// Disk usage in percent
    #[serde(default)]
    pub disk_usage: f64,
    /// Hex top hash of the node's asset summary, compared against the
    /// scheduler's view to detect divergence
    #[serde(default)]
    pub asset_top_hash: Option<String>,
}

// ============================================================================
// Utilities
// ============================================================================

/// Stable bucket number for a multihash.
pub fn bucket_of(multihash: &[u8], bucket_count: u32) -> u32 {
    if bucket_count == 0 {
        return 0;
    }
    let mut hasher = xxh3::Xxh3::new();
    hasher.write(multihash);
    (hasher.finish() % bucket_count as u64) as u32
}

/// Hash of one asset bucket: sha256 over the concatenated multihash bytes of
/// its members. Members must already be sorted.
pub fn asset_bucket_hash<'a>(members: impl IntoIterator<Item = &'a [u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for member in members {
        hasher.update(member);
    }
    hasher.finalize().into()
}

/// Top hash over bucket hashes given in ascending bucket-number order.
pub fn asset_top_hash<'a>(bucket_hashes: impl IntoIterator<Item = &'a [u8; 32]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for hash in bucket_hashes {
        hasher.update(hash);
    }
    hasher.finalize().into()
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_prefix_roundtrip() {
        for role in [NodeRole::Candidate, NodeRole::Edge] {
            let id = format!("{}abc", role.id_prefix());
            assert_eq!(NodeRole::from_node_id(&id), Some(role));
        }
        assert_eq!(NodeRole::from_node_id("x_abc"), None);
    }

    #[test]
    fn test_step_ordering() {
        assert!(Step::RootCache < Step::CandidateCache);
        assert!(Step::CandidateCache < Step::EdgeCache);
        assert!(Step::EdgeCache < Step::Done);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CacheStatus::Waiting.is_terminal());
        assert!(!CacheStatus::Running.is_terminal());
        assert!(CacheStatus::Succeeded.is_terminal());
        assert!(CacheStatus::Failed.is_terminal());
        assert!(CacheStatus::TimedOut.is_terminal());
        assert!(!ValidationStatus::Created.is_final());
        assert!(ValidationStatus::Other.is_final());
    }

    #[test]
    fn test_bucket_of_is_stable_and_bounded() {
        let a = bucket_of(b"some multihash", DEFAULT_BUCKET_COUNT);
        let b = bucket_of(b"some multihash", DEFAULT_BUCKET_COUNT);
        assert_eq!(a, b);
        assert!(a < DEFAULT_BUCKET_COUNT);
        assert_eq!(bucket_of(b"anything", 0), 0);
    }

    #[test]
    fn test_asset_hashes_depend_on_order_and_content() {
        let a = asset_bucket_hash([b"aa".as_slice(), b"bb".as_slice()]);
        let b = asset_bucket_hash([b"bb".as_slice(), b"aa".as_slice()]);
        assert_ne!(a, b);
        assert_eq!(a, asset_bucket_hash([b"aa".as_slice(), b"bb".as_slice()]));
        assert_ne!(asset_top_hash([&a, &b]), asset_top_hash([&b, &a]));
    }

    #[test]
    fn test_report_defaults_deserialize() {
        let json = r#"{"round_id":"r","node_id":"e_1","cids":[],"bandwidth":0.0,"cost_time_ms":5}"#;
        let report: ValidationReport = serde_json::from_str(json).unwrap();
        assert!(!report.is_cancel);
        assert!(!report.is_timeout);
        assert_eq!(report.random_count, 0);
    }
}
