//! Persistent archive, replica and validation state (sled).
//!
//! The orchestrator and validation engine depend on the [`Repository`]
//! trait; [`SledRepository`] implements it over four trees with bincode
//! values:
//! - `archives`: `{hash}` -> [`ArchiveInfo`]
//! - `replicas`: `{hash}/{node}` -> [`ReplicaInfo`]
//! - `node_assets`: `{node}/{hash}` -> root CID, Succeeded replicas only
//! - `validation`: `{round}/{node}` -> [`ValidationResultInfo`]
//! - `meta`: live settings

use crate::error::{Result, SchedulerError};
use common::{CacheStatus, NodeId, NodeRole, Step, ValidationStatus, now_secs};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, info, warn};

/// Durable view of one archive record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArchiveInfo {
    pub hash: String,
    pub root_cid: String,
    /// Edge replica target
    pub required_replicas: usize,
    pub total_size: u64,
    pub total_blocks: u64,
    /// Unix seconds; 0 never expires
    pub expires_at: u64,
    pub step: Step,
    pub candidate_replicas: usize,
    pub edge_replicas: usize,
    pub created_at: u64,
    /// Last orchestrator-level error (no eligible node, no source)
    pub last_error: Option<String>,
}

/// Durable view of one cache task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReplicaInfo {
    pub archive_hash: String,
    pub root_cid: String,
    pub node_id: NodeId,
    pub role: NodeRole,
    pub status: CacheStatus,
    pub done_blocks: u64,
    pub done_size: u64,
    pub created_at: u64,
    pub ended_at: Option<u64>,
    /// Unix seconds after which a non-terminal task is swept to TimedOut
    pub deadline: u64,
    /// Dispatch attempt number for this node, starting at 1
    pub attempt: u32,
    /// Last failure message reported for this node
    pub message: Option<String>,
}

/// One node's result within one validation round.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ValidationResultInfo {
    pub round_id: String,
    pub node_id: NodeId,
    pub validator_id: NodeId,
    pub archive_cid: Option<String>,
    pub seed: u64,
    pub status: ValidationStatus,
    /// Bytes per second
    pub bandwidth: f64,
    pub duration_ms: u64,
    pub block_count: u64,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub message: Option<String>,
}

impl ValidationResultInfo {
    pub fn created(round_id: &str, node_id: &str, validator_id: &str, seed: u64) -> Self {
        Self {
            round_id: round_id.to_string(),
            node_id: node_id.to_string(),
            validator_id: validator_id.to_string(),
            archive_cid: None,
            seed,
            status: ValidationStatus::Created,
            bandwidth: 0.0,
            duration_ms: 0,
            block_count: 0,
            started_at: now_secs(),
            ended_at: None,
            message: None,
        }
    }
}

/// Persistence consumed by the orchestrator and validation engine.
pub trait Repository: Send + Sync {
    fn load_archive(&self, hash: &str) -> Result<Option<ArchiveInfo>>;
    fn upsert_archive(&self, info: &ArchiveInfo) -> Result<()>;
    /// Remove an archive together with all its replicas.
    fn remove_archive(&self, hash: &str) -> Result<()>;
    fn list_archives(&self) -> Result<Vec<ArchiveInfo>>;
    fn list_expired_archives(&self, now: u64) -> Result<Vec<ArchiveInfo>>;

    fn upsert_replica(&self, replica: &ReplicaInfo) -> Result<()>;
    /// Set the status of several replicas of one archive. Unknown nodes are skipped.
    fn upsert_replica_status(&self, hash: &str, node_ids: &[NodeId], status: CacheStatus) -> Result<()>;
    fn load_replicas(&self, hash: &str) -> Result<Vec<ReplicaInfo>>;
    fn load_succeeded_replicas(&self, hash: &str) -> Result<Vec<ReplicaInfo>>;
    fn remove_replica(&self, hash: &str, node_id: &str) -> Result<()>;
    /// Number of archives a node holds a Succeeded replica of.
    fn load_node_replica_count(&self, node_id: &str) -> Result<usize>;
    /// Root CIDs of a node's Succeeded replicas, in stable order.
    fn load_asset_identifiers_by_node(&self, node_id: &str, count: usize, offset: usize) -> Result<Vec<String>>;

    fn record_validation_results(&self, results: &[ValidationResultInfo]) -> Result<()>;
    fn load_validation_result(&self, round_id: &str, node_id: &str) -> Result<Option<ValidationResultInfo>>;
    fn update_validation_result(&self, result: &ValidationResultInfo) -> Result<()>;
    /// Mark every still-Created result of a round NodeTimeout. Returns how many changed.
    fn timeout_validation_results(&self, round_id: &str) -> Result<usize>;
    fn list_validation_results(&self, round_id: Option<&str>) -> Result<Vec<ValidationResultInfo>>;

    fn load_setting(&self, key: &str) -> Result<Option<u64>>;
    fn store_setting(&self, key: &str, value: u64) -> Result<()>;
}

const ARCHIVES_TREE: &str = "archives";
const REPLICAS_TREE: &str = "replicas";
const NODE_ASSETS_TREE: &str = "node_assets";
const VALIDATION_TREE: &str = "validation";
const META_TREE: &str = "meta";

fn pair_key(a: &str, b: &str) -> String {
    format!("{a}/{b}")
}

pub struct SledRepository {
    db: sled::Db,
    archives: sled::Tree,
    replicas: sled::Tree,
    node_assets: sled::Tree,
    validation: sled::Tree,
    meta: sled::Tree,
}

impl SledRepository {
    /// Open sled database and its trees.
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(sled::Error::Io)?;
        }
        Self::from_db(sled::open(db_path)?)
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let repo = Self {
            archives: db.open_tree(ARCHIVES_TREE)?,
            replicas: db.open_tree(REPLICAS_TREE)?,
            node_assets: db.open_tree(NODE_ASSETS_TREE)?,
            validation: db.open_tree(VALIDATION_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db,
        };
        info!(
            archives = repo.archives.len(),
            replicas = repo.replicas.len(),
            validation_results = repo.validation.len(),
            "Scheduler state opened"
        );
        Ok(repo)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Decode every value of a scan, skipping corrupted entries.
    fn decode_all<T: DeserializeOwned>(iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in iter {
            let (key, value) = entry?;
            match bincode::deserialize::<T>(&value) {
                Ok(v) => out.push(v),
                Err(e) => {
                    let key_str = String::from_utf8_lossy(&key);
                    warn!(key = %key_str, error = %e, "Skipping corrupted entry");
                }
            }
        }
        Ok(out)
    }

    fn sync_node_asset(&self, replica: &ReplicaInfo) -> Result<()> {
        let key = pair_key(&replica.node_id, &replica.archive_hash);
        if replica.status == CacheStatus::Succeeded {
            self.node_assets.insert(key.as_bytes(), replica.root_cid.as_bytes())?;
        } else {
            self.node_assets.remove(key.as_bytes())?;
        }
        Ok(())
    }
}

impl Repository for SledRepository {
    fn load_archive(&self, hash: &str) -> Result<Option<ArchiveInfo>> {
        match self.archives.get(hash.as_bytes())? {
            Some(v) => bincode::deserialize(&v)
                .map(Some)
                .map_err(|e| SchedulerError::Corrupt {
                    archive: hash.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn upsert_archive(&self, info: &ArchiveInfo) -> Result<()> {
        self.archives
            .insert(info.hash.as_bytes(), bincode::serialize(info)?)?;
        Ok(())
    }

    fn remove_archive(&self, hash: &str) -> Result<()> {
        for replica in self.load_replicas(hash)? {
            self.remove_replica(hash, &replica.node_id)?;
        }
        self.archives.remove(hash.as_bytes())?;
        debug!(archive = %hash, "Archive removed from storage");
        Ok(())
    }

    fn list_archives(&self) -> Result<Vec<ArchiveInfo>> {
        Self::decode_all(self.archives.iter())
    }

    fn list_expired_archives(&self, now: u64) -> Result<Vec<ArchiveInfo>> {
        Ok(self
            .list_archives()?
            .into_iter()
            .filter(|a| a.expires_at != 0 && a.expires_at <= now)
            .collect())
    }

    fn upsert_replica(&self, replica: &ReplicaInfo) -> Result<()> {
        let key = pair_key(&replica.archive_hash, &replica.node_id);
        self.replicas
            .insert(key.as_bytes(), bincode::serialize(replica)?)?;
        self.sync_node_asset(replica)
    }

    fn upsert_replica_status(&self, hash: &str, node_ids: &[NodeId], status: CacheStatus) -> Result<()> {
        for node_id in node_ids {
            let key = pair_key(hash, node_id);
            let Some(value) = self.replicas.get(key.as_bytes())? else {
                continue;
            };
            let mut replica: ReplicaInfo = bincode::deserialize(&value)?;
            replica.status = status;
            if status.is_terminal() && replica.ended_at.is_none() {
                replica.ended_at = Some(now_secs());
            }
            self.upsert_replica(&replica)?;
        }
        Ok(())
    }

    fn load_replicas(&self, hash: &str) -> Result<Vec<ReplicaInfo>> {
        Self::decode_all(self.replicas.scan_prefix(format!("{hash}/").as_bytes()))
    }

    fn load_succeeded_replicas(&self, hash: &str) -> Result<Vec<ReplicaInfo>> {
        Ok(self
            .load_replicas(hash)?
            .into_iter()
            .filter(|r| r.status == CacheStatus::Succeeded)
            .collect())
    }

    fn remove_replica(&self, hash: &str, node_id: &str) -> Result<()> {
        self.replicas.remove(pair_key(hash, node_id).as_bytes())?;
        self.node_assets.remove(pair_key(node_id, hash).as_bytes())?;
        Ok(())
    }

    fn load_node_replica_count(&self, node_id: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.node_assets.scan_prefix(format!("{node_id}/").as_bytes()) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn load_asset_identifiers_by_node(&self, node_id: &str, count: usize, offset: usize) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(count);
        for entry in self
            .node_assets
            .scan_prefix(format!("{node_id}/").as_bytes())
            .skip(offset)
            .take(count)
        {
            let (_, root) = entry?;
            out.push(String::from_utf8_lossy(&root).into_owned());
        }
        Ok(out)
    }

    fn record_validation_results(&self, results: &[ValidationResultInfo]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for result in results {
            batch.insert(
                pair_key(&result.round_id, &result.node_id).as_bytes(),
                bincode::serialize(result)?,
            );
        }
        self.validation.apply_batch(batch)?;
        Ok(())
    }

    fn load_validation_result(&self, round_id: &str, node_id: &str) -> Result<Option<ValidationResultInfo>> {
        match self.validation.get(pair_key(round_id, node_id).as_bytes())? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    fn update_validation_result(&self, result: &ValidationResultInfo) -> Result<()> {
        self.record_validation_results(std::slice::from_ref(result))
    }

    fn timeout_validation_results(&self, round_id: &str) -> Result<usize> {
        let open: Vec<ValidationResultInfo> = Self::decode_all::<ValidationResultInfo>(
            self.validation.scan_prefix(format!("{round_id}/").as_bytes()),
        )?
        .into_iter()
        .filter(|r| r.status == ValidationStatus::Created)
        .collect();

        let now = now_secs();
        let timed_out: Vec<ValidationResultInfo> = open
            .into_iter()
            .map(|mut r| {
                r.status = ValidationStatus::NodeTimeout;
                r.ended_at = Some(now);
                r
            })
            .collect();
        self.record_validation_results(&timed_out)?;
        Ok(timed_out.len())
    }

    fn list_validation_results(&self, round_id: Option<&str>) -> Result<Vec<ValidationResultInfo>> {
        match round_id {
            Some(round) => Self::decode_all(self.validation.scan_prefix(format!("{round}/").as_bytes())),
            None => Self::decode_all(self.validation.iter()),
        }
    }

    fn load_setting(&self, key: &str) -> Result<Option<u64>> {
        match self.meta.get(key.as_bytes())? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    fn store_setting(&self, key: &str, value: u64) -> Result<()> {
        self.meta.insert(key.as_bytes(), bincode::serialize(&value)?)?;
        Ok(())
    }
}
