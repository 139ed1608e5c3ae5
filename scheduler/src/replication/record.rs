//! In-memory archive record and the tier step rules.

use crate::directory::NodeDirectory;
use crate::repository::{ArchiveInfo, ReplicaInfo};
use common::{CacheStatus, DownloadSource, NodeId, NodeRole, Step};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashSet};

/// Step a record resumes at, derived from its replica counters.
pub fn init_step(candidates: usize, edges: usize, candidate_floor: usize, required: usize) -> Step {
    if candidates == 0 {
        Step::RootCache
    } else if candidates < candidate_floor {
        Step::CandidateCache
    } else if edges < required {
        Step::EdgeCache
    } else {
        Step::Done
    }
}

/// Step following `current` once its batch converged. The candidate top-up
/// is skipped when the floor is already met.
pub fn next_step(current: Step, candidates: usize, candidate_floor: usize) -> Step {
    match current {
        Step::RootCache if candidates >= candidate_floor => Step::EdgeCache,
        Step::RootCache => Step::CandidateCache,
        Step::CandidateCache => Step::EdgeCache,
        Step::EdgeCache | Step::Done => Step::Done,
    }
}

/// Mutable part of a record. Guarded by [`ArchiveRecord::state`].
#[derive(Debug)]
pub struct RecordState {
    pub required_replicas: usize,
    pub total_size: u64,
    pub total_blocks: u64,
    pub expires_at: u64,
    pub created_at: u64,
    pub step: Step,
    pub candidate_replicas: usize,
    pub edge_replicas: usize,
    pub download_sources: Vec<DownloadSource>,
    pub node_errors: BTreeMap<NodeId, String>,
    /// Nodes of the open batch still without a terminal report
    pub outstanding: HashSet<NodeId>,
    /// A tier batch was dispatched and has not been closed yet
    pub batch_open: bool,
    pub last_error: Option<String>,
}

impl RecordState {
    pub fn batch_converged(&self) -> bool {
        self.batch_open && self.outstanding.is_empty()
    }
}

/// One archive being replicated.
///
/// Lock order: `state` before `tasks`. The task map is safe for concurrent
/// reads and inserts on its own.
pub struct ArchiveRecord {
    pub hash: String,
    pub root_cid: String,
    state: Mutex<RecordState>,
    pub tasks: DashMap<NodeId, ReplicaInfo>,
}

impl ArchiveRecord {
    pub fn new(info: &ArchiveInfo) -> Self {
        Self {
            hash: info.hash.clone(),
            root_cid: info.root_cid.clone(),
            state: Mutex::new(RecordState {
                required_replicas: info.required_replicas,
                total_size: info.total_size,
                total_blocks: info.total_blocks,
                expires_at: info.expires_at,
                created_at: info.created_at,
                step: info.step,
                candidate_replicas: info.candidate_replicas,
                edge_replicas: info.edge_replicas,
                download_sources: Vec::new(),
                node_errors: BTreeMap::new(),
                outstanding: HashSet::new(),
                batch_open: false,
                last_error: info.last_error.clone(),
            }),
            tasks: DashMap::new(),
        }
    }

    /// Rebuild a record from persisted state. Counters are recounted from the
    /// replicas, unfinished tasks form the open batch.
    pub fn restore(info: &ArchiveInfo, replicas: Vec<ReplicaInfo>, candidate_floor: usize) -> Self {
        let record = Self::new(info);
        {
            let mut st = record.state.lock();
            st.candidate_replicas = 0;
            st.edge_replicas = 0;
            for replica in replicas {
                match replica.status {
                    CacheStatus::Succeeded => match replica.role {
                        NodeRole::Candidate => st.candidate_replicas += 1,
                        NodeRole::Edge => st.edge_replicas += 1,
                    },
                    CacheStatus::Failed | CacheStatus::TimedOut => {
                        let message = replica
                            .message
                            .clone()
                            .unwrap_or_else(|| replica.status.as_str().to_string());
                        st.node_errors.insert(replica.node_id.clone(), message);
                    }
                    CacheStatus::Waiting | CacheStatus::Running => {
                        st.outstanding.insert(replica.node_id.clone());
                    }
                }
                record.tasks.insert(replica.node_id.clone(), replica);
            }
            st.batch_open = !st.outstanding.is_empty();
            let derived = init_step(
                st.candidate_replicas,
                st.edge_replicas,
                candidate_floor,
                st.required_replicas,
            );
            st.step = st.step.max(derived);
        }
        record
    }

    pub fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    pub fn info(&self) -> ArchiveInfo {
        let st = self.state.lock();
        self.info_locked(&st)
    }

    pub fn info_locked(&self, st: &RecordState) -> ArchiveInfo {
        ArchiveInfo {
            hash: self.hash.clone(),
            root_cid: self.root_cid.clone(),
            required_replicas: st.required_replicas,
            total_size: st.total_size,
            total_blocks: st.total_blocks,
            expires_at: st.expires_at,
            step: st.step,
            candidate_replicas: st.candidate_replicas,
            edge_replicas: st.edge_replicas,
            created_at: st.created_at,
            last_error: st.last_error.clone(),
        }
    }

    /// Nodes that hold or are fetching this archive.
    pub fn holders(&self) -> HashSet<NodeId> {
        self.tasks
            .iter()
            .filter(|t| {
                let status = t.value().status;
                status == CacheStatus::Succeeded || !status.is_terminal()
            })
            .map(|t| t.key().clone())
            .collect()
    }

    /// Nodes with a Succeeded copy.
    pub fn succeeded_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .tasks
            .iter()
            .filter(|t| t.value().status == CacheStatus::Succeeded)
            .map(|t| t.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Recompute download sources from Succeeded candidate tasks whose node
    /// is known to the directory.
    pub fn refresh_sources(&self, st: &mut RecordState, directory: &NodeDirectory) {
        let mut candidates: Vec<NodeId> = self
            .tasks
            .iter()
            .filter(|t| t.value().role == NodeRole::Candidate && t.value().status == CacheStatus::Succeeded)
            .map(|t| t.key().clone())
            .collect();
        candidates.sort();
        st.download_sources = candidates
            .iter()
            .filter_map(|id| directory.get_candidate(id))
            .map(|node| DownloadSource {
                candidate_url: node.rpc_url,
                candidate_token: node.access_token,
            })
            .collect();
    }

    /// Tasks whose deadline passed without a terminal report.
    pub fn overdue_tasks(&self, now: u64) -> Vec<NodeId> {
        self.tasks
            .iter()
            .filter(|t| !t.value().status.is_terminal() && t.value().deadline <= now)
            .map(|t| t.key().clone())
            .collect()
    }
}
