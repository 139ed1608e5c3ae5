//! Replication orchestrator.
//!
//! Every archive walks `RootCache -> CandidateCache -> EdgeCache -> Done`.
//! Each tier dispatches one batch of cache tasks; the next tier starts only
//! once every task of the batch reached a terminal status. Dispatches run on
//! a bounded pool with a per-RPC deadline, and per-node failures stay with
//! that node's task.
//!
//! Records are guarded individually; there is no lock across archives.

pub mod record;
pub mod selection;

pub use record::{ArchiveRecord, RecordState, init_step, next_step};
pub use selection::select_nodes;

use crate::assets_view::AssetsView;
use crate::config::SchedulerConfig;
use crate::directory::{NodeDirectory, NodeView};
use crate::error::{Result, SchedulerError};
use crate::metrics::Metrics;
use crate::repository::{ArchiveInfo, ReplicaInfo, Repository};
use crate::rpc::NodeClient;
use common::{CacheRequest, CacheResult, CacheStatus, DownloadSource, NodeId, NodeRole, Step, now_secs};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CANDIDATE_EXTRA_KEY: &str = "candidate_replica_extra";

#[derive(Clone, Debug)]
pub struct ReplicationSettings {
    pub root_cache_count: usize,
    pub candidate_replica_extra: usize,
    pub disk_usage_max: f64,
    pub cache_timeout_secs: u64,
    pub dispatch_timeout: Duration,
    pub max_concurrent_dispatches: usize,
    pub max_records_loaded: usize,
}

impl From<&SchedulerConfig> for ReplicationSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            root_cache_count: config.root_cache_count,
            candidate_replica_extra: config.candidate_replica_extra,
            disk_usage_max: config.disk_usage_max,
            cache_timeout_secs: config.cache_timeout_secs,
            dispatch_timeout: config.dispatch_timeout(),
            max_concurrent_dispatches: config.max_concurrent_dispatches,
            max_records_loaded: config.max_records_loaded,
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// A batch went out
    Dispatched {
        step: Step,
        role: NodeRole,
        nodes: Vec<NodeId>,
    },
    /// The current batch is still running
    Pending,
    Done,
}

/// Operator view of one archive.
#[derive(Clone, Debug, Serialize)]
pub struct ArchiveSnapshot {
    #[serde(flatten)]
    pub info: ArchiveInfo,
    pub replicas: Vec<ReplicaInfo>,
    /// Last failure per node
    pub node_errors: BTreeMap<NodeId, String>,
    pub download_sources: Vec<String>,
}

enum Progress {
    Done,
    Pending,
    Dispatched {
        step: Step,
        role: NodeRole,
        nodes: Vec<NodeId>,
        converged: bool,
    },
}

/// A batch planned under the record lock.
struct Batch {
    step: Step,
    role: NodeRole,
    nodes: Vec<NodeView>,
    request: CacheRequest,
}

pub struct ReplicationManager {
    settings: ReplicationSettings,
    candidate_replica_extra: AtomicUsize,
    records: DashMap<String, Arc<ArchiveRecord>>,
    repo: Arc<dyn Repository>,
    directory: Arc<NodeDirectory>,
    client: Arc<dyn NodeClient>,
    assets: Arc<AssetsView>,
    metrics: Metrics,
    dispatch_permits: Arc<Semaphore>,
}

impl ReplicationManager {
    pub fn new(
        settings: ReplicationSettings,
        repo: Arc<dyn Repository>,
        directory: Arc<NodeDirectory>,
        client: Arc<dyn NodeClient>,
        assets: Arc<AssetsView>,
        metrics: Metrics,
    ) -> Result<Self> {
        let extra = match repo.load_setting(CANDIDATE_EXTRA_KEY)? {
            Some(v) => v as usize,
            None => settings.candidate_replica_extra,
        };
        let permits = settings.max_concurrent_dispatches.max(1);
        Ok(Self {
            settings,
            candidate_replica_extra: AtomicUsize::new(extra),
            records: DashMap::new(),
            repo,
            directory,
            client,
            assets,
            metrics,
            dispatch_permits: Arc::new(Semaphore::new(permits)),
        })
    }

    /// Candidate replicas an archive should reach before edge fan-out.
    pub fn candidate_floor(&self) -> usize {
        self.settings.root_cache_count.max(1) + self.candidate_replica_extra.load(Ordering::Relaxed)
    }

    pub fn candidate_replica_extra(&self) -> usize {
        self.candidate_replica_extra.load(Ordering::Relaxed)
    }

    /// Change the candidate redundancy for future tier decisions.
    pub fn set_candidate_replica_extra(&self, extra: usize) -> Result<()> {
        self.repo.store_setting(CANDIDATE_EXTRA_KEY, extra as u64)?;
        self.candidate_replica_extra.store(extra, Ordering::Relaxed);
        info!(extra, floor = self.candidate_floor(), "Candidate replica count updated");
        Ok(())
    }

    /// In-memory record, loaded from the repository on first use.
    fn record(&self, hash: &str) -> Result<Option<Arc<ArchiveRecord>>> {
        if let Some(record) = self.records.get(hash) {
            return Ok(Some(record.clone()));
        }
        let Some(info) = self.repo.load_archive(hash)? else {
            return Ok(None);
        };
        let replicas = self.repo.load_replicas(hash)?;
        let restored = Arc::new(ArchiveRecord::restore(&info, replicas, self.candidate_floor()));
        let record = self
            .records
            .entry(hash.to_string())
            .or_insert_with(|| {
                if restored.lock().step != Step::Done {
                    self.metrics.active_archives.inc();
                }
                restored
            })
            .clone();
        Ok(Some(record))
    }

    fn require(&self, hash: &str) -> Result<Arc<ArchiveRecord>> {
        self.record(hash)?
            .ok_or_else(|| SchedulerError::not_found("archive", hash))
    }

    /// Create or update the record for `root_cid`. Progress of an existing
    /// record is kept. Returns the archive hash.
    pub fn register(
        &self,
        root_cid: &str,
        total_size: u64,
        total_blocks: u64,
        required_replicas: usize,
        expires_at: u64,
    ) -> Result<String> {
        let hash = common::content_hash_of(root_cid)?;

        if let Some(record) = self.record(&hash)? {
            let mut st = record.lock();
            st.required_replicas = required_replicas;
            st.total_size = total_size;
            st.total_blocks = total_blocks;
            st.expires_at = expires_at;
            self.repo.upsert_archive(&record.info_locked(&st))?;
            info!(archive = %hash, required = required_replicas, step = st.step.as_str(), "Archive registration updated");
            return Ok(hash);
        }

        let info = ArchiveInfo {
            hash: hash.clone(),
            root_cid: root_cid.to_string(),
            required_replicas,
            total_size,
            total_blocks,
            expires_at,
            step: Step::RootCache,
            candidate_replicas: 0,
            edge_replicas: 0,
            created_at: now_secs(),
            last_error: None,
        };
        self.repo.upsert_archive(&info)?;
        self.records.entry(hash.clone()).or_insert_with(|| {
            self.metrics.active_archives.inc();
            Arc::new(ArchiveRecord::new(&info))
        });
        info!(archive = %hash, root = %root_cid, required = required_replicas, "Archive registered");
        Ok(hash)
    }

    /// Re-evaluate the step and dispatch the next batch if the previous one
    /// converged. A no-op while a batch is outstanding or once done.
    pub async fn advance(&self, hash: &str) -> Result<AdvanceOutcome> {
        let record = self.require(hash)?;
        loop {
            match self.advance_once(&record).await? {
                Progress::Done => return Ok(AdvanceOutcome::Done),
                Progress::Pending => return Ok(AdvanceOutcome::Pending),
                // Every report landed while the batch was still going out
                Progress::Dispatched { converged: true, .. } => continue,
                Progress::Dispatched {
                    step, role, nodes, ..
                } => return Ok(AdvanceOutcome::Dispatched { step, role, nodes }),
            }
        }
    }

    async fn advance_once(&self, record: &Arc<ArchiveRecord>) -> Result<Progress> {
        let batch = {
            let mut st = record.lock();
            let planned = match self.close_batch_locked(record, &mut st) {
                Ok(false) => return Ok(Progress::Pending),
                Ok(true) => self.plan_locked(record, &mut st),
                Err(e) => Err(e),
            };
            match planned {
                Ok(Some(batch)) => {
                    self.open_batch_locked(record, &mut st, &batch, true)?;
                    batch
                }
                Ok(None) => {
                    self.repo.upsert_archive(&record.info_locked(&st))?;
                    return Ok(Progress::Done);
                }
                Err(e) => {
                    st.last_error = Some(e.to_string());
                    self.repo.upsert_archive(&record.info_locked(&st))?;
                    debug!(archive = %record.hash, error = %e, "Advance stopped");
                    return Err(e);
                }
            }
        };
        self.run_batch(record, batch, true).await
    }

    /// Close a converged batch and move to the next step. Returns false when
    /// a batch is still outstanding.
    fn close_batch_locked(&self, record: &ArchiveRecord, st: &mut RecordState) -> Result<bool> {
        if !st.batch_open {
            return Ok(true);
        }
        if !st.outstanding.is_empty() {
            return Ok(false);
        }
        st.batch_open = false;
        if st.step != Step::Done {
            self.transition_locked(record, st)?;
        }
        Ok(true)
    }

    fn transition_locked(&self, record: &ArchiveRecord, st: &mut RecordState) -> Result<()> {
        let next = next_step(st.step, st.candidate_replicas, self.candidate_floor());
        if next == Step::EdgeCache {
            record.refresh_sources(st, &self.directory);
            if st.download_sources.is_empty() {
                return Err(SchedulerError::NoDownloadSource(record.hash.clone()));
            }
        }
        info!(
            archive = %record.hash,
            from = st.step.as_str(),
            to = next.as_str(),
            candidates = st.candidate_replicas,
            edges = st.edge_replicas,
            "Replication step advanced"
        );
        st.step = next;
        if next == Step::Done {
            self.metrics.active_archives.dec();
        }
        Ok(())
    }

    /// Nodes for the current step, skipping steps with nothing to do.
    fn plan_locked(&self, record: &ArchiveRecord, st: &mut RecordState) -> Result<Option<Batch>> {
        loop {
            let (role, needed) = match st.step {
                Step::Done => return Ok(None),
                Step::RootCache => (
                    NodeRole::Candidate,
                    self.settings
                        .root_cache_count
                        .max(1)
                        .saturating_sub(st.candidate_replicas),
                ),
                Step::CandidateCache => (
                    NodeRole::Candidate,
                    self.candidate_floor().saturating_sub(st.candidate_replicas),
                ),
                Step::EdgeCache => (
                    NodeRole::Edge,
                    st.required_replicas.saturating_sub(st.edge_replicas),
                ),
            };
            if needed == 0 {
                self.transition_locked(record, st)?;
                continue;
            }
            return self
                .plan_nodes_locked(record, st, role, needed)
                .map(|(nodes, request)| {
                    Some(Batch {
                        step: st.step,
                        role,
                        nodes,
                        request,
                    })
                });
        }
    }

    fn plan_nodes_locked(
        &self,
        record: &ArchiveRecord,
        st: &mut RecordState,
        role: NodeRole,
        needed: usize,
    ) -> Result<(Vec<NodeView>, CacheRequest)> {
        let sources = self.sources_for_locked(record, st, role)?;
        let nodes = select_nodes(
            self.directory.online_nodes(role),
            role,
            &record.holders(),
            self.settings.disk_usage_max,
            needed,
        )?;
        let request = CacheRequest {
            root_cid: record.root_cid.clone(),
            sources,
        };
        Ok((nodes, request))
    }

    /// Candidates seed without sources; edges pull from candidates only.
    fn sources_for_locked(
        &self,
        record: &ArchiveRecord,
        st: &mut RecordState,
        role: NodeRole,
    ) -> Result<Vec<DownloadSource>> {
        if role == NodeRole::Candidate {
            return Ok(Vec::new());
        }
        record.refresh_sources(st, &self.directory);
        if st.download_sources.is_empty() {
            return Err(SchedulerError::NoDownloadSource(record.hash.clone()));
        }
        Ok(st.download_sources.clone())
    }

    /// Persist Waiting tasks for every node of the batch. Tier batches also
    /// mark their nodes outstanding.
    fn open_batch_locked(
        &self,
        record: &ArchiveRecord,
        st: &mut RecordState,
        batch: &Batch,
        tier: bool,
    ) -> Result<()> {
        let now = now_secs();
        for node in &batch.nodes {
            let attempt = record
                .tasks
                .get(&node.node_id)
                .map(|t| t.attempt + 1)
                .unwrap_or(1);
            let task = ReplicaInfo {
                archive_hash: record.hash.clone(),
                root_cid: record.root_cid.clone(),
                node_id: node.node_id.clone(),
                role: batch.role,
                status: CacheStatus::Waiting,
                done_blocks: 0,
                done_size: 0,
                created_at: now,
                ended_at: None,
                deadline: now + self.settings.cache_timeout_secs,
                attempt,
                message: None,
            };
            self.repo.upsert_replica(&task)?;
            record.tasks.insert(node.node_id.clone(), task);
            self.directory.increment_cache_count(&node.node_id);
            if tier {
                st.outstanding.insert(node.node_id.clone());
            }
        }
        if tier {
            st.batch_open = true;
        }
        st.last_error = None;
        self.repo.upsert_archive(&record.info_locked(st))?;
        info!(
            archive = %record.hash,
            step = batch.step.as_str(),
            role = %batch.role,
            nodes = batch.nodes.len(),
            "Dispatching cache batch"
        );
        Ok(())
    }

    /// Send the batch and fold dispatch failures back into the record.
    async fn run_batch(&self, record: &ArchiveRecord, batch: Batch, tier: bool) -> Result<Progress> {
        let failures = self.dispatch_all(batch.role, &batch.nodes, batch.request).await;

        let mut st = record.lock();
        for (node_id, message) in &failures {
            self.fail_task_locked(record, &mut st, node_id, message)?;
        }
        if !failures.is_empty() && failures.len() == batch.nodes.len() {
            let message = failures
                .iter()
                .map(|(node, msg)| format!("{node}: {msg}"))
                .collect::<Vec<_>>()
                .join("; ");
            let err = SchedulerError::DispatchFailed {
                archive: record.hash.clone(),
                message,
            };
            if tier && st.outstanding.is_empty() {
                st.batch_open = false;
            }
            st.last_error = Some(err.to_string());
            self.repo.upsert_archive(&record.info_locked(&st))?;
            return Err(err);
        }
        self.repo.upsert_archive(&record.info_locked(&st))?;

        Ok(Progress::Dispatched {
            step: batch.step,
            role: batch.role,
            nodes: batch
                .nodes
                .into_iter()
                .map(|n| n.node_id)
                .filter(|id| !failures.iter().any(|(failed, _)| failed == id))
                .collect(),
            converged: tier && st.batch_converged(),
        })
    }

    /// Issue cache RPCs on the shared pool. Returns the nodes that failed.
    async fn dispatch_all(
        &self,
        role: NodeRole,
        nodes: &[NodeView],
        request: CacheRequest,
    ) -> Vec<(NodeId, String)> {
        let request = Arc::new(request);
        let mut failures = Vec::new();
        let mut joinset = JoinSet::new();

        for node in nodes.iter().cloned() {
            let Ok(permit) = self.dispatch_permits.clone().acquire_owned().await else {
                failures.push((node.node_id, "dispatch pool closed".to_string()));
                continue;
            };
            let client = self.client.clone();
            let request = request.clone();
            let timeout = self.settings.dispatch_timeout;
            joinset.spawn(async move {
                let _permit = permit;
                let res = match tokio::time::timeout(timeout, client.cache_archive(&node, &request)).await {
                    Ok(res) => res,
                    Err(_) => Err(SchedulerError::Timeout(format!("cache dispatch to {}", node.node_id))),
                };
                (node.node_id, res)
            });
        }

        while let Some(joined) = joinset.join_next().await {
            match joined {
                Ok((node_id, Ok(()))) => {
                    self.metrics.record_dispatch(role.as_str(), true);
                    debug!(node = %node_id, root = %request.root_cid, "Cache dispatched");
                }
                Ok((node_id, Err(e))) => {
                    self.metrics.record_dispatch(role.as_str(), false);
                    warn!(node = %node_id, root = %request.root_cid, error = %e, "Cache dispatch failed");
                    failures.push((node_id, e.to_string()));
                }
                // The task stays Waiting and is timed out by the sweep
                Err(e) => error!(error = %e, "Dispatch task aborted"),
            }
        }
        failures
    }

    fn fail_task_locked(
        &self,
        record: &ArchiveRecord,
        st: &mut RecordState,
        node_id: &str,
        message: &str,
    ) -> Result<()> {
        let Some(mut task) = record.tasks.get_mut(node_id) else {
            return Ok(());
        };
        // A report may have concluded the task before the RPC returned
        if task.status.is_terminal() {
            return Ok(());
        }
        task.status = CacheStatus::Failed;
        task.ended_at = Some(now_secs());
        task.message = Some(message.to_string());
        self.repo.upsert_replica(&task)?;
        drop(task);

        st.node_errors.insert(node_id.to_string(), message.to_string());
        st.outstanding.remove(node_id);
        self.directory.decrement_cache_count(node_id);
        Ok(())
    }

    fn adjust_replicas(st: &mut RecordState, role: NodeRole, add: bool) {
        let counter = match role {
            NodeRole::Candidate => &mut st.candidate_replicas,
            NodeRole::Edge => &mut st.edge_replicas,
        };
        *counter = if add { *counter + 1 } else { counter.saturating_sub(1) };
    }

    /// Apply a node's progress or completion report.
    pub async fn report_completion(&self, result: CacheResult) -> Result<()> {
        let hash = result.archive_hash.clone();
        let record = self.require(&hash)?;

        let converged = {
            let mut st = record.lock();
            let mut task = record.tasks.get_mut(&result.node_id).ok_or_else(|| {
                SchedulerError::not_found("cache task", format!("{}/{}", hash, result.node_id))
            })?;
            if task.status.is_terminal() {
                return Err(SchedulerError::TaskFinished {
                    archive: hash,
                    node: result.node_id,
                });
            }
            task.done_blocks = task.done_blocks.max(result.done_blocks);
            task.done_size = task.done_size.max(result.done_size);

            if !result.status.is_terminal() {
                task.status = CacheStatus::Running;
                task.deadline = now_secs() + self.settings.cache_timeout_secs;
                self.repo.upsert_replica(&task)?;
                debug!(archive = %hash, node = %result.node_id, blocks = task.done_blocks, "Cache progress");
                return Ok(());
            }

            task.status = result.status;
            task.ended_at = Some(now_secs());
            task.message = result.message.clone();
            let role = task.role;
            self.repo.upsert_replica(&task)?;
            drop(task);

            match result.status {
                CacheStatus::Succeeded => {
                    match role {
                        NodeRole::Candidate => {
                            st.candidate_replicas += 1;
                            record.refresh_sources(&mut st, &self.directory);
                        }
                        NodeRole::Edge => st.edge_replicas += 1,
                    }
                    st.node_errors.remove(&result.node_id);
                    self.assets.add_asset(&result.node_id, &hash);
                    info!(archive = %hash, node = %result.node_id, role = %role, "Replica cached");
                }
                status => {
                    let message = result
                        .message
                        .clone()
                        .unwrap_or_else(|| status.as_str().to_string());
                    warn!(archive = %hash, node = %result.node_id, status = status.as_str(), message = %message, "Cache task failed");
                    st.node_errors.insert(result.node_id.clone(), message);
                }
            }
            self.metrics.record_cache_result(result.status.as_str());
            st.outstanding.remove(&result.node_id);
            self.directory.decrement_cache_count(&result.node_id);
            self.repo.upsert_archive(&record.info_locked(&st))?;
            st.batch_converged()
        };

        if converged {
            if let Err(e) = self.advance(&hash).await {
                warn!(archive = %hash, error = %e, "Advance after converged batch failed");
            }
        }
        Ok(())
    }

    /// Cache on one node outside tier sequencing.
    pub async fn dispatch_to_node(&self, hash: &str, node_id: &str) -> Result<()> {
        let record = self.require(hash)?;
        let node = self
            .directory
            .get(node_id)
            .filter(|n| n.online)
            .ok_or_else(|| SchedulerError::not_found("node", node_id))?;

        let batch = {
            let mut st = record.lock();
            let previous = record.tasks.get(node_id).map(|t| t.status);
            if let Some(status) = previous.filter(|s| !s.is_terminal()) {
                debug!(archive = %hash, node = %node_id, status = status.as_str(), "Cache already running");
                return Ok(());
            }
            let sources = self.sources_for_locked(&record, &mut st, node.role)?;
            let batch = Batch {
                step: st.step,
                role: node.role,
                nodes: vec![node],
                request: CacheRequest {
                    root_cid: record.root_cid.clone(),
                    sources,
                },
            };

            // A re-cached holder stops counting until it reports again
            let retracted = previous == Some(CacheStatus::Succeeded);
            if retracted {
                Self::adjust_replicas(&mut st, batch.role, false);
            }
            if let Err(e) = self.open_batch_locked(&record, &mut st, &batch, false) {
                if retracted {
                    Self::adjust_replicas(&mut st, batch.role, true);
                }
                return Err(e);
            }
            if retracted {
                self.assets.remove_asset(node_id, hash);
                if batch.role == NodeRole::Candidate {
                    record.refresh_sources(&mut st, &self.directory);
                }
            }
            batch
        };

        self.run_batch(&record, batch, false).await.map(|_| ())
    }

    /// Operator re-run. A finished record short of edge replicas gets a
    /// fresh edge batch; anything else is advanced.
    pub async fn recache(&self, hash: &str) -> Result<AdvanceOutcome> {
        let record = self.require(hash)?;
        let batch = {
            let mut st = record.lock();
            let shortfall = st.required_replicas.saturating_sub(st.edge_replicas);
            if st.step != Step::Done || st.batch_open || shortfall == 0 {
                None
            } else {
                let (nodes, request) = match self.plan_nodes_locked(&record, &mut st, NodeRole::Edge, shortfall) {
                    Ok(planned) => planned,
                    Err(e) => {
                        st.last_error = Some(e.to_string());
                        self.repo.upsert_archive(&record.info_locked(&st))?;
                        return Err(e);
                    }
                };
                let batch = Batch {
                    step: Step::EdgeCache,
                    role: NodeRole::Edge,
                    nodes,
                    request,
                };
                self.open_batch_locked(&record, &mut st, &batch, true)?;
                Some(batch)
            }
        };

        match batch {
            None => self.advance(hash).await,
            Some(batch) => match self.run_batch(&record, batch, true).await? {
                Progress::Dispatched {
                    step, role, nodes, ..
                } => Ok(AdvanceOutcome::Dispatched { step, role, nodes }),
                Progress::Pending => Ok(AdvanceOutcome::Pending),
                Progress::Done => Ok(AdvanceOutcome::Done),
            },
        }
    }

    /// Delete an archive everywhere: remote copies, summaries and storage.
    pub async fn remove(&self, hash: &str) -> Result<()> {
        let record = self.require(hash)?;
        self.records.remove(hash);

        let (holders, active) = {
            let st = record.lock();
            (record.holders(), st.step != Step::Done)
        };
        for node_id in &holders {
            let running = record
                .tasks
                .get(node_id)
                .map(|t| !t.status.is_terminal())
                .unwrap_or(false);
            if running {
                self.directory.decrement_cache_count(node_id);
            }
            self.assets.remove_asset(node_id, hash);
            self.delete_remote(node_id, &record.root_cid).await;
        }
        self.repo.remove_archive(hash)?;
        if active {
            self.metrics.active_archives.dec();
        }
        info!(archive = %hash, holders = holders.len(), "Archive removed");
        Ok(())
    }

    /// Drop one node's copy of an archive.
    pub async fn remove_replica(&self, hash: &str, node_id: &str) -> Result<()> {
        let record = self.require(hash)?;
        let converged = {
            let mut st = record.lock();
            let (_, task) = record
                .tasks
                .remove(node_id)
                .ok_or_else(|| SchedulerError::not_found("cache task", format!("{hash}/{node_id}")))?;
            match task.status {
                CacheStatus::Succeeded => {
                    match task.role {
                        NodeRole::Candidate => {
                            st.candidate_replicas = st.candidate_replicas.saturating_sub(1);
                            record.refresh_sources(&mut st, &self.directory);
                        }
                        NodeRole::Edge => st.edge_replicas = st.edge_replicas.saturating_sub(1),
                    }
                    self.assets.remove_asset(node_id, hash);
                }
                status if !status.is_terminal() => {
                    st.outstanding.remove(node_id);
                    self.directory.decrement_cache_count(node_id);
                }
                _ => {}
            }
            st.node_errors.remove(node_id);
            self.repo.remove_replica(hash, node_id)?;
            self.repo.upsert_archive(&record.info_locked(&st))?;
            st.batch_converged()
        };

        self.delete_remote(node_id, &record.root_cid).await;
        info!(archive = %hash, node = %node_id, "Replica removed");
        if converged {
            if let Err(e) = self.advance(hash).await {
                warn!(archive = %hash, error = %e, "Advance after replica removal failed");
            }
        }
        Ok(())
    }

    async fn delete_remote(&self, node_id: &str, root_cid: &str) {
        let Some(node) = self.directory.get(node_id) else {
            debug!(node = %node_id, "Skipping remote delete on unknown node");
            return;
        };
        let call = self.client.delete_archive(&node, root_cid);
        match tokio::time::timeout(self.settings.dispatch_timeout, call).await {
            Ok(Ok(())) => debug!(node = %node_id, root = %root_cid, "Remote copy deleted"),
            Ok(Err(e)) => warn!(node = %node_id, root = %root_cid, error = %e, "Remote delete failed"),
            Err(_) => warn!(node = %node_id, root = %root_cid, "Remote delete timed out"),
        }
    }

    /// Set a new expiry (seconds since epoch, 0 keeps the archive forever).
    pub fn reset_expiration(&self, hash: &str, expires_at: u64) -> Result<()> {
        let record = self.require(hash)?;
        let mut st = record.lock();
        st.expires_at = expires_at;
        self.repo.upsert_archive(&record.info_locked(&st))?;
        info!(archive = %hash, expires_at, "Archive expiration reset");
        Ok(())
    }

    /// Force overdue tasks to TimedOut through the completion path.
    pub async fn sweep_timeouts(&self, now: u64) -> usize {
        let records: Vec<Arc<ArchiveRecord>> = self.records.iter().map(|r| r.value().clone()).collect();
        let mut timed_out = 0;
        for record in records {
            for node_id in record.overdue_tasks(now) {
                let result = CacheResult {
                    archive_hash: record.hash.clone(),
                    node_id: node_id.clone(),
                    status: CacheStatus::TimedOut,
                    done_blocks: 0,
                    done_size: 0,
                    message: Some("cache task deadline passed".to_string()),
                };
                match self.report_completion(result).await {
                    Ok(()) => timed_out += 1,
                    Err(SchedulerError::TaskFinished { .. }) => {}
                    Err(e) => warn!(archive = %record.hash, node = %node_id, error = %e, "Timeout sweep failed"),
                }
            }
        }
        timed_out += self.sweep_unloaded(now);
        if timed_out > 0 {
            info!(timed_out, "Cache tasks timed out");
        }
        timed_out
    }

    /// Time out overdue tasks of records that were never loaded. No counter
    /// of this process was raised for them, so a status update suffices.
    fn sweep_unloaded(&self, now: u64) -> usize {
        let archives = match self.repo.list_archives() {
            Ok(archives) => archives,
            Err(e) => {
                warn!(error = %e, "Timeout sweep could not list archives");
                return 0;
            }
        };
        let mut timed_out = 0;
        for info in archives.iter().filter(|a| !self.records.contains_key(&a.hash)) {
            let overdue: Vec<NodeId> = match self.repo.load_replicas(&info.hash) {
                Ok(replicas) => replicas
                    .into_iter()
                    .filter(|r| !r.status.is_terminal() && r.deadline <= now)
                    .map(|r| r.node_id)
                    .collect(),
                Err(e) => {
                    warn!(archive = %info.hash, error = %e, "Timeout sweep could not load replicas");
                    continue;
                }
            };
            if overdue.is_empty() {
                continue;
            }
            match self.repo.upsert_replica_status(&info.hash, &overdue, CacheStatus::TimedOut) {
                Ok(()) => {
                    debug!(archive = %info.hash, count = overdue.len(), "Timed out tasks of unloaded record");
                    timed_out += overdue.len();
                }
                Err(e) => warn!(archive = %info.hash, error = %e, "Timeout sweep failed"),
            }
        }
        timed_out
    }

    /// Remove every archive whose expiry passed.
    pub async fn remove_expired(&self, now: u64) -> Result<usize> {
        let expired = self.repo.list_expired_archives(now)?;
        let mut removed = 0;
        for info in expired {
            match self.remove(&info.hash).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(archive = %info.hash, error = %e, "Expired archive removal failed"),
            }
        }
        if removed > 0 {
            info!(removed, "Expired archives removed");
        }
        Ok(removed)
    }

    /// Load unfinished records and rebuild asset summaries from storage.
    pub fn restore(&self) -> Result<usize> {
        let floor = self.candidate_floor();
        let mut loaded = 0;
        for info in self.repo.list_archives()? {
            let replicas = self.repo.load_replicas(&info.hash)?;
            for replica in replicas.iter().filter(|r| r.status == CacheStatus::Succeeded) {
                self.assets.add_asset(&replica.node_id, &info.hash);
            }
            if info.step == Step::Done || loaded >= self.settings.max_records_loaded {
                continue;
            }

            let record = Arc::new(ArchiveRecord::restore(&info, replicas, floor));
            let restored_info = record.info();
            self.repo.upsert_archive(&restored_info)?;
            if restored_info.step != Step::Done {
                self.metrics.active_archives.inc();
            }
            self.records.insert(info.hash.clone(), record);
            loaded += 1;
        }
        info!(loaded, "Restored archive records");
        Ok(loaded)
    }

    /// Advance every record that has no batch outstanding.
    pub async fn resume(&self) -> usize {
        let idle: Vec<String> = self
            .records
            .iter()
            .filter(|r| {
                let st = r.value().lock();
                !st.batch_open && st.step != Step::Done
            })
            .map(|r| r.key().clone())
            .collect();
        let mut resumed = 0;
        for hash in idle {
            match self.advance(&hash).await {
                Ok(_) => resumed += 1,
                // Nodes may not have announced themselves yet
                Err(e) if e.is_recoverable() => debug!(archive = %hash, error = %e, "Resume deferred"),
                Err(e) => warn!(archive = %hash, error = %e, "Resume failed"),
            }
        }
        resumed
    }

    pub fn snapshot(&self, hash: &str) -> Result<ArchiveSnapshot> {
        let info = self
            .repo
            .load_archive(hash)?
            .ok_or_else(|| SchedulerError::not_found("archive", hash))?;
        self.snapshot_of(info)
    }

    fn snapshot_of(&self, info: ArchiveInfo) -> Result<ArchiveSnapshot> {
        let replicas = self.repo.load_replicas(&info.hash)?;
        let node_errors = replicas
            .iter()
            .filter(|r| matches!(r.status, CacheStatus::Failed | CacheStatus::TimedOut))
            .map(|r| {
                let message = r.message.clone().unwrap_or_else(|| r.status.as_str().to_string());
                (r.node_id.clone(), message)
            })
            .collect();
        let download_sources = replicas
            .iter()
            .filter(|r| r.role == NodeRole::Candidate && r.status == CacheStatus::Succeeded)
            .filter_map(|r| self.directory.get_candidate(&r.node_id))
            .map(|n| n.rpc_url)
            .collect();
        Ok(ArchiveSnapshot {
            info,
            replicas,
            node_errors,
            download_sources,
        })
    }

    pub fn list(&self) -> Result<Vec<ArchiveSnapshot>> {
        self.repo
            .list_archives()?
            .into_iter()
            .map(|info| self.snapshot_of(info))
            .collect()
    }

    /// Current in-memory step of an archive.
    pub fn step_of(&self, hash: &str) -> Option<Step> {
        self.records.get(hash).map(|r| r.lock().step)
    }

    /// Nodes holding a Succeeded copy, sorted.
    pub fn succeeded_nodes(&self, hash: &str) -> Result<Vec<NodeId>> {
        match self.records.get(hash) {
            Some(record) => Ok(record.succeeded_nodes()),
            None => Ok(self
                .repo
                .load_succeeded_replicas(hash)?
                .into_iter()
                .map(|r| r.node_id)
                .collect()),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
