//! Validation rounds: challenge dispatch and referee verification.

use super::round::{RoundState, compare_blocks, pair_nodes};
use crate::config::SchedulerConfig;
use crate::directory::{NodeDirectory, NodeView};
use crate::error::{Result, SchedulerError};
use crate::metrics::Metrics;
use crate::repository::{Repository, ValidationResultInfo};
use crate::rpc::NodeClient;
use common::{NodeId, NodeRole, ValidationChallenge, ValidationReport, ValidationStatus, content_hash_of, now_secs};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct ValidationSettings {
    pub enabled: bool,
    pub duration_secs: u64,
    pub dispatch_timeout: Duration,
}

impl From<&SchedulerConfig> for ValidationSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            enabled: config.validation_enabled,
            duration_secs: config.validation_duration_secs,
            dispatch_timeout: config.validation_dispatch_timeout(),
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

pub struct ValidationEngine {
    settings: ValidationSettings,
    enabled: AtomicBool,
    round: RwLock<Option<Arc<RoundState>>>,
    /// Serializes round starts
    start_lock: tokio::sync::Mutex<()>,
    /// Supervisor of the current round's challenge dispatches
    dispatch: Mutex<Option<JoinHandle<()>>>,
    /// Results being verified right now, keyed `{round}/{node}`
    in_flight: Mutex<HashSet<String>>,
    repo: Arc<dyn Repository>,
    directory: Arc<NodeDirectory>,
    client: Arc<dyn NodeClient>,
    metrics: Metrics,
}

/// Releases an in-flight marker on every exit path.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl ValidationEngine {
    pub fn new(
        settings: ValidationSettings,
        repo: Arc<dyn Repository>,
        directory: Arc<NodeDirectory>,
        client: Arc<dyn NodeClient>,
        metrics: Metrics,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(settings.enabled),
            settings,
            round: RwLock::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            dispatch: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            repo,
            directory,
            client,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Validation toggled");
    }

    pub fn current_round(&self) -> Option<Arc<RoundState>> {
        self.round.read().clone()
    }

    pub fn list_results(&self, round_id: Option<&str>) -> Result<Vec<ValidationResultInfo>> {
        self.repo.list_validation_results(round_id)
    }

    /// Timer entry point. Skipped while validation is disabled.
    pub async fn tick(&self) -> Result<Option<Arc<RoundState>>> {
        if !self.is_enabled() {
            debug!("Validation disabled, skipping round");
            return Ok(None);
        }
        self.start_round().await.map(Some)
    }

    /// Close the previous round and challenge every paired node.
    pub async fn start_round(&self) -> Result<Arc<RoundState>> {
        let _guard = self.start_lock.lock().await;

        if let Some(previous) = self.dispatch.lock().take() {
            previous.abort();
        }
        if let Some(previous) = self.current_round() {
            let timed_out = self.repo.timeout_validation_results(&previous.round_id)?;
            for _ in 0..timed_out {
                self.metrics.record_validation(ValidationStatus::NodeTimeout.as_str());
            }
            if timed_out > 0 {
                info!(round = %previous.round_id, timed_out, "Previous round closed");
            }
        }

        let round_id = hex::encode(rand::random::<[u8; 8]>());
        let seed: u64 = rand::random();
        let started_at = now_secs();

        let validators: Vec<NodeView> = self
            .directory
            .online_nodes(NodeRole::Candidate)
            .into_iter()
            .filter(|n| n.validation_addr.is_some())
            .collect();
        let mut validatable: Vec<NodeId> = self
            .directory
            .online_nodes(NodeRole::Candidate)
            .into_iter()
            .chain(self.directory.online_nodes(NodeRole::Edge))
            .map(|n| n.node_id)
            .collect();
        validatable.sort();
        let validator_ids: Vec<NodeId> = validators.iter().map(|v| v.node_id.clone()).collect();
        let mut pairing = pair_nodes(&validator_ids, &validatable);

        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::new();
        let mut challenges = Vec::new();
        for validator in &validators {
            let Some(nodes) = pairing.get_mut(&validator.node_id) else {
                continue;
            };
            let Some(validator_addr) = validator.validation_addr.clone() else {
                continue;
            };
            let mut challenged = Vec::with_capacity(nodes.len());
            for node_id in nodes.iter() {
                let Some(archive_cid) = self.pick_archive(node_id, &mut rng)? else {
                    debug!(node = %node_id, "No replicated archive to validate");
                    continue;
                };
                let Some(node) = self.directory.get(node_id) else {
                    continue;
                };
                let mut row = ValidationResultInfo::created(&round_id, node_id, &validator.node_id, seed);
                row.archive_cid = Some(archive_cid.clone());
                rows.push(row);
                challenges.push((
                    node,
                    ValidationChallenge {
                        round_id: round_id.clone(),
                        archive_cid: Some(archive_cid),
                        seed,
                        duration_secs: self.settings.duration_secs,
                        validator_addr: validator_addr.clone(),
                    },
                ));
                challenged.push(node_id.clone());
            }
            *nodes = challenged;
        }
        pairing.retain(|_, nodes| !nodes.is_empty());

        self.repo.record_validation_results(&rows)?;
        let round = Arc::new(RoundState {
            round_id: round_id.clone(),
            seed,
            started_at,
            pairing,
        });
        *self.round.write() = Some(round.clone());
        self.metrics.rounds_started.inc();
        info!(
            round = %round_id,
            validators = round.pairing.len(),
            challenged = challenges.len(),
            "Validation round started"
        );

        let handle = tokio::spawn(dispatch_challenges(
            self.client.clone(),
            self.repo.clone(),
            self.metrics.clone(),
            challenges,
            self.settings.dispatch_timeout,
        ));
        *self.dispatch.lock() = Some(handle);
        Ok(round)
    }

    /// One of the node's succeeded archives at a random offset.
    fn pick_archive(&self, node_id: &str, rng: &mut StdRng) -> Result<Option<String>> {
        let count = self.repo.load_node_replica_count(node_id)?;
        if count == 0 {
            return Ok(None);
        }
        let offset = rng.random_range(0..count);
        Ok(self
            .repo
            .load_asset_identifiers_by_node(node_id, 1, offset)?
            .into_iter()
            .next())
    }

    /// Wait until every challenge of the current round was handed out.
    pub async fn wait_for_dispatch(&self) {
        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Challenge dispatch supervisor failed");
                }
            }
        }
    }

    /// Conclude one node's result from its validator's report.
    pub async fn handle_result(&self, report: ValidationReport) -> Result<ValidationStatus> {
        let round = self
            .current_round()
            .filter(|r| r.round_id == report.round_id)
            .ok_or_else(|| SchedulerError::StaleRound {
                reported: report.round_id.clone(),
            })?;

        let key = format!("{}/{}", round.round_id, report.node_id);
        if !self.in_flight.lock().insert(key.clone()) {
            return Err(SchedulerError::AlreadyFinalized {
                round: round.round_id.clone(),
                node: report.node_id.clone(),
            });
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            key,
        };

        let row = self.load_open_row(&round.round_id, &report.node_id)?;
        let (status, message) = if report.is_cancel {
            (ValidationStatus::Cancel, None)
        } else if report.is_timeout {
            (ValidationStatus::NodeTimeout, Some("stream timed out".to_string()))
        } else if report.cids.is_empty() {
            (ValidationStatus::Other, Some("no blocks received".to_string()))
        } else {
            self.verify(&row, &report).await?
        };

        // The round may have been closed while the referee answered
        let mut row = self.load_open_row(&round.round_id, &report.node_id)?;
        row.status = status;
        row.bandwidth = report.bandwidth;
        row.duration_ms = report.cost_time_ms;
        row.block_count = report.cids.len() as u64;
        row.ended_at = Some(now_secs());
        row.message = message;
        self.repo.update_validation_result(&row)?;

        self.metrics.record_validation(status.as_str());
        if status == ValidationStatus::Success {
            self.metrics.validation_bandwidth.observe(report.bandwidth);
        }
        info!(
            round = %row.round_id,
            node = %row.node_id,
            status = status.as_str(),
            blocks = row.block_count,
            bandwidth = row.bandwidth,
            "Validation result"
        );
        Ok(status)
    }

    fn load_open_row(&self, round_id: &str, node_id: &str) -> Result<ValidationResultInfo> {
        let row = self
            .repo
            .load_validation_result(round_id, node_id)?
            .ok_or_else(|| SchedulerError::not_found("validation result", format!("{round_id}/{node_id}")))?;
        if row.status.is_final() {
            return Err(SchedulerError::AlreadyFinalized {
                round: round_id.to_string(),
                node: node_id.to_string(),
            });
        }
        Ok(row)
    }

    /// Ask referees, in order, to derive the same block sequence. The first
    /// conclusive answer decides.
    async fn verify(
        &self,
        row: &ValidationResultInfo,
        report: &ValidationReport,
    ) -> Result<(ValidationStatus, Option<String>)> {
        let Some(archive_cid) = row.archive_cid.as_deref() else {
            return Ok((ValidationStatus::Other, Some("no archive recorded".to_string())));
        };
        let hash = match content_hash_of(archive_cid) {
            Ok(hash) => hash,
            Err(e) => return Ok((ValidationStatus::Other, Some(e.to_string()))),
        };

        let referees: Vec<NodeView> = self
            .repo
            .load_succeeded_replicas(&hash)?
            .into_iter()
            .filter(|r| r.node_id != row.node_id)
            .filter_map(|r| self.directory.get(&r.node_id))
            .filter(|n| n.online)
            .collect();
        if referees.is_empty() {
            return Ok((ValidationStatus::Other, Some("no referee available".to_string())));
        }

        let count = report.cids.len();
        for referee in referees {
            let call = self.client.blocks_of_asset(&referee, archive_cid, row.seed, count);
            match tokio::time::timeout(self.settings.dispatch_timeout, call).await {
                Ok(Ok(expected)) if expected.len() >= count => {
                    return match compare_blocks(&report.cids, &expected) {
                        Ok(()) => Ok((ValidationStatus::Success, None)),
                        Err(e) => {
                            warn!(
                                node = %row.node_id,
                                referee = %referee.node_id,
                                archive = %archive_cid,
                                error = %e,
                                "Block integrity violation"
                            );
                            Ok((ValidationStatus::BlockFail, Some(e.to_string())))
                        }
                    };
                }
                Ok(Ok(expected)) => debug!(
                    referee = %referee.node_id,
                    got = expected.len(),
                    want = count,
                    "Referee answer too short"
                ),
                Ok(Err(e)) => warn!(referee = %referee.node_id, error = %e, "Referee query failed"),
                Err(_) => warn!(referee = %referee.node_id, "Referee query timed out"),
            }
        }
        Ok((ValidationStatus::Other, Some("no conclusive referee".to_string())))
    }
}

/// Send every challenge with a deadline. A node that refuses or does not
/// answer is concluded as NodeTimeout right away.
async fn dispatch_challenges(
    client: Arc<dyn NodeClient>,
    repo: Arc<dyn Repository>,
    metrics: Metrics,
    challenges: Vec<(NodeView, ValidationChallenge)>,
    timeout: Duration,
) {
    let mut joinset = JoinSet::new();
    for (node, challenge) in challenges {
        let client = client.clone();
        joinset.spawn(async move {
            let res = match tokio::time::timeout(timeout, client.be_validated(&node, &challenge)).await {
                Ok(res) => res,
                Err(_) => Err(SchedulerError::Timeout(format!("challenge to {}", node.node_id))),
            };
            (node.node_id, challenge.round_id, res)
        });
    }

    while let Some(joined) = joinset.join_next().await {
        let (node_id, round_id, res) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Challenge task aborted");
                continue;
            }
        };
        let Err(e) = res else {
            debug!(node = %node_id, round = %round_id, "Challenge accepted");
            continue;
        };
        warn!(node = %node_id, round = %round_id, error = %e, "Challenge dispatch failed");
        match repo.load_validation_result(&round_id, &node_id) {
            Ok(Some(mut row)) if !row.status.is_final() => {
                row.status = ValidationStatus::NodeTimeout;
                row.ended_at = Some(now_secs());
                row.message = Some(e.to_string());
                if let Err(e) = repo.update_validation_result(&row) {
                    error!(node = %node_id, error = %e, "Failed to record challenge failure");
                } else {
                    metrics.record_validation(ValidationStatus::NodeTimeout.as_str());
                }
            }
            Ok(_) => {}
            Err(e) => error!(node = %node_id, error = %e, "Failed to load validation result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ReplicaInfo, SledRepository};
    use crate::rpc::mock::MockNodeClient;
    use common::{CacheStatus, NodeAnnouncement, cid_of_block, content_hash};

    struct Harness {
        engine: ValidationEngine,
        client: Arc<MockNodeClient>,
        repo: Arc<SledRepository>,
        archive_cid: String,
    }

    fn announce(id: &str, role: NodeRole, validation_addr: Option<&str>) -> NodeAnnouncement {
        NodeAnnouncement {
            node_id: id.to_string(),
            role,
            rpc_url: format!("http://{id}"),
            validation_addr: validation_addr.map(str::to_string),
            disk_usage: 0.0,
            asset_top_hash: None,
        }
    }

    fn replica(archive_cid: &str, node: &str, role: NodeRole) -> ReplicaInfo {
        let cid = common::parse_cid(archive_cid).unwrap();
        ReplicaInfo {
            archive_hash: content_hash(&cid),
            root_cid: archive_cid.to_string(),
            node_id: node.to_string(),
            role,
            status: CacheStatus::Succeeded,
            done_blocks: 5,
            done_size: 100,
            created_at: 0,
            ended_at: Some(1),
            deadline: 0,
            attempt: 1,
            message: None,
        }
    }

    fn cids(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| cid_of_block(format!("sampled block {i}").as_bytes()).unwrap().to_string())
            .collect()
    }

    /// Validator `c_v`, challenged edge `e_n`, referee candidate `c_r`.
    fn harness() -> Harness {
        let repo = Arc::new(SledRepository::temporary().unwrap());
        let directory = Arc::new(NodeDirectory::new());
        directory.register(announce("c_v", NodeRole::Candidate, Some("127.0.0.1:7000")));
        directory.register(announce("c_r", NodeRole::Candidate, None));
        directory.register(announce("e_n", NodeRole::Edge, None));

        let archive_cid = cid_of_block(b"validated archive").unwrap().to_string();
        repo.upsert_replica(&replica(&archive_cid, "e_n", NodeRole::Edge)).unwrap();
        repo.upsert_replica(&replica(&archive_cid, "c_r", NodeRole::Candidate)).unwrap();

        let client = Arc::new(MockNodeClient::default());
        let engine = ValidationEngine::new(
            ValidationSettings::default(),
            repo.clone(),
            directory,
            client.clone(),
            Metrics::new(),
        );
        Harness {
            engine,
            client,
            repo,
            archive_cid,
        }
    }

    fn report(round: &RoundState, node: &str, cids: Vec<String>) -> ValidationReport {
        ValidationReport {
            round_id: round.round_id.clone(),
            node_id: node.to_string(),
            cids,
            bandwidth: 1024.0,
            cost_time_ms: 10_000,
            is_cancel: false,
            is_timeout: false,
            random_count: 5,
        }
    }

    #[tokio::test]
    async fn test_round_challenges_paired_nodes() {
        let h = harness();
        let round = h.engine.start_round().await.unwrap();
        h.engine.wait_for_dispatch().await;

        assert_eq!(round.validator_of("e_n").map(String::as_str), Some("c_v"));
        // c_v holds nothing, so only the two holders are challenged
        assert_eq!(round.node_count(), 2);
        let challenges = h.client.challenges.lock().clone();
        assert_eq!(challenges.len(), 2);
        for (_, challenge) in &challenges {
            assert_eq!(challenge.archive_cid.as_deref(), Some(h.archive_cid.as_str()));
            assert_eq!(challenge.validator_addr, "127.0.0.1:7000");
            assert_eq!(challenge.seed, round.seed);
        }

        let rows = h.engine.list_results(Some(&round.round_id)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == ValidationStatus::Created));
    }

    #[tokio::test]
    async fn test_matching_blocks_succeed() {
        let h = harness();
        let round = h.engine.start_round().await.unwrap();
        h.client.answer_as_referee("c_r", cids(5));

        let status = h.engine.handle_result(report(&round, "e_n", cids(5))).await.unwrap();
        assert_eq!(status, ValidationStatus::Success);
        let row = h.repo.load_validation_result(&round.round_id, "e_n").unwrap().unwrap();
        assert_eq!(row.block_count, 5);
        assert_eq!(row.bandwidth, 1024.0);
    }

    #[tokio::test]
    async fn test_third_block_mismatch_is_block_fail() {
        let h = harness();
        let round = h.engine.start_round().await.unwrap();
        h.client.answer_as_referee("c_r", cids(5));

        let mut forged = cids(5);
        forged[2] = cid_of_block(b"not the sampled block").unwrap().to_string();
        let status = h.engine.handle_result(report(&round, "e_n", forged)).await.unwrap();
        assert_eq!(status, ValidationStatus::BlockFail);

        // Concluded results are not re-evaluated
        assert!(matches!(
            h.engine.handle_result(report(&round, "e_n", cids(5))).await,
            Err(SchedulerError::AlreadyFinalized { .. })
        ));
    }

    #[tokio::test]
    async fn test_flags_short_circuit_comparison() {
        let h = harness();
        let round = h.engine.start_round().await.unwrap();

        let mut cancelled = report(&round, "e_n", cids(2));
        cancelled.is_cancel = true;
        assert_eq!(h.engine.handle_result(cancelled).await.unwrap(), ValidationStatus::Cancel);

        let mut timed_out = report(&round, "c_r", cids(2));
        timed_out.is_timeout = true;
        assert_eq!(h.engine.handle_result(timed_out).await.unwrap(), ValidationStatus::NodeTimeout);
    }

    #[tokio::test]
    async fn test_unreachable_referee_is_inconclusive() {
        let h = harness();
        let round = h.engine.start_round().await.unwrap();
        h.client.fail_node("c_r");
        let status = h.engine.handle_result(report(&round, "e_n", cids(5))).await.unwrap();
        assert_eq!(status, ValidationStatus::Other);
    }

    #[tokio::test]
    async fn test_short_referee_answer_is_inconclusive() {
        let h = harness();
        let round = h.engine.start_round().await.unwrap();
        h.client.answer_as_referee("c_r", cids(3));
        let status = h.engine.handle_result(report(&round, "e_n", cids(5))).await.unwrap();
        assert_eq!(status, ValidationStatus::Other);
    }

    #[tokio::test]
    async fn test_new_round_times_out_previous() {
        let h = harness();
        let first = h.engine.start_round().await.unwrap();
        let second = h.engine.start_round().await.unwrap();
        assert_ne!(first.round_id, second.round_id);

        let old = h.engine.list_results(Some(&first.round_id)).unwrap();
        assert!(!old.is_empty());
        assert!(old.iter().all(|r| r.status == ValidationStatus::NodeTimeout));
        let new = h.engine.list_results(Some(&second.round_id)).unwrap();
        assert!(new.iter().all(|r| r.status == ValidationStatus::Created));

        assert!(matches!(
            h.engine.handle_result(report(&first, "e_n", cids(5))).await,
            Err(SchedulerError::StaleRound { .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_challenge_is_node_timeout() {
        let h = harness();
        h.client.fail_node("e_n");
        let round = h.engine.start_round().await.unwrap();
        h.engine.wait_for_dispatch().await;
        let row = h.repo.load_validation_result(&round.round_id, "e_n").unwrap().unwrap();
        assert_eq!(row.status, ValidationStatus::NodeTimeout);
    }

    #[tokio::test]
    async fn test_disabled_tick_does_nothing() {
        let h = harness();
        h.engine.set_enabled(false);
        assert!(h.engine.tick().await.unwrap().is_none());
        assert!(h.engine.current_round().is_none());
        h.engine.set_enabled(true);
        assert!(h.engine.tick().await.unwrap().is_some());
    }
}
