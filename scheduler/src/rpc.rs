//! Scheduler-to-node RPC surface.
//!
//! The orchestrator and the validation engine only see [`NodeClient`]; the
//! HTTP implementation below talks to the routes a storage node exposes.

use crate::directory::NodeView;
use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use common::{BlocksOfAssetRequest, CacheRequest, ValidationChallenge};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Ask a node to fetch and cache an archive.
    async fn cache_archive(&self, node: &NodeView, request: &CacheRequest) -> Result<()>;

    /// Ask a node to drop an archive.
    async fn delete_archive(&self, node: &NodeView, root_cid: &str) -> Result<()>;

    /// Issue a validation challenge. Returns once the node accepted it.
    async fn be_validated(&self, node: &NodeView, challenge: &ValidationChallenge) -> Result<()>;

    /// Referee query: CIDs of draws `0..count` for `seed` over `root_cid`.
    async fn blocks_of_asset(
        &self,
        node: &NodeView,
        root_cid: &str,
        seed: u64,
        count: usize,
    ) -> Result<Vec<String>>;
}

/// [`NodeClient`] over each node's HTTP API.
pub struct HttpNodeClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNodeClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client, timeout })
    }

    fn url(node: &NodeView, path: &str) -> String {
        format!("{}{}", node.rpc_url.trim_end_matches('/'), path)
    }

    async fn check(node: &NodeView, res: reqwest::Result<reqwest::Response>) -> Result<reqwest::Response> {
        match res {
            Ok(res) if res.status().is_success() => Ok(res),
            Ok(res) => {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                Err(SchedulerError::rpc(&node.node_id, format!("{status}: {body}")))
            }
            Err(e) if e.is_timeout() => Err(SchedulerError::Timeout(format!("rpc to {}", node.node_id))),
            Err(e) => Err(SchedulerError::rpc(&node.node_id, e)),
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn cache_archive(&self, node: &NodeView, request: &CacheRequest) -> Result<()> {
        debug!(node = %node.node_id, root = %request.root_cid, sources = request.sources.len(), "Dispatching cache");
        let res = self
            .client
            .post(Self::url(node, "/archives"))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await;
        Self::check(node, res).await.map(|_| ())
    }

    async fn delete_archive(&self, node: &NodeView, root_cid: &str) -> Result<()> {
        let res = self
            .client
            .delete(Self::url(node, &format!("/archives/{root_cid}")))
            .timeout(self.timeout)
            .send()
            .await;
        Self::check(node, res).await.map(|_| ())
    }

    async fn be_validated(&self, node: &NodeView, challenge: &ValidationChallenge) -> Result<()> {
        let res = self
            .client
            .post(Self::url(node, "/validate"))
            .timeout(self.timeout)
            .json(challenge)
            .send()
            .await;
        Self::check(node, res).await.map(|_| ())
    }

    async fn blocks_of_asset(
        &self,
        node: &NodeView,
        root_cid: &str,
        seed: u64,
        count: usize,
    ) -> Result<Vec<String>> {
        let request = BlocksOfAssetRequest {
            root_cid: root_cid.to_string(),
            seed,
            count,
        };
        let res = self
            .client
            .post(Self::url(node, "/blocks-of-asset"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await;
        let res = Self::check(node, res).await?;
        res.json::<Vec<String>>()
            .await
            .map_err(|e| SchedulerError::rpc(&node.node_id, e))
    }
}

/// Scripted in-process client shared by the scheduler's tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    pub struct MockNodeClient {
        /// (node, root) of every accepted cache dispatch
        pub cache_calls: Mutex<Vec<(String, CacheRequest)>>,
        pub delete_calls: Mutex<Vec<(String, String)>>,
        pub challenges: Mutex<Vec<(String, ValidationChallenge)>>,
        /// Nodes whose calls fail
        pub failing: Mutex<HashSet<String>>,
        /// Referee answers keyed by node id
        pub referee_answers: Mutex<HashMap<String, Vec<String>>>,
    }

    impl MockNodeClient {
        pub fn fail_node(&self, node_id: &str) {
            self.failing.lock().insert(node_id.to_string());
        }

        pub fn answer_as_referee(&self, node_id: &str, cids: Vec<String>) {
            self.referee_answers.lock().insert(node_id.to_string(), cids);
        }

        pub fn cached_nodes(&self) -> Vec<String> {
            self.cache_calls.lock().iter().map(|(n, _)| n.clone()).collect()
        }

        fn check(&self, node: &NodeView) -> Result<()> {
            if self.failing.lock().contains(&node.node_id) {
                return Err(SchedulerError::rpc(&node.node_id, "connection refused"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NodeClient for MockNodeClient {
        async fn cache_archive(&self, node: &NodeView, request: &CacheRequest) -> Result<()> {
            self.check(node)?;
            self.cache_calls
                .lock()
                .push((node.node_id.clone(), request.clone()));
            Ok(())
        }

        async fn delete_archive(&self, node: &NodeView, root_cid: &str) -> Result<()> {
            self.check(node)?;
            self.delete_calls
                .lock()
                .push((node.node_id.clone(), root_cid.to_string()));
            Ok(())
        }

        async fn be_validated(&self, node: &NodeView, challenge: &ValidationChallenge) -> Result<()> {
            self.check(node)?;
            self.challenges
                .lock()
                .push((node.node_id.clone(), challenge.clone()));
            Ok(())
        }

        async fn blocks_of_asset(
            &self,
            node: &NodeView,
            _root_cid: &str,
            _seed: u64,
            count: usize,
        ) -> Result<Vec<String>> {
            self.check(node)?;
            let answers = self.referee_answers.lock();
            let cids = answers
                .get(&node.node_id)
                .ok_or_else(|| SchedulerError::rpc(&node.node_id, "archive not held"))?;
            Ok(cids.iter().take(count).cloned().collect())
        }
    }
}
