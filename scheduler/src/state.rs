//! Shared scheduler state handed to the router and background loops.

use crate::assets_view::AssetsView;
use crate::config::SchedulerConfig;
use crate::directory::NodeDirectory;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::replication::{ReplicationManager, ReplicationSettings};
use crate::repository::Repository;
use crate::rpc::NodeClient;
use crate::validation::{ValidationEngine, ValidationSettings};
use common::DEFAULT_BUCKET_COUNT;
use std::sync::Arc;

pub struct AppState {
    pub config: SchedulerConfig,
    pub replication: Arc<ReplicationManager>,
    pub validation: Arc<ValidationEngine>,
    pub directory: Arc<NodeDirectory>,
    pub assets: Arc<AssetsView>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wire the orchestrator and validation engine over one repository and
    /// node client.
    pub fn new(
        config: SchedulerConfig,
        repo: Arc<dyn Repository>,
        client: Arc<dyn NodeClient>,
    ) -> Result<Self> {
        let metrics = Metrics::new();
        let directory = Arc::new(NodeDirectory::new());
        let assets = Arc::new(AssetsView::new(DEFAULT_BUCKET_COUNT));

        let replication = Arc::new(ReplicationManager::new(
            ReplicationSettings::from(&config),
            repo.clone(),
            directory.clone(),
            client.clone(),
            assets.clone(),
            metrics.clone(),
        )?);
        let validation = Arc::new(ValidationEngine::new(
            ValidationSettings::from(&config),
            repo,
            directory.clone(),
            client,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            replication,
            validation,
            directory,
            assets,
            metrics,
        })
    }
}
