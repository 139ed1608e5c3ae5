//! Carfile CDN scheduler.
//!
//! Drives archives through the candidate and edge replication tiers, runs
//! periodic validation rounds against the nodes holding them, and keeps a
//! per-node asset summary used to detect divergence.

pub mod api;
pub mod assets_view;
pub mod background;
pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod replication;
pub mod repository;
pub mod rpc;
pub mod state;
pub mod validation;

pub use assets_view::{AssetSummary, AssetsView};
pub use config::{SchedulerConfig, load_config};
pub use directory::{NodeDirectory, NodeView};
pub use error::{Result, SchedulerError};
pub use replication::{AdvanceOutcome, ArchiveSnapshot, ReplicationManager, ReplicationSettings};
pub use repository::{ArchiveInfo, ReplicaInfo, Repository, SledRepository, ValidationResultInfo};
pub use rpc::{HttpNodeClient, NodeClient};
pub use state::AppState;
pub use validation::{ValidationEngine, ValidationSettings};
