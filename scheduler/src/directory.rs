//! Node directory: the scheduler's live view of candidate and edge nodes.
//!
//! Nodes announce themselves through `/nodes/connect` and repeat the
//! announcement as a heartbeat. Each entry carries the node's disk usage and
//! its concurrent cache task count, which the replication tiers read when
//! choosing the least busy nodes.

use common::{NodeAnnouncement, NodeId, NodeRole, now_secs};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Snapshot of one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub rpc_url: String,
    pub validation_addr: Option<String>,
    /// Percent
    pub disk_usage: f64,
    /// Cache tasks currently running on this node
    pub cache_count: usize,
    pub online: bool,
    pub last_seen: u64,
    /// Token edges present when pulling from this node
    #[serde(skip_serializing, default)]
    pub access_token: String,
}

struct Descriptor {
    role: NodeRole,
    rpc_url: String,
    validation_addr: Option<String>,
    disk_usage: f64,
    online: bool,
    last_seen: u64,
    access_token: String,
}

struct NodeEntry {
    descriptor: RwLock<Descriptor>,
    cache_count: AtomicUsize,
}

impl NodeEntry {
    fn view(&self, node_id: &str) -> NodeView {
        let d = self.descriptor.read();
        NodeView {
            node_id: node_id.to_string(),
            role: d.role,
            rpc_url: d.rpc_url.clone(),
            validation_addr: d.validation_addr.clone(),
            disk_usage: d.disk_usage,
            cache_count: self.cache_count.load(Ordering::Relaxed),
            online: d.online,
            last_seen: d.last_seen,
            access_token: d.access_token.clone(),
        }
    }
}

#[derive(Default)]
pub struct NodeDirectory {
    nodes: DashMap<NodeId, Arc<NodeEntry>>,
}

fn random_hex(bytes: usize) -> String {
    let buf: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    hex::encode(buf)
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh node id carrying the role prefix.
    pub fn allocate_id(role: NodeRole) -> NodeId {
        format!("{}{}", role.id_prefix(), random_hex(8))
    }

    /// Insert or refresh a node from its announcement. An empty id is
    /// replaced by a freshly allocated one.
    pub fn register(&self, mut announcement: NodeAnnouncement) -> NodeView {
        if announcement.node_id.trim().is_empty() {
            announcement.node_id = Self::allocate_id(announcement.role);
        }
        let now = now_secs();
        let node_id = announcement.node_id.clone();

        if let Some(entry) = self.nodes.get(&node_id) {
            let mut d = entry.descriptor.write();
            if !d.online {
                info!(node = %node_id, role = %d.role, "Node back online");
            }
            d.role = announcement.role;
            d.rpc_url = announcement.rpc_url;
            d.validation_addr = announcement.validation_addr;
            d.disk_usage = announcement.disk_usage;
            d.online = true;
            d.last_seen = now;
            drop(d);
            debug!(node = %node_id, "Node heartbeat");
            return entry.view(&node_id);
        }

        let entry = Arc::new(NodeEntry {
            descriptor: RwLock::new(Descriptor {
                role: announcement.role,
                rpc_url: announcement.rpc_url,
                validation_addr: announcement.validation_addr,
                disk_usage: announcement.disk_usage,
                online: true,
                last_seen: now,
                access_token: random_hex(16),
            }),
            cache_count: AtomicUsize::new(0),
        });
        let view = entry.view(&node_id);
        self.nodes.insert(node_id.clone(), entry);
        info!(node = %node_id, role = %view.role, rpc = %view.rpc_url, "Node registered");
        view
    }

    pub fn get(&self, node_id: &str) -> Option<NodeView> {
        self.nodes.get(node_id).map(|e| e.view(node_id))
    }

    pub fn get_candidate(&self, node_id: &str) -> Option<NodeView> {
        self.get(node_id).filter(|n| n.role == NodeRole::Candidate)
    }

    pub fn get_edge(&self, node_id: &str) -> Option<NodeView> {
        self.get(node_id).filter(|n| n.role == NodeRole::Edge)
    }

    /// Online nodes of one role, sorted by id.
    pub fn online_nodes(&self, role: NodeRole) -> Vec<NodeView> {
        let mut nodes: Vec<NodeView> = self
            .nodes
            .iter()
            .map(|e| e.value().view(e.key()))
            .filter(|n| n.online && n.role == role)
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn all_nodes(&self) -> Vec<NodeView> {
        let mut nodes: Vec<NodeView> = self.nodes.iter().map(|e| e.value().view(e.key())).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Mark nodes not seen since `now - max_age` offline. Returns how many.
    pub fn mark_stale(&self, now: u64, max_age: u64) -> usize {
        let mut count = 0;
        for entry in self.nodes.iter() {
            let mut d = entry.descriptor.write();
            if d.online && now.saturating_sub(d.last_seen) > max_age {
                d.online = false;
                count += 1;
                info!(node = %entry.key(), "Node marked offline");
            }
        }
        count
    }

    pub fn increment_cache_count(&self, node_id: &str) {
        if let Some(entry) = self.nodes.get(node_id) {
            entry.cache_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn decrement_cache_count(&self, node_id: &str) {
        if let Some(entry) = self.nodes.get(node_id) {
            let _ = entry
                .cache_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1)));
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
