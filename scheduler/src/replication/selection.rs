//! Node selection shared by every replication tier.

use crate::directory::NodeView;
use crate::error::{Result, SchedulerError};
use common::{NodeId, NodeRole};
use std::collections::HashSet;

/// Choose up to `needed` nodes of `role` from `nodes`.
///
/// Nodes in `holders` (already cached or still caching this archive) and
/// nodes above `disk_usage_max` are skipped. The rest are ordered by their
/// running cache task count, ties broken by id, and the first `needed` are
/// returned. An empty pool yields [`SchedulerError::Unavailable`] with the
/// exclusion breakdown.
pub fn select_nodes(
    nodes: Vec<NodeView>,
    role: NodeRole,
    holders: &HashSet<NodeId>,
    disk_usage_max: f64,
    needed: usize,
) -> Result<Vec<NodeView>> {
    if needed == 0 {
        return Ok(Vec::new());
    }

    let mut total = 0;
    let mut already_cached = 0;
    let mut disk_full = 0;
    let mut pool = Vec::new();
    for node in nodes.into_iter().filter(|n| n.role == role) {
        total += 1;
        if holders.contains(&node.node_id) {
            already_cached += 1;
        } else if node.disk_usage > disk_usage_max {
            disk_full += 1;
        } else {
            pool.push(node);
        }
    }

    if pool.is_empty() {
        return Err(SchedulerError::Unavailable {
            role,
            total,
            already_cached,
            disk_full,
            needed,
        });
    }

    pool.sort_by(|a, b| {
        a.cache_count
            .cmp(&b.cache_count)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    pool.truncate(needed);
    Ok(pool)
}
