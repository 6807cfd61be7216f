//! Node selection for replica placement.
//!
//! Picks the least-loaded eligible node for each replica: among nodes
//! that are not draining and can fit the requested cpu and memory, the
//! one with the most free cpu wins; ties fall to the most free memory,
//! then to lexicographic node id. The rule is deterministic so repeated
//! placement over identical inventories yields identical plans.

use strata_state::{NodeRecord, ResourceSpec};

/// A ranked eligible node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeScore {
    pub node_id: String,
    pub free_cpu_millis: u32,
    pub free_memory_bytes: u64,
}

/// Rank eligible nodes, best placement target first.
pub fn rank_nodes(nodes: &[NodeRecord], resources: &ResourceSpec) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .filter(|n| {
            !n.draining
                && n.free_cpu() >= resources.cpu_millis
                && n.free_memory() >= resources.memory_bytes
        })
        .map(|n| NodeScore {
            node_id: n.id.clone(),
            free_cpu_millis: n.free_cpu(),
            free_memory_bytes: n.free_memory(),
        })
        .collect();

    scores.sort_by(|a, b| {
        b.free_cpu_millis
            .cmp(&a.free_cpu_millis)
            .then(b.free_memory_bytes.cmp(&a.free_memory_bytes))
            .then(a.node_id.cmp(&b.node_id))
    });
    scores
}

/// Select the single best node, or None if nothing fits.
pub fn select_node(nodes: &[NodeRecord], resources: &ResourceSpec) -> Option<String> {
    rank_nodes(nodes, resources).into_iter().next().map(|s| s.node_id)
}
