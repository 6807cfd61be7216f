//! Load-balancing strategies for endpoint selection.
//!
//! Selection operates on candidate indices plus per-entry load data; the
//! registry owns the entry list and calls into here under its read lock.

use serde::{Deserialize, Serialize};

/// Per-deployment routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    LatencyWeighted,
}

/// Candidate endpoint data the strategies select over.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    /// Index into the deployment's entry list.
    pub index: usize,
    /// Currently active (leased) connections.
    pub active_connections: usize,
    /// Exponentially weighted moving average of observed latency.
    pub ewma_latency_ms: f64,
    /// Static routing weight (higher = preferred).
    pub weight: f64,
}

/// Pick a candidate according to the strategy.
///
/// `rr_tick` is a monotonically increasing counter owned by the caller
/// (one per deployment) that drives round-robin rotation.
pub fn select(strategy: RoutingStrategy, candidates: &[Candidate], rr_tick: usize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let chosen = match strategy {
        RoutingStrategy::RoundRobin => candidates[rr_tick % candidates.len()],
        RoutingStrategy::LeastConnections => {
            // Ties broken by list position for determinism.
            *candidates
                .iter()
                .min_by_key(|c| (c.active_connections, c.index))
                .expect("non-empty candidates")
        }
        RoutingStrategy::LatencyWeighted => {
            // Effective cost is observed latency divided by weight; lower
            // wins. Unobserved endpoints (EWMA 0) are tried first.
            *candidates
                .iter()
                .min_by(|a, b| {
                    let ca = a.ewma_latency_ms / a.weight.max(f64::EPSILON);
                    let cb = b.ewma_latency_ms / b.weight.max(f64::EPSILON);
                    ca.partial_cmp(&cb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.index.cmp(&b.index))
                })
                .expect("non-empty candidates")
        }
    };

    Some(chosen.index)
}

/// Update an EWMA latency with a new observation (alpha = 0.3).
pub fn update_ewma(current: f64, observed_ms: f64) -> f64 {
    const ALPHA: f64 = 0.3;
    if current == 0.0 {
        observed_ms
    } else {
        ALPHA * observed_ms + (1.0 - ALPHA) * current
    }
}
