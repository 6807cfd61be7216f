//! The endpoint registry — deployment/tenant → routable endpoints.
//!
//! Routing decisions take the shared lock; health reports and half-open
//! admissions take the exclusive lock for a bounded critical section.
//! Active-connection counts live in atomics so leases can be released
//! without any lock at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use strata_state::{DeploymentRecord, HealthState, IsolationMode, TenantRecord};

use crate::breaker::{BreakerConfig, CircuitBreaker, Routability};
use crate::strategy::{self, Candidate, RoutingStrategy};

/// Health of a single registry entry as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointHealth {
    /// Freshly registered, no probe results yet.
    Unknown,
    Healthy,
    Unhealthy,
}

struct Entry {
    endpoint: String,
    tenant_id: Option<Uuid>,
    weight: f64,
    health: EndpointHealth,
    breaker: CircuitBreaker,
    active: Arc<AtomicUsize>,
    ewma_latency_ms: f64,
}

struct Slot {
    entries: Vec<Entry>,
    strategy: RoutingStrategy,
    rr: AtomicUsize,
}

/// A routed endpoint. Holding the lease counts as one active connection
/// for least-connections balancing; dropping it releases the slot.
pub struct RouteLease {
    pub endpoint: String,
    /// This lease is the single half-open trial for a recovering entry.
    pub half_open: bool,
    active: Arc<AtomicUsize>,
}

impl Drop for RouteLease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Concrete connection descriptor for a tenant, shaped by the
/// deployment's isolation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub endpoint: String,
    /// Set for schema isolation: schema to select after connecting.
    pub schema: Option<String>,
    /// Set for key-prefix isolation: prefix routing hint.
    pub key_prefix: Option<String>,
}

/// Read-only view of one entry, for health summaries and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshotEntry {
    pub endpoint: String,
    pub tenant_id: Option<Uuid>,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub weight: f64,
}

/// Tracks live endpoints per deployment and answers routing queries.
pub struct Registry {
    slots: RwLock<HashMap<Uuid, Slot>>,
    breaker_config: BreakerConfig,
}

impl Registry {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            breaker_config,
        }
    }

    /// Register an endpoint for a deployment. Initial health is Unknown.
    pub fn register(
        &self,
        deployment_id: Uuid,
        endpoint: &str,
        tenant_id: Option<Uuid>,
        weight: f64,
    ) {
        let mut slots = self.slots.write().expect("registry lock");
        let slot = slots.entry(deployment_id).or_insert_with(|| Slot {
            entries: Vec::new(),
            strategy: RoutingStrategy::default(),
            rr: AtomicUsize::new(0),
        });

        // Re-registering an endpoint resets its breaker state.
        slot.entries.retain(|e| e.endpoint != endpoint);
        slot.entries.push(Entry {
            endpoint: endpoint.to_string(),
            tenant_id,
            weight,
            health: EndpointHealth::Unknown,
            breaker: CircuitBreaker::new(self.breaker_config),
            active: Arc::new(AtomicUsize::new(0)),
            ewma_latency_ms: 0.0,
        });
        info!(%deployment_id, endpoint, "endpoint registered");
    }

    /// Configure the routing strategy for a deployment.
    pub fn set_strategy(&self, deployment_id: Uuid, strategy: RoutingStrategy) {
        let mut slots = self.slots.write().expect("registry lock");
        if let Some(slot) = slots.get_mut(&deployment_id) {
            slot.strategy = strategy;
        } else {
            slots.insert(
                deployment_id,
                Slot {
                    entries: Vec::new(),
                    strategy,
                    rr: AtomicUsize::new(0),
                },
            );
        }
    }

    /// Remove one endpoint. Returns true if it existed.
    pub fn deregister_endpoint(&self, deployment_id: Uuid, endpoint: &str) -> bool {
        let mut slots = self.slots.write().expect("registry lock");
        let Some(slot) = slots.get_mut(&deployment_id) else {
            return false;
        };
        let before = slot.entries.len();
        slot.entries.retain(|e| e.endpoint != endpoint);
        let removed = slot.entries.len() < before;
        if removed {
            debug!(%deployment_id, endpoint, "endpoint deregistered");
        }
        removed
    }

    /// Remove all entries for a deployment. Returns number removed.
    pub fn deregister_deployment(&self, deployment_id: Uuid) -> usize {
        let mut slots = self.slots.write().expect("registry lock");
        let removed = slots
            .remove(&deployment_id)
            .map(|slot| slot.entries.len())
            .unwrap_or(0);
        if removed > 0 {
            info!(%deployment_id, removed, "deployment deregistered");
        }
        removed
    }

    /// Select an endpoint for a deployment.
    ///
    /// Healthy entries are balanced per the deployment's strategy. If none
    /// are routable but an open breaker's cooldown has elapsed, a single
    /// half-open trial lease is issued instead.
    pub fn route(&self, deployment_id: Uuid, now: u64) -> Option<RouteLease> {
        // Fast path: shared lock, strategy selection over closed breakers.
        {
            let slots = self.slots.read().expect("registry lock");
            let slot = slots.get(&deployment_id)?;

            let candidates: Vec<Candidate> = slot
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.breaker.routability(now) == Routability::Routable)
                .map(|(index, e)| Candidate {
                    index,
                    active_connections: e.active.load(Ordering::Relaxed),
                    ewma_latency_ms: e.ewma_latency_ms,
                    weight: e.weight,
                })
                .collect();

            if !candidates.is_empty() {
                let tick = slot.rr.fetch_add(1, Ordering::Relaxed);
                let index = strategy::select(slot.strategy, &candidates, tick)?;
                let entry = &slot.entries[index];
                entry.active.fetch_add(1, Ordering::Relaxed);
                return Some(RouteLease {
                    endpoint: entry.endpoint.clone(),
                    half_open: false,
                    active: entry.active.clone(),
                });
            }
        }

        // Slow path: no routable entry. Try to claim a half-open probe.
        let mut slots = self.slots.write().expect("registry lock");
        let slot = slots.get_mut(&deployment_id)?;
        for entry in &mut slot.entries {
            if entry.breaker.try_admit_probe(now) {
                entry.active.fetch_add(1, Ordering::Relaxed);
                return Some(RouteLease {
                    endpoint: entry.endpoint.clone(),
                    half_open: true,
                    active: entry.active.clone(),
                });
            }
        }
        None
    }

    /// Resolve a tenant to a concrete connection descriptor according to
    /// the deployment's isolation mode.
    pub fn resolve_tenant(
        &self,
        record: &DeploymentRecord,
        tenant: &TenantRecord,
        now: u64,
    ) -> Option<ConnectionTarget> {
        match record.isolation {
            IsolationMode::Schema => {
                let lease = self.route(record.id, now)?;
                Some(ConnectionTarget {
                    endpoint: lease.endpoint.clone(),
                    schema: Some(tenant.isolation_key.clone()),
                    key_prefix: None,
                })
            }
            IsolationMode::KeyPrefix => {
                let lease = self.route(record.id, now)?;
                Some(ConnectionTarget {
                    endpoint: lease.endpoint.clone(),
                    schema: None,
                    key_prefix: Some(tenant.isolation_key.clone()),
                })
            }
            IsolationMode::DedicatedInstance => {
                // Dedicated endpoints bypass load balancing entirely.
                let slots = self.slots.read().expect("registry lock");
                let slot = slots.get(&record.id)?;
                slot.entries
                    .iter()
                    .find(|e| {
                        e.tenant_id == Some(tenant.id)
                            && e.breaker.routability(now) == Routability::Routable
                    })
                    .map(|e| ConnectionTarget {
                        endpoint: e.endpoint.clone(),
                        schema: None,
                        key_prefix: None,
                    })
            }
        }
    }

    /// Record a successful request or probe against an endpoint.
    ///
    /// While the entry's breaker is open and cooling down the success does
    /// not restore routability; recovery goes through the half-open probe.
    pub fn report_success(&self, deployment_id: Uuid, endpoint: &str, latency_ms: f64, now: u64) {
        let mut slots = self.slots.write().expect("registry lock");
        let Some(slot) = slots.get_mut(&deployment_id) else {
            return;
        };
        if let Some(entry) = slot.entries.iter_mut().find(|e| e.endpoint == endpoint) {
            entry.breaker.record_success(now);
            if !entry.breaker.is_open() {
                entry.health = EndpointHealth::Healthy;
            }
            entry.ewma_latency_ms = strategy::update_ewma(entry.ewma_latency_ms, latency_ms);
        }
    }

    /// Record a failed request or probe against an endpoint.
    pub fn report_failure(&self, deployment_id: Uuid, endpoint: &str, now: u64) {
        let mut slots = self.slots.write().expect("registry lock");
        let Some(slot) = slots.get_mut(&deployment_id) else {
            return;
        };
        if let Some(entry) = slot.entries.iter_mut().find(|e| e.endpoint == endpoint) {
            entry.breaker.record_failure(now);
            if entry.breaker.is_open() {
                entry.health = EndpointHealth::Unhealthy;
            }
        }
    }

    /// Aggregate health for one deployment, or None if it has no entries.
    pub fn deployment_health(&self, deployment_id: Uuid) -> Option<HealthState> {
        let slots = self.slots.read().expect("registry lock");
        let slot = slots.get(&deployment_id)?;
        if slot.entries.is_empty() {
            return None;
        }

        let unhealthy = slot
            .entries
            .iter()
            .filter(|e| e.health == EndpointHealth::Unhealthy)
            .count();

        Some(if unhealthy == 0 {
            HealthState::Healthy
        } else if unhealthy < slot.entries.len() {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        })
    }

    /// Snapshot of all entries for a deployment.
    pub fn endpoints(&self, deployment_id: Uuid) -> Vec<RegistrySnapshotEntry> {
        let slots = self.slots.read().expect("registry lock");
        slots
            .get(&deployment_id)
            .map(|slot| {
                slot.entries
                    .iter()
                    .map(|e| RegistrySnapshotEntry {
                        endpoint: e.endpoint.clone(),
                        tenant_id: e.tenant_id,
                        health: e.health,
                        consecutive_failures: e.breaker.consecutive_failures(),
                        weight: e.weight,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All `(deployment, endpoint)` pairs, for the probe loop.
    pub fn all_endpoints(&self) -> Vec<(Uuid, String)> {
        let slots = self.slots.read().expect("registry lock");
        slots
            .iter()
            .flat_map(|(id, slot)| {
                slot.entries.iter().map(move |e| (*id, e.endpoint.clone()))
            })
            .collect()
    }
}
