//! Execution substrate — provisioning and lifecycle of database processes.
//!
//! The control plane treats substrate handles as opaque: it provisions,
//! starts, stops, and destroys them, and reads raw resource counters, but
//! never interprets what a handle refers to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use strata_state::{EngineType, ResourceSpec, ResourceUtilization};

use crate::template::EngineTemplate;

/// Result type alias for substrate operations.
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Errors returned by the execution substrate.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// Recoverable condition (timeout, temporary unavailability). The
    /// caller retries these with backoff.
    #[error("transient substrate error: {0}")]
    Transient(String),

    /// Unrecoverable condition (invalid spec discovered at provision time).
    /// Never retried.
    #[error("permanent substrate error: {0}")]
    Permanent(String),

    #[error("unknown handle: {0}")]
    UnknownHandle(String),
}

/// What the substrate needs to provision one replica.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub deployment_id: Uuid,
    pub engine: EngineType,
    /// Placement target chosen by the deployer.
    pub node_id: String,
    pub resources: ResourceSpec,
    /// Engine configuration applied when the process boots.
    pub template: EngineTemplate,
    /// Which replica of the deployment this is (0-based).
    pub replica_index: u32,
}

/// Opaque reference to a provisioned database process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstrateHandle {
    /// Substrate-assigned identifier. The control plane only stores it.
    pub id: String,
    /// Routable endpoint (`host:port`) for the process.
    pub endpoint: String,
}

/// The runtime that starts and stops database processes.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    async fn provision(&self, spec: &ProvisionSpec) -> SubstrateResult<SubstrateHandle>;
    async fn start(&self, handle: &SubstrateHandle) -> SubstrateResult<()>;
    async fn stop(&self, handle: &SubstrateHandle) -> SubstrateResult<()>;
    async fn destroy(&self, handle: &SubstrateHandle) -> SubstrateResult<()>;
    async fn get_metrics(&self, handle: &SubstrateHandle) -> SubstrateResult<ResourceUtilization>;
}

/// Result of probing an endpoint's health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// The endpoint answered within the timeout.
    Healthy { latency_ms: f64 },
    /// The endpoint answered but reported trouble.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

/// Performs a health round-trip against a routable endpoint.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome;
}

// ── Deterministic fake ─────────────────────────────────────────────

/// Engine listen ports used by the fake when minting endpoints.
fn engine_port(engine: EngineType) -> u16 {
    match engine {
        EngineType::Relational => 5432,
        EngineType::KeyValue => 6379,
    }
}

#[derive(Default)]
struct FakeInner {
    /// Live handles: id → (endpoint, running flag).
    handles: HashMap<String, (String, bool)>,
    /// Remaining provision calls that should fail transiently.
    transient_failures: u32,
    /// All further provision calls fail permanently.
    permanent_failure: bool,
    /// Provision fails transiently once this many handles are live.
    capacity: Option<usize>,
    /// Artificial latency injected into provision calls.
    provision_delay: Option<std::time::Duration>,
    /// Scripted metrics per handle id.
    metrics: HashMap<String, ResourceUtilization>,
    /// Template applied to each provisioned handle.
    applied: HashMap<String, EngineTemplate>,
    /// Endpoints scripted to fail health probes.
    unhealthy_endpoints: HashMap<String, bool>,
}

/// In-memory substrate with fully deterministic behavior.
///
/// Used by tests and standalone mode. Tracks live handles so tests can
/// audit that rollback left nothing provisioned, and supports scripted
/// failures to exercise the deployer's retry and rollback paths.
pub struct FakeSubstrate {
    inner: Mutex<FakeInner>,
    next_id: AtomicU64,
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The next `n` provision calls fail with a transient error.
    pub fn fail_provisions(&self, n: u32) {
        self.inner.lock().expect("fake lock").transient_failures = n;
    }

    /// All further provision calls fail with a permanent error.
    pub fn fail_permanently(&self, enabled: bool) {
        self.inner.lock().expect("fake lock").permanent_failure = enabled;
    }

    /// Cap live handles: provisioning beyond the cap fails transiently.
    pub fn set_capacity(&self, cap: Option<usize>) {
        self.inner.lock().expect("fake lock").capacity = cap;
    }

    /// Inject latency into every provision call.
    pub fn set_provision_delay(&self, delay: Option<std::time::Duration>) {
        self.inner.lock().expect("fake lock").provision_delay = delay;
    }

    /// Script the metrics returned for a handle.
    pub fn set_metrics(&self, handle_id: &str, util: ResourceUtilization) {
        self.inner
            .lock()
            .expect("fake lock")
            .metrics
            .insert(handle_id.to_string(), util);
    }

    /// Script an endpoint to fail (or stop failing) health probes.
    pub fn set_endpoint_unhealthy(&self, endpoint: &str, unhealthy: bool) {
        self.inner
            .lock()
            .expect("fake lock")
            .unhealthy_endpoints
            .insert(endpoint.to_string(), unhealthy);
    }

    /// Ids of all currently provisioned handles (the rollback audit).
    pub fn live_handles(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("fake lock");
        let mut ids: Vec<String> = inner.handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a handle is currently running.
    pub fn is_running(&self, handle_id: &str) -> bool {
        let inner = self.inner.lock().expect("fake lock");
        inner.handles.get(handle_id).is_some_and(|(_, running)| *running)
    }

    /// The engine template that was applied when the handle was provisioned.
    pub fn applied_template(&self, handle_id: &str) -> Option<EngineTemplate> {
        let inner = self.inner.lock().expect("fake lock");
        inner.applied.get(handle_id).cloned()
    }
}

impl Default for FakeSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionSubstrate for FakeSubstrate {
    async fn provision(&self, spec: &ProvisionSpec) -> SubstrateResult<SubstrateHandle> {
        let delay = self.inner.lock().expect("fake lock").provision_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().expect("fake lock");

        if spec.template.config_artifacts.is_empty() {
            return Err(SubstrateError::Permanent(
                "engine template carries no config artifacts".to_string(),
            ));
        }
        if inner.permanent_failure {
            return Err(SubstrateError::Permanent(
                "substrate rejected resource spec".to_string(),
            ));
        }
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(SubstrateError::Transient(
                "substrate temporarily unavailable".to_string(),
            ));
        }
        if let Some(cap) = inner.capacity
            && inner.handles.len() >= cap
        {
            return Err(SubstrateError::Transient(format!(
                "substrate at capacity ({cap} handles)"
            )));
        }

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("sub-{seq}");
        let endpoint = format!(
            "10.40.{}.{}:{}",
            seq / 256,
            seq % 256,
            engine_port(spec.engine)
        );
        inner.handles.insert(id.clone(), (endpoint.clone(), false));
        inner.applied.insert(id.clone(), spec.template.clone());

        debug!(handle = %id, %endpoint, replica = spec.replica_index, "fake provisioned");
        Ok(SubstrateHandle { id, endpoint })
    }

    async fn start(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        let mut inner = self.inner.lock().expect("fake lock");
        match inner.handles.get_mut(&handle.id) {
            Some((_, running)) => {
                *running = true;
                Ok(())
            }
            None => Err(SubstrateError::UnknownHandle(handle.id.clone())),
        }
    }

    async fn stop(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        let mut inner = self.inner.lock().expect("fake lock");
        match inner.handles.get_mut(&handle.id) {
            Some((_, running)) => {
                *running = false;
                Ok(())
            }
            None => Err(SubstrateError::UnknownHandle(handle.id.clone())),
        }
    }

    async fn destroy(&self, handle: &SubstrateHandle) -> SubstrateResult<()> {
        let mut inner = self.inner.lock().expect("fake lock");
        if inner.handles.remove(&handle.id).is_none() {
            return Err(SubstrateError::UnknownHandle(handle.id.clone()));
        }
        inner.metrics.remove(&handle.id);
        inner.applied.remove(&handle.id);
        debug!(handle = %handle.id, "fake destroyed");
        Ok(())
    }

    async fn get_metrics(&self, handle: &SubstrateHandle) -> SubstrateResult<ResourceUtilization> {
        let inner = self.inner.lock().expect("fake lock");
        if !inner.handles.contains_key(&handle.id) {
            return Err(SubstrateError::UnknownHandle(handle.id.clone()));
        }
        Ok(inner.metrics.get(&handle.id).copied().unwrap_or_default())
    }
}

#[async_trait]
impl EndpointProber for FakeSubstrate {
    async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        let inner = self.inner.lock().expect("fake lock");
        if inner
            .unhealthy_endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(false)
        {
            return ProbeOutcome::Failed;
        }
        // An endpoint is healthy only while its handle exists and runs.
        let known = inner
            .handles
            .values()
            .any(|(ep, running)| ep == endpoint && *running);
        if known {
            ProbeOutcome::Healthy { latency_ms: 1.0 }
        } else {
            ProbeOutcome::Failed
        }
    }
}
