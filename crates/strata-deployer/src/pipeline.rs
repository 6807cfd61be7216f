//! The ten-stage deployment pipeline.
//!
//! Each stage runs under its own timeout and retries transient failures
//! with exponential backoff. The pipeline as a whole runs under an
//! aggregate deadline. Any failure, cancellation, or deadline breach
//! triggers a compensating rollback that destroys every substrate handle,
//! deregisters every endpoint, and releases every node reservation the
//! pipeline accumulated, then marks the deployment Failed.
//!
//! ```text
//!  1 validate      → QuotaValidated
//!  2 placement     → Provisioning
//!  3 template
//!  4 provision + start (per replica)
//!  5 network       → Configuring
//!  6 security
//!  7 monitoring
//!  8 register      → Registering
//!  9 health probe  → HealthValidating
//! 10 finalize      → Active
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strata_engine::{
    EndpointProber, EngineTemplateProvider, ExecutionSubstrate, ProbeOutcome, ProvisionSpec,
    SubstrateError, SubstrateHandle,
};
use strata_registry::Registry;
use strata_state::{
    DeploymentRecord, DeploymentState, HealthSnapshot, HealthState, ReplicaEndpoint, ResourceSpec,
    StateError, StateStore,
};

use crate::error::{DeployError, DeployResult};
use crate::placement::select_node;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Placement,
    Template,
    Provision,
    Network,
    Security,
    Monitoring,
    Register,
    HealthCheck,
    Finalize,
}

/// Timeouts and retry tuning for the pipeline.
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Per-stage timeout. A breach counts as a transient failure.
    pub stage_timeout: Duration,
    /// Aggregate deadline for the whole pipeline. A breach forces rollback.
    pub pipeline_timeout: Duration,
    /// Attempts per stage before the pipeline gives up.
    pub max_attempts: u32,
    /// Backoff base; doubles on every retry.
    pub retry_base_delay: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            pipeline_timeout: Duration::from_secs(300),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

/// Invoked after every persisted deployment state change.
pub type TransitionCallback = Arc<dyn Fn(Uuid, DeploymentState) + Send + Sync>;

/// Everything the pipeline has allocated so far, for compensating rollback.
///
/// Lives behind an `Arc<Mutex<_>>` shared with the pipeline future, so
/// rollback still sees every allocation when the aggregate deadline drops
/// the future mid-stage.
#[derive(Default)]
struct RollbackSet {
    handles: Vec<SubstrateHandle>,
    registered: Vec<String>,
    /// `(node_id, cpu_millis, memory_bytes)` reservations to release.
    placements: Vec<(String, u32, u64)>,
}

/// Drives deployments through the provisioning pipeline, scaling, and
/// decommissioning. One instance serves the whole process; callers are
/// responsible for per-deployment mutual exclusion.
pub struct Deployer {
    state: StateStore,
    registry: Arc<Registry>,
    substrate: Arc<dyn ExecutionSubstrate>,
    templates: Arc<dyn EngineTemplateProvider>,
    prober: Arc<dyn EndpointProber>,
    config: DeployerConfig,
    on_transition: Option<TransitionCallback>,
}

impl Deployer {
    pub fn new(
        state: StateStore,
        registry: Arc<Registry>,
        substrate: Arc<dyn ExecutionSubstrate>,
        templates: Arc<dyn EngineTemplateProvider>,
        prober: Arc<dyn EndpointProber>,
        config: DeployerConfig,
    ) -> Self {
        Self {
            state,
            registry,
            substrate,
            templates,
            prober,
            config,
            on_transition: None,
        }
    }

    /// Install a callback fired after every persisted state transition.
    pub fn with_transition_callback(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    /// Run the full pipeline for a deployment in the Requested state.
    ///
    /// Setting the cancel channel to `true` aborts the pipeline at the
    /// next stage boundary and rolls back.
    pub async fn run(
        &self,
        id: Uuid,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<DeploymentRecord> {
        let rollback = Arc::new(Mutex::new(RollbackSet::default()));
        let outcome = tokio::time::timeout(
            self.config.pipeline_timeout,
            self.execute(id, &cancel, &rollback),
        )
        .await;

        match outcome {
            Ok(Ok(rec)) => Ok(rec),
            Ok(Err(err)) => {
                self.rollback(id, &rollback, &err.to_string()).await;
                Err(err)
            }
            Err(_) => {
                let err = DeployError::PipelineTimeout;
                self.rollback(id, &rollback, &err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        id: Uuid,
        cancel: &watch::Receiver<bool>,
        rollback: &Arc<Mutex<RollbackSet>>,
    ) -> DeployResult<DeploymentRecord> {
        let record = self
            .state
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;

        // Stage 1: validate the resource spec.
        checkpoint(cancel)?;
        validate_spec(&record)?;
        self.transition(id, DeploymentState::QuotaValidated)?;

        // Stage 2: place replicas onto nodes and reserve capacity.
        checkpoint(cancel)?;
        self.transition(id, DeploymentState::Provisioning)?;
        let placements = self.place_replicas(&record, rollback)?;

        // Stage 3: generate engine configuration.
        checkpoint(cancel)?;
        let template = self.templates.generate(record.engine, &record.resources)?;
        debug!(
            %id,
            artifacts = template.config_artifacts.len(),
            "engine template generated"
        );

        // Stage 4: provision and start each replica with the generated
        // configuration.
        checkpoint(cancel)?;
        let mut handles = Vec::with_capacity(placements.len());
        for (index, node_id) in placements.iter().enumerate() {
            let spec = ProvisionSpec {
                deployment_id: id,
                engine: record.engine,
                node_id: node_id.clone(),
                resources: record.resources,
                template: template.clone(),
                replica_index: index as u32,
            };
            let handle = self
                .retry_stage(Stage::Provision, || {
                    let substrate = Arc::clone(&self.substrate);
                    let rollback = Arc::clone(rollback);
                    let spec = spec.clone();
                    async move {
                        let handle = substrate.provision(&spec).await?;
                        // Track before start so a dropped future still
                        // reaches rollback.
                        rollback
                            .lock()
                            .expect("rollback lock")
                            .handles
                            .push(handle.clone());
                        if let Err(err) = substrate.start(&handle).await {
                            let _ = substrate.destroy(&handle).await;
                            return Err(err.into());
                        }
                        Ok(handle)
                    }
                })
                .await?;
            handles.push(handle);
        }

        // Stage 5: network policy. The decision is persisted on the record
        // at finalization so clients can discover it.
        self.transition(id, DeploymentState::Configuring)?;
        checkpoint(cancel)?;
        let tls_required = matches!(record.environment, strata_state::Environment::Prod);
        debug!(%id, isolation = ?record.isolation, tls_required, "network policy decided");

        // Stage 6: mint the admin credential. Persisted at finalization,
        // revoked on decommission.
        checkpoint(cancel)?;
        let admin_credential = Uuid::new_v4();
        debug!(%id, credential = %admin_credential, "admin credential minted");

        // Stage 7: monitoring hookup. Verifies every replica reports
        // metrics; the first sample seeds the health history.
        checkpoint(cancel)?;
        let mut seed_util = None;
        for handle in &handles {
            let util = self
                .retry_stage(Stage::Monitoring, || {
                    let substrate = Arc::clone(&self.substrate);
                    let handle = handle.clone();
                    async move { Ok(substrate.get_metrics(&handle).await?) }
                })
                .await?;
            seed_util.get_or_insert(util);
        }

        // Stage 8: register endpoints for routing.
        self.transition(id, DeploymentState::Registering)?;
        checkpoint(cancel)?;
        for handle in &handles {
            self.registry.register(id, &handle.endpoint, None, 1.0);
            rollback
                .lock()
                .expect("rollback lock")
                .registered
                .push(handle.endpoint.clone());
        }

        // Stage 9: validate every endpoint answers health probes.
        self.transition(id, DeploymentState::HealthValidating)?;
        checkpoint(cancel)?;
        let mut probe_latency: f64 = 0.0;
        for handle in &handles {
            let latency = self
                .retry_stage(Stage::HealthCheck, || {
                    let prober = Arc::clone(&self.prober);
                    let endpoint = handle.endpoint.clone();
                    async move {
                        match prober.probe(&endpoint).await {
                            ProbeOutcome::Healthy { latency_ms } => Ok(latency_ms),
                            outcome => Err(DeployError::Provisioning(format!(
                                "endpoint {endpoint} probe returned {outcome:?}"
                            ))),
                        }
                    }
                })
                .await?;
            probe_latency = probe_latency.max(latency);
        }

        // Stage 10: persist endpoints and go Active.
        checkpoint(cancel)?;
        let now = epoch_secs();
        let mut rec = self
            .state
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
        if !rec.state.can_transition_to(DeploymentState::Active) {
            return Err(DeployError::State(StateError::InvalidTransition(format!(
                "deployment {id}: {:?} → Active",
                rec.state
            ))));
        }
        rec.endpoints = handles
            .iter()
            .zip(placements.iter())
            .map(|(handle, node_id)| ReplicaEndpoint {
                address: handle.endpoint.clone(),
                handle_id: handle.id.clone(),
                node_id: node_id.clone(),
            })
            .collect();
        rec.tls_required = tls_required;
        rec.admin_credential = Some(admin_credential);
        rec.state = DeploymentState::Active;
        rec.updated_at = now;
        self.state.put_deployment(&rec)?;
        self.notify(id, DeploymentState::Active);

        if let Some(utilization) = seed_util {
            self.state.put_health(&HealthSnapshot {
                deployment_id: id,
                timestamp: now,
                status: HealthState::Healthy,
                latency_ms: probe_latency,
                utilization,
            })?;
        }

        info!(%id, replicas = rec.endpoints.len(), "deployment active");
        Ok(rec)
    }

    /// Pick a node for each replica and persist the capacity reservation.
    fn place_replicas(
        &self,
        record: &DeploymentRecord,
        rollback: &Arc<Mutex<RollbackSet>>,
    ) -> DeployResult<Vec<String>> {
        let mut nodes = self.state.list_nodes()?;
        let mut assigned = Vec::with_capacity(record.resources.replicas as usize);

        for _ in 0..record.resources.replicas {
            let Some(node_id) = select_node(&nodes, &record.resources) else {
                return Err(DeployError::NoCapacity);
            };
            if let Some(node) = nodes.iter_mut().find(|n| n.id == node_id) {
                node.used_cpu_millis += record.resources.cpu_millis;
                node.used_memory_bytes += record.resources.memory_bytes;
                node.updated_at = epoch_secs();
                self.state.put_node(node)?;
            }
            rollback.lock().expect("rollback lock").placements.push((
                node_id.clone(),
                record.resources.cpu_millis,
                record.resources.memory_bytes,
            ));
            debug!(deployment = %record.id, node = %node_id, "replica placed");
            assigned.push(node_id);
        }
        Ok(assigned)
    }

    /// Run one stage attempt under the stage timeout, retrying transient
    /// failures with doubling backoff.
    async fn retry_stage<T, Fut>(
        &self,
        stage: Stage,
        attempt_fn: impl Fn() -> Fut,
    ) -> DeployResult<T>
    where
        Fut: Future<Output = DeployResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            let result = match tokio::time::timeout(self.config.stage_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(DeployError::StageTimeout(stage)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(?stage, attempt, error = %err, "stage failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Undo everything the pipeline allocated and mark the deployment
    /// Failed. Best-effort: individual cleanup errors are logged, never
    /// propagated.
    async fn rollback(&self, id: Uuid, rollback: &Arc<Mutex<RollbackSet>>, reason: &str) {
        let set = {
            let mut guard = rollback.lock().expect("rollback lock");
            std::mem::take(&mut *guard)
        };
        warn!(%id, handles = set.handles.len(), reason, "rolling back deployment");

        for endpoint in &set.registered {
            self.registry.deregister_endpoint(id, endpoint);
        }
        for handle in set.handles.iter().rev() {
            let _ = self.substrate.stop(handle).await;
            match self.substrate.destroy(handle).await {
                Ok(()) | Err(SubstrateError::UnknownHandle(_)) => {}
                Err(err) => {
                    error!(%id, handle = %handle.id, error = %err, "rollback destroy failed");
                }
            }
        }
        for (node_id, cpu, memory) in &set.placements {
            self.release_placement(node_id, *cpu, *memory);
        }

        match self.state.get_deployment(id) {
            Ok(Some(mut rec)) if !rec.state.is_terminal() => {
                rec.state = DeploymentState::Failed;
                rec.failure_reason = Some(reason.to_string());
                rec.endpoints.clear();
                rec.updated_at = epoch_secs();
                match self.state.put_deployment(&rec) {
                    Ok(()) => self.notify(id, DeploymentState::Failed),
                    Err(err) => error!(%id, error = %err, "failed to persist Failed state"),
                }
            }
            Ok(_) => {}
            Err(err) => error!(%id, error = %err, "failed to load deployment during rollback"),
        }
    }

    /// Change the replica count of an Active deployment.
    ///
    /// A failed scale-up destroys only the replicas it added; the
    /// survivors keep serving and the deployment returns to Active.
    pub async fn scale(&self, id: Uuid, desired: u32) -> DeployResult<DeploymentRecord> {
        if desired == 0 {
            return Err(DeployError::Configuration(
                "desired replicas must be >= 1".to_string(),
            ));
        }
        let record = self
            .state
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
        let current = record.endpoints.len() as u32;
        if current == desired {
            return Ok(record);
        }

        self.transition(id, DeploymentState::Scaling)?;
        info!(%id, from = current, to = desired, "scaling deployment");

        let result = if desired > current {
            self.scale_up(&record, desired).await
        } else {
            self.scale_down(&record, desired).await
        };

        match result {
            Ok(endpoints) => {
                let mut rec = self
                    .state
                    .get_deployment(id)?
                    .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
                rec.endpoints = endpoints;
                rec.resources.replicas = desired;
                rec.state = DeploymentState::Active;
                rec.updated_at = epoch_secs();
                self.state.put_deployment(&rec)?;
                self.notify(id, DeploymentState::Active);
                Ok(rec)
            }
            Err(err) => {
                // The delta was already rolled back; restore Active so the
                // surviving replicas keep taking traffic.
                if let Ok(Some(mut rec)) = self.state.get_deployment(id)
                    && rec.state == DeploymentState::Scaling
                {
                    rec.state = DeploymentState::Active;
                    rec.updated_at = epoch_secs();
                    if self.state.put_deployment(&rec).is_ok() {
                        self.notify(id, DeploymentState::Active);
                    }
                }
                Err(err)
            }
        }
    }

    async fn scale_up(
        &self,
        record: &DeploymentRecord,
        desired: u32,
    ) -> DeployResult<Vec<ReplicaEndpoint>> {
        let mut endpoints = record.endpoints.clone();
        let mut added: Vec<ReplicaEndpoint> = Vec::new();

        while (endpoints.len() as u32) < desired {
            match self.add_replica(record, endpoints.len() as u32).await {
                Ok(replica) => {
                    added.push(replica.clone());
                    endpoints.push(replica);
                }
                Err(err) => {
                    for replica in &added {
                        self.remove_replica(record.id, replica, &record.resources).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(endpoints)
    }

    async fn scale_down(
        &self,
        record: &DeploymentRecord,
        desired: u32,
    ) -> DeployResult<Vec<ReplicaEndpoint>> {
        let mut endpoints = record.endpoints.clone();
        while (endpoints.len() as u32) > desired {
            if let Some(replica) = endpoints.pop() {
                self.remove_replica(record.id, &replica, &record.resources).await;
            }
        }
        Ok(endpoints)
    }

    /// Place, provision, start, health-gate, and register one replica.
    async fn add_replica(
        &self,
        record: &DeploymentRecord,
        index: u32,
    ) -> DeployResult<ReplicaEndpoint> {
        // Generated before the node reservation so a template error cannot
        // leak reserved capacity.
        let template = self.templates.generate(record.engine, &record.resources)?;

        let nodes = self.state.list_nodes()?;
        let node_id = select_node(&nodes, &record.resources).ok_or(DeployError::NoCapacity)?;
        if let Some(mut node) = self.state.get_node(&node_id)? {
            node.used_cpu_millis += record.resources.cpu_millis;
            node.used_memory_bytes += record.resources.memory_bytes;
            node.updated_at = epoch_secs();
            self.state.put_node(&node)?;
        }

        let spec = ProvisionSpec {
            deployment_id: record.id,
            engine: record.engine,
            node_id: node_id.clone(),
            resources: record.resources,
            template,
            replica_index: index,
        };
        let provisioned = self
            .retry_stage(Stage::Provision, || {
                let substrate = Arc::clone(&self.substrate);
                let spec = spec.clone();
                async move {
                    let handle = substrate.provision(&spec).await?;
                    if let Err(err) = substrate.start(&handle).await {
                        let _ = substrate.destroy(&handle).await;
                        return Err(err.into());
                    }
                    Ok(handle)
                }
            })
            .await;
        let handle = match provisioned {
            Ok(handle) => handle,
            Err(err) => {
                self.release_placement(
                    &node_id,
                    record.resources.cpu_millis,
                    record.resources.memory_bytes,
                );
                return Err(err);
            }
        };

        // Health-gate before the replica takes traffic.
        match self.prober.probe(&handle.endpoint).await {
            ProbeOutcome::Healthy { .. } => {}
            outcome => {
                let _ = self.substrate.stop(&handle).await;
                let _ = self.substrate.destroy(&handle).await;
                self.release_placement(
                    &node_id,
                    record.resources.cpu_millis,
                    record.resources.memory_bytes,
                );
                return Err(DeployError::Provisioning(format!(
                    "new replica {} probe returned {outcome:?}",
                    handle.endpoint
                )));
            }
        }

        self.registry.register(record.id, &handle.endpoint, None, 1.0);
        debug!(deployment = %record.id, endpoint = %handle.endpoint, "replica added");
        Ok(ReplicaEndpoint {
            address: handle.endpoint,
            handle_id: handle.id,
            node_id,
        })
    }

    /// Deregister, destroy, and release one replica. Best-effort.
    async fn remove_replica(&self, id: Uuid, replica: &ReplicaEndpoint, resources: &ResourceSpec) {
        self.registry.deregister_endpoint(id, &replica.address);
        let handle = SubstrateHandle {
            id: replica.handle_id.clone(),
            endpoint: replica.address.clone(),
        };
        let _ = self.substrate.stop(&handle).await;
        match self.substrate.destroy(&handle).await {
            Ok(()) | Err(SubstrateError::UnknownHandle(_)) => {}
            Err(err) => {
                warn!(%id, handle = %replica.handle_id, error = %err, "replica destroy failed");
            }
        }
        self.release_placement(&replica.node_id, resources.cpu_millis, resources.memory_bytes);
    }

    /// Tear down an Active deployment and move it to Destroyed.
    pub async fn decommission(&self, id: Uuid) -> DeployResult<DeploymentRecord> {
        let record = self
            .state
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;

        self.transition(id, DeploymentState::Decommissioning)?;
        info!(%id, replicas = record.endpoints.len(), "decommissioning deployment");

        for replica in &record.endpoints {
            self.remove_replica(id, replica, &record.resources).await;
        }
        self.registry.deregister_deployment(id);

        let mut rec = self
            .state
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
        rec.endpoints.clear();
        rec.admin_credential = None;
        rec.state = DeploymentState::Destroyed;
        rec.updated_at = epoch_secs();
        self.state.put_deployment(&rec)?;
        self.notify(id, DeploymentState::Destroyed);
        Ok(rec)
    }

    fn transition(&self, id: Uuid, next: DeploymentState) -> DeployResult<()> {
        self.state.transition_deployment(id, next, epoch_secs())?;
        self.notify(id, next);
        Ok(())
    }

    fn notify(&self, id: Uuid, state: DeploymentState) {
        if let Some(callback) = &self.on_transition {
            callback(id, state);
        }
    }

    fn release_placement(&self, node_id: &str, cpu: u32, memory: u64) {
        match self.state.get_node(node_id) {
            Ok(Some(mut node)) => {
                node.used_cpu_millis = node.used_cpu_millis.saturating_sub(cpu);
                node.used_memory_bytes = node.used_memory_bytes.saturating_sub(memory);
                node.updated_at = epoch_secs();
                if let Err(err) = self.state.put_node(&node) {
                    error!(node = node_id, error = %err, "failed to release node reservation");
                }
            }
            Ok(None) => {}
            Err(err) => error!(node = node_id, error = %err, "failed to load node for release"),
        }
    }
}

fn checkpoint(cancel: &watch::Receiver<bool>) -> DeployResult<()> {
    if *cancel.borrow() {
        Err(DeployError::Cancelled)
    } else {
        Ok(())
    }
}

fn validate_spec(record: &DeploymentRecord) -> DeployResult<()> {
    let resources = &record.resources;
    if resources.replicas == 0 {
        return Err(DeployError::Configuration(
            "replicas must be >= 1".to_string(),
        ));
    }
    if resources.cpu_millis == 0 || resources.memory_bytes == 0 || resources.storage_bytes == 0 {
        return Err(DeployError::Configuration(
            "cpu, memory, and storage must all be > 0".to_string(),
        ));
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    use strata_engine::{FakeSubstrate, StaticTemplateProvider};
    use strata_registry::BreakerConfig;
    use strata_state::{EngineType, Environment, IsolationMode, NodeRecord};

    struct Harness {
        state: StateStore,
        registry: Arc<Registry>,
        fake: Arc<FakeSubstrate>,
        deployer: Deployer,
        transitions: Arc<Mutex<Vec<DeploymentState>>>,
    }

    fn fast_config() -> DeployerConfig {
        DeployerConfig {
            stage_timeout: Duration::from_secs(5),
            pipeline_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn harness() -> Harness {
        harness_with(fast_config())
    }

    fn harness_with(config: DeployerConfig) -> Harness {
        let state = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(Registry::new(BreakerConfig::default()));
        let fake = Arc::new(FakeSubstrate::new());
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        let deployer = Deployer::new(
            state.clone(),
            Arc::clone(&registry),
            fake.clone(),
            Arc::new(StaticTemplateProvider::new()),
            fake.clone(),
            config,
        )
        .with_transition_callback(Arc::new(move |_, s| sink.lock().unwrap().push(s)));
        Harness {
            state,
            registry,
            fake,
            deployer,
            transitions,
        }
    }

    fn seed_node(state: &StateStore, id: &str, cpu: u32, memory: u64) {
        state
            .put_node(&NodeRecord {
                id: id.to_string(),
                address: format!("192.168.0.{}", id.len()),
                capacity_cpu_millis: cpu,
                capacity_memory_bytes: memory,
                used_cpu_millis: 0,
                used_memory_bytes: 0,
                draining: false,
                updated_at: 0,
            })
            .unwrap();
    }

    fn seed_deployment(state: &StateStore, replicas: u32) -> Uuid {
        seed_deployment_in(state, replicas, Environment::Dev)
    }

    fn seed_deployment_in(state: &StateStore, replicas: u32, environment: Environment) -> Uuid {
        let id = Uuid::new_v4();
        state
            .put_deployment(&DeploymentRecord {
                id,
                engine: EngineType::Relational,
                environment,
                state: DeploymentState::Requested,
                isolation: IsolationMode::Schema,
                resources: ResourceSpec {
                    cpu_millis: 1000,
                    memory_bytes: 2 << 30,
                    storage_bytes: 10 << 30,
                    replicas,
                },
                endpoints: vec![],
                owner: Some("alice".to_string()),
                ttl_seconds: None,
                failure_reason: None,
                maintenance_window: None,
                tls_required: false,
                admin_credential: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        id
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        // Receiver keeps working after the sender drops; the last value
        // observed stays readable.
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn pipeline_reaches_active() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 2);

        let rec = h.deployer.run(id, not_cancelled()).await.unwrap();

        assert_eq!(rec.state, DeploymentState::Active);
        assert_eq!(rec.endpoints.len(), 2);
        assert_eq!(h.fake.live_handles().len(), 2);
        for ep in &rec.endpoints {
            assert!(h.fake.is_running(&ep.handle_id));
            assert_eq!(ep.node_id, "node-1");
        }
        assert_eq!(h.registry.endpoints(id).len(), 2);
        assert!(rec.admin_credential.is_some());
        assert!(!rec.tls_required);

        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 2000);
        assert_eq!(node.used_memory_bytes, 2 * (2 << 30));

        let seen = h.transitions.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                DeploymentState::QuotaValidated,
                DeploymentState::Provisioning,
                DeploymentState::Configuring,
                DeploymentState::Registering,
                DeploymentState::HealthValidating,
                DeploymentState::Active,
            ]
        );
    }

    #[tokio::test]
    async fn pipeline_seeds_health_history() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);

        h.deployer.run(id, not_cancelled()).await.unwrap();

        let snapshot = h.state.latest_health(id).unwrap().unwrap();
        assert_eq!(snapshot.status, HealthState::Healthy);
    }

    #[tokio::test]
    async fn replicas_boot_with_generated_config() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 2);

        let rec = h.deployer.run(id, not_cancelled()).await.unwrap();

        for ep in &rec.endpoints {
            let applied = h.fake.applied_template(&ep.handle_id).unwrap();
            let conf = applied
                .config_artifacts
                .iter()
                .find(|a| a.path == "conf/server.conf")
                .unwrap();
            assert!(conf.contents.contains("shared_buffers"));
        }
    }

    #[tokio::test]
    async fn prod_deployments_require_tls() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment_in(&h.state, 1, Environment::Prod);

        let rec = h.deployer.run(id, not_cancelled()).await.unwrap();
        assert!(rec.tls_required);
    }

    #[tokio::test]
    async fn transient_provision_failures_are_retried() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        h.fake.fail_provisions(2);

        let rec = h.deployer.run(id, not_cancelled()).await.unwrap();
        assert_eq!(rec.state, DeploymentState::Active);
        assert_eq!(h.fake.live_handles().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_roll_back_everything() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        h.fake.fail_provisions(10);

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::Provisioning(_)));

        let rec = h.state.get_deployment(id).unwrap().unwrap();
        assert_eq!(rec.state, DeploymentState::Failed);
        assert!(rec.failure_reason.is_some());
        assert!(rec.endpoints.is_empty());
        assert!(h.fake.live_handles().is_empty());
        assert!(h.registry.endpoints(id).is_empty());

        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 0);
        assert_eq!(node.used_memory_bytes, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        h.fake.fail_permanently(true);

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
        assert!(h.fake.live_handles().is_empty());
        assert_eq!(
            h.state.get_deployment(id).unwrap().unwrap().state,
            DeploymentState::Failed
        );
    }

    #[tokio::test]
    async fn partial_provision_rolls_back_completely() {
        // Two replicas requested, substrate only fits one. The replica
        // that did provision must be destroyed.
        let h = harness_with(DeployerConfig {
            max_attempts: 2,
            ..fast_config()
        });
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 2);
        h.fake.set_capacity(Some(1));

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(err.is_transient());

        assert!(h.fake.live_handles().is_empty());
        assert!(h.registry.endpoints(id).is_empty());
        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 0);
        assert_eq!(
            h.state.get_deployment(id).unwrap().unwrap().state,
            DeploymentState::Failed
        );
    }

    #[tokio::test]
    async fn unhealthy_endpoint_fails_validation() {
        let h = harness_with(DeployerConfig {
            max_attempts: 2,
            ..fast_config()
        });
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        // First handle the fake mints is sub-1 at 10.40.0.1.
        h.fake.set_endpoint_unhealthy("10.40.0.1:5432", true);

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::Provisioning(_)));
        assert!(h.fake.live_handles().is_empty());
        assert!(h.registry.endpoints(id).is_empty());
    }

    #[tokio::test]
    async fn cancellation_rolls_back() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);

        let (tx, rx) = watch::channel(true);
        let err = h.deployer.run(id, rx).await.unwrap_err();
        drop(tx);

        assert!(matches!(err, DeployError::Cancelled));
        let rec = h.state.get_deployment(id).unwrap().unwrap();
        assert_eq!(rec.state, DeploymentState::Failed);
        assert_eq!(rec.failure_reason.as_deref(), Some("cancelled"));
        assert!(h.fake.live_handles().is_empty());
    }

    #[tokio::test]
    async fn pipeline_deadline_forces_rollback() {
        let h = harness_with(DeployerConfig {
            pipeline_timeout: Duration::from_millis(20),
            ..fast_config()
        });
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        h.fake.set_provision_delay(Some(Duration::from_millis(200)));

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::PipelineTimeout));
        assert_eq!(
            h.state.get_deployment(id).unwrap().unwrap().state,
            DeploymentState::Failed
        );
        assert!(h.fake.live_handles().is_empty());
    }

    #[tokio::test]
    async fn stage_timeout_is_transient() {
        let h = harness_with(DeployerConfig {
            stage_timeout: Duration::from_millis(10),
            max_attempts: 2,
            ..fast_config()
        });
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        h.fake.set_provision_delay(Some(Duration::from_millis(100)));

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::StageTimeout(Stage::Provision)));
    }

    #[tokio::test]
    async fn zero_replica_spec_is_rejected() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 0);

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }

    #[tokio::test]
    async fn no_eligible_node_fails_placement() {
        let h = harness();
        seed_node(&h.state, "tiny", 500, 1 << 30);
        let id = seed_deployment(&h.state, 1);

        let err = h.deployer.run(id, not_cancelled()).await.unwrap_err();
        assert!(matches!(err, DeployError::NoCapacity));
        assert_eq!(
            h.state.get_deployment(id).unwrap().unwrap().state,
            DeploymentState::Failed
        );
    }

    #[tokio::test]
    async fn unknown_deployment_is_not_found() {
        let h = harness();
        let err = h
            .deployer
            .run(Uuid::new_v4(), not_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }

    #[tokio::test]
    async fn scale_up_adds_replicas() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);
        h.deployer.run(id, not_cancelled()).await.unwrap();

        let rec = h.deployer.scale(id, 3).await.unwrap();

        assert_eq!(rec.state, DeploymentState::Active);
        assert_eq!(rec.endpoints.len(), 3);
        assert_eq!(rec.resources.replicas, 3);
        assert_eq!(h.fake.live_handles().len(), 3);
        assert_eq!(h.registry.endpoints(id).len(), 3);
        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 3000);
    }

    #[tokio::test]
    async fn scale_down_removes_replicas() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 3);
        h.deployer.run(id, not_cancelled()).await.unwrap();

        let rec = h.deployer.scale(id, 1).await.unwrap();

        assert_eq!(rec.endpoints.len(), 1);
        assert_eq!(h.fake.live_handles().len(), 1);
        assert_eq!(h.registry.endpoints(id).len(), 1);
        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 1000);
    }

    #[tokio::test]
    async fn failed_scale_up_keeps_survivors_serving() {
        // Node fits two replicas. Scaling 1 → 4 must fail, destroy only
        // the delta, and return the deployment to Active.
        let h = harness_with(DeployerConfig {
            max_attempts: 1,
            ..fast_config()
        });
        seed_node(&h.state, "node-1", 2000, 4 << 30);
        let id = seed_deployment(&h.state, 1);
        h.deployer.run(id, not_cancelled()).await.unwrap();

        let err = h.deployer.scale(id, 4).await.unwrap_err();
        assert!(matches!(err, DeployError::NoCapacity));

        let rec = h.state.get_deployment(id).unwrap().unwrap();
        assert_eq!(rec.state, DeploymentState::Active);
        assert_eq!(rec.endpoints.len(), 1);
        assert_eq!(h.fake.live_handles().len(), 1);
        assert_eq!(h.registry.endpoints(id).len(), 1);
        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 1000);
    }

    #[tokio::test]
    async fn scale_requires_active_state() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 1);

        // Still Requested.
        let err = h.deployer.scale(id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::State(StateError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn scale_to_current_count_is_a_noop() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 2);
        h.deployer.run(id, not_cancelled()).await.unwrap();

        let rec = h.deployer.scale(id, 2).await.unwrap();
        assert_eq!(rec.state, DeploymentState::Active);
        assert_eq!(h.fake.live_handles().len(), 2);
    }

    #[tokio::test]
    async fn decommission_cleans_everything() {
        let h = harness();
        seed_node(&h.state, "node-1", 16_000, 64 << 30);
        let id = seed_deployment(&h.state, 2);
        h.deployer.run(id, not_cancelled()).await.unwrap();

        let rec = h.deployer.decommission(id).await.unwrap();

        assert_eq!(rec.state, DeploymentState::Destroyed);
        assert!(rec.endpoints.is_empty());
        assert!(rec.admin_credential.is_none());
        assert!(h.fake.live_handles().is_empty());
        assert!(h.registry.endpoints(id).is_empty());
        let node = h.state.get_node("node-1").unwrap().unwrap();
        assert_eq!(node.used_cpu_millis, 0);
        assert_eq!(node.used_memory_bytes, 0);
    }

    #[tokio::test]
    async fn decommission_requires_active_state() {
        let h = harness();
        let id = seed_deployment(&h.state, 1);

        let err = h.deployer.decommission(id).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::State(StateError::InvalidTransition(_))
        ));
    }
}
