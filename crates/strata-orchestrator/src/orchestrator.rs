//! The orchestrator — single mutation path for deployment lifecycle.
//!
//! Owns quota validation, per-deployment mutual exclusion, tenants,
//! backups, maintenance-window deferral, and the broadcast event channel.
//! All replica-touching work is delegated to the deployer; the scheduler
//! and any future API surface go through this type rather than mutating
//! records directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, watch, Mutex as TokioMutex, OwnedMutexGuard, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strata_deployer::{Deployer, DeployerConfig};
use strata_engine::{
    EndpointProber, EngineTemplateProvider, ExecutionSubstrate, ProbeOutcome, SubstrateHandle,
};
use strata_registry::{ConnectionTarget, Registry};
use strata_state::{
    BackupKind, BackupRecord, BackupStatus, DailyWindow, DeploymentRecord, DeploymentState,
    EngineType, Environment, HealthSnapshot, HealthState, IsolationMode, ReplicaEndpoint,
    ResourceSpec, ResourceUtilization, ScalingPolicy, StateStore, TenantRecord,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EVENT_CAPACITY};

/// Per-owner resource caps.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub max_deployments_per_owner: usize,
    /// Cap on summed `cpu_millis * replicas` across an owner's deployments.
    pub max_cpu_millis: u32,
    /// Cap on summed `memory_bytes * replicas`.
    pub max_memory_bytes: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_deployments_per_owner: 5,
            max_cpu_millis: 32_000,
            max_memory_bytes: 128 << 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub quotas: QuotaConfig,
    pub deployer: DeployerConfig,
    /// Concurrent backup executions across all deployments.
    pub backup_concurrency: usize,
    pub backup_retention_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            quotas: QuotaConfig::default(),
            deployer: DeployerConfig::default(),
            backup_concurrency: 2,
            backup_retention_seconds: 7 * 86_400,
        }
    }
}

/// Everything needed to request a new deployment.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub engine: EngineType,
    pub environment: Environment,
    pub isolation: IsolationMode,
    pub resources: ResourceSpec,
    pub owner: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub maintenance_window: Option<DailyWindow>,
}

/// Who issued a mutating operation. User ops fail fast on contention;
/// scheduler ops wait their turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOrigin {
    User,
    Scheduler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingResult {
    Applied { from: u32, to: u32 },
    /// Queued until the maintenance window closes.
    Deferred,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreResult {
    pub deployment_id: Uuid,
    pub backup_id: Uuid,
    pub restored_at: u64,
}

/// Aggregate health across all deployments.
#[derive(Debug, Clone, Default)]
pub struct SystemHealth {
    pub total: usize,
    pub active: usize,
    pub failed: usize,
    pub degraded: Vec<Uuid>,
    pub unhealthy: Vec<Uuid>,
}

/// Operation queued while its deployment's maintenance window is open.
#[derive(Debug, Clone, Copy)]
enum DeferredOp {
    Scale { desired: u32 },
}

pub struct Orchestrator {
    state: StateStore,
    registry: Arc<Registry>,
    substrate: Arc<dyn ExecutionSubstrate>,
    prober: Arc<dyn EndpointProber>,
    deployer: Arc<Deployer>,
    quotas: QuotaConfig,
    backup_retention: u64,
    backup_slots: Arc<Semaphore>,
    events: broadcast::Sender<Event>,
    locks: StdMutex<HashMap<Uuid, Arc<TokioMutex<()>>>>,
    deferred: StdMutex<HashMap<Uuid, Vec<DeferredOp>>>,
    /// Propagated into every spawned pipeline for cooperative shutdown.
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        registry: Arc<Registry>,
        substrate: Arc<dyn ExecutionSubstrate>,
        templates: Arc<dyn EngineTemplateProvider>,
        prober: Arc<dyn EndpointProber>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sink = events.clone();
        let deployer = Deployer::new(
            state.clone(),
            Arc::clone(&registry),
            Arc::clone(&substrate),
            templates,
            Arc::clone(&prober),
            config.deployer,
        )
        .with_transition_callback(Arc::new(move |deployment_id, state| {
            let _ = sink.send(Event::DeploymentTransitioned {
                deployment_id,
                state,
            });
        }));

        Self {
            state,
            registry,
            substrate,
            prober,
            deployer: Arc::new(deployer),
            quotas: config.quotas,
            backup_retention: config.backup_retention_seconds,
            backup_slots: Arc::new(Semaphore::new(config.backup_concurrency)),
            events,
            locks: StdMutex::new(HashMap::new()),
            deferred: StdMutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Subscribe to the event channel. Lagging consumers lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    // ── Deployment lifecycle ───────────────────────────────────────

    /// Validate, persist a Requested record, and spawn the provisioning
    /// pipeline. Returns immediately; progress arrives on the event
    /// channel.
    pub async fn deploy(&self, request: DeployRequest) -> OrchestratorResult<DeploymentRecord> {
        validate_request(&request)?;
        self.check_quota(request.owner.as_deref(), &request.resources)?;

        let now = epoch_secs();
        let record = DeploymentRecord {
            id: Uuid::new_v4(),
            engine: request.engine,
            environment: request.environment,
            state: DeploymentState::Requested,
            isolation: request.isolation,
            resources: request.resources,
            endpoints: vec![],
            owner: request.owner,
            ttl_seconds: request.ttl_seconds,
            failure_reason: None,
            maintenance_window: request.maintenance_window,
            tls_required: false,
            admin_credential: None,
            created_at: now,
            updated_at: now,
        };
        self.state.put_deployment(&record)?;
        self.publish(Event::DeploymentTransitioned {
            deployment_id: record.id,
            state: DeploymentState::Requested,
        });
        info!(id = %record.id, engine = ?record.engine, "deployment requested");

        let id = record.id;
        let lock = self.lock_for(id);
        let deployer = Arc::clone(&self.deployer);
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let _guard = lock.lock().await;
            if let Err(err) = deployer.run(id, cancel).await {
                warn!(%id, error = %err, "deployment pipeline failed");
            }
        });
        Ok(record)
    }

    pub fn get_deployment(&self, id: Uuid) -> OrchestratorResult<DeploymentRecord> {
        self.state
            .get_deployment(id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {id}")))
    }

    pub fn list_deployments(
        &self,
        owner: Option<&str>,
        state: Option<DeploymentState>,
    ) -> OrchestratorResult<Vec<DeploymentRecord>> {
        Ok(self
            .state
            .list_deployments()?
            .into_iter()
            .filter(|r| owner.is_none_or(|o| r.owner.as_deref() == Some(o)))
            .filter(|r| state.is_none_or(|s| r.state == s))
            .collect())
    }

    /// Change the replica count. User requests outside policy bounds are
    /// rejected; scheduler requests are clamped into them. Ops landing
    /// inside a maintenance window are queued and drained later.
    pub async fn scale(
        &self,
        id: Uuid,
        desired: u32,
        origin: OpOrigin,
    ) -> OrchestratorResult<ScalingResult> {
        if desired == 0 {
            return Err(OrchestratorError::Validation(
                "desired replicas must be >= 1".to_string(),
            ));
        }
        let record = self.get_deployment(id)?;

        let desired = match self.state.get_policy(id)? {
            Some(policy) => match origin {
                OpOrigin::User if !policy.within_bounds(desired) => {
                    return Err(OrchestratorError::Validation(format!(
                        "desired {desired} outside policy bounds {}..={}",
                        policy.min_replicas, policy.max_replicas
                    )));
                }
                OpOrigin::User => desired,
                OpOrigin::Scheduler => policy.clamp(desired),
            },
            None => desired,
        };

        let now = epoch_secs();
        if in_maintenance(&record, now) {
            self.deferred
                .lock()
                .expect("deferred mutex")
                .entry(id)
                .or_default()
                .push(DeferredOp::Scale { desired });
            info!(%id, desired, "scale deferred by maintenance window");
            return Ok(ScalingResult::Deferred);
        }

        let from = record.endpoints.len() as u32;
        if from == desired {
            return Ok(ScalingResult::Noop);
        }

        let _guard = self.acquire(id, origin).await?;
        self.deployer.scale(id, desired).await?;
        self.publish(Event::ScalingApplied {
            deployment_id: id,
            from,
            to: desired,
        });
        Ok(ScalingResult::Applied { from, to: desired })
    }

    /// Tear down a deployment and everything attached to it.
    pub async fn decommission(
        &self,
        id: Uuid,
        origin: OpOrigin,
    ) -> OrchestratorResult<DeploymentRecord> {
        let _guard = self.acquire(id, origin).await?;
        let record = self.deployer.decommission(id).await?;
        self.state.delete_tenants_for_deployment(id)?;
        self.state.delete_policy(id)?;
        Ok(record)
    }

    // ── Scaling policies ───────────────────────────────────────────

    pub fn set_policy(&self, policy: &ScalingPolicy) -> OrchestratorResult<()> {
        if policy.min_replicas == 0 || policy.min_replicas > policy.max_replicas {
            return Err(OrchestratorError::Validation(format!(
                "invalid replica bounds {}..={}",
                policy.min_replicas, policy.max_replicas
            )));
        }
        let mut policy = policy.clone();
        policy.updated_at = epoch_secs();
        self.state.put_policy(&policy)?;
        Ok(())
    }

    pub fn get_policy(&self, id: Uuid) -> OrchestratorResult<Option<ScalingPolicy>> {
        Ok(self.state.get_policy(id)?)
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Create a backup record and spawn its execution. When
    /// `schedule_slot` is set and a backup for that slot already exists,
    /// the existing record is returned instead of firing again.
    ///
    /// The deployment lock is held until the spawned execution finishes,
    /// so user operations conflict with an in-flight backup.
    pub async fn create_backup(
        &self,
        id: Uuid,
        kind: BackupKind,
        schedule_slot: Option<u64>,
        origin: OpOrigin,
    ) -> OrchestratorResult<BackupRecord> {
        let guard = self.acquire(id, origin).await?;
        let record = self.get_deployment(id)?;
        if record.state != DeploymentState::Active {
            return Err(OrchestratorError::Validation(format!(
                "backups require an Active deployment, found {:?}",
                record.state
            )));
        }
        if let Some(slot) = schedule_slot
            && let Some(existing) = self.state.find_backup_for_slot(id, slot)?
        {
            debug!(%id, slot, backup = %existing.id, "slot already backed up");
            return Ok(existing);
        }

        let now = epoch_secs();
        let backup_id = Uuid::new_v4();
        let backup = BackupRecord {
            id: backup_id,
            deployment_id: id,
            kind,
            status: BackupStatus::Pending,
            location: format!("backups/{id}/{backup_id}.snap"),
            schedule_slot,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            retention_until: now + self.backup_retention,
        };
        self.state.put_backup(&backup)?;
        info!(%id, backup = %backup_id, kind = ?kind, "backup created");

        let state = self.state.clone();
        let substrate = Arc::clone(&self.substrate);
        let events = self.events.clone();
        let slots = Arc::clone(&self.backup_slots);
        let source = record.endpoints.first().cloned();
        let spawned = backup.clone();
        tokio::spawn(async move {
            execute_backup(state, substrate, events, slots, spawned, source).await;
            drop(guard);
        });
        Ok(backup)
    }

    /// Restore a deployment from a completed backup by restarting every
    /// replica against the backup artifact.
    pub async fn restore(&self, id: Uuid, backup_id: Uuid) -> OrchestratorResult<RestoreResult> {
        let _guard = self.acquire(id, OpOrigin::User).await?;
        let record = self.get_deployment(id)?;
        if record.state != DeploymentState::Active {
            return Err(OrchestratorError::Validation(format!(
                "restore requires an Active deployment, found {:?}",
                record.state
            )));
        }
        let backup = self
            .state
            .get_backup(id, backup_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("backup {backup_id}")))?;
        if backup.status != BackupStatus::Complete {
            return Err(OrchestratorError::Validation(format!(
                "backup {backup_id} is {:?}, not restorable",
                backup.status
            )));
        }

        for replica in &record.endpoints {
            let handle = SubstrateHandle {
                id: replica.handle_id.clone(),
                endpoint: replica.address.clone(),
            };
            self.substrate
                .stop(&handle)
                .await
                .map_err(strata_deployer::DeployError::from)?;
            self.substrate
                .start(&handle)
                .await
                .map_err(strata_deployer::DeployError::from)?;
        }
        info!(%id, backup = %backup_id, "deployment restored");
        Ok(RestoreResult {
            deployment_id: id,
            backup_id,
            restored_at: epoch_secs(),
        })
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Create a tenant. The isolation key must be unique within the
    /// deployment. Under DedicatedInstance isolation the tenant is bound
    /// to a free replica; running out of replicas fails the call.
    pub async fn create_tenant(
        &self,
        deployment_id: Uuid,
        isolation_key: &str,
        quota: u64,
    ) -> OrchestratorResult<TenantRecord> {
        if isolation_key.is_empty() {
            return Err(OrchestratorError::Validation(
                "isolation key must not be empty".to_string(),
            ));
        }
        let record = self.get_deployment(deployment_id)?;
        if record.state != DeploymentState::Active {
            return Err(OrchestratorError::Validation(format!(
                "tenants require an Active deployment, found {:?}",
                record.state
            )));
        }
        let existing = self.state.list_tenants_for_deployment(deployment_id)?;
        if existing.iter().any(|t| t.isolation_key == isolation_key) {
            return Err(OrchestratorError::Validation(format!(
                "isolation key {isolation_key:?} already in use"
            )));
        }
        if record.isolation == IsolationMode::DedicatedInstance
            && existing.len() >= record.endpoints.len()
        {
            return Err(OrchestratorError::Validation(format!(
                "no free dedicated replica ({} tenants on {} replicas)",
                existing.len(),
                record.endpoints.len()
            )));
        }

        let now = epoch_secs();
        let tenant = TenantRecord {
            id: Uuid::new_v4(),
            deployment_id,
            isolation_key: isolation_key.to_string(),
            quota,
            created_at: now,
            updated_at: now,
        };
        self.state.put_tenant(&tenant)?;

        if record.isolation == IsolationMode::DedicatedInstance {
            let replica = &record.endpoints[existing.len()];
            self.registry
                .register(deployment_id, &replica.address, Some(tenant.id), 1.0);
            info!(%deployment_id, tenant = %tenant.id, endpoint = %replica.address, "tenant bound to dedicated replica");
        }
        Ok(tenant)
    }

    /// Remove a tenant, returning its dedicated replica (if any) to the
    /// unassigned pool.
    pub async fn remove_tenant(&self, tenant_id: Uuid) -> OrchestratorResult<()> {
        let tenant = self
            .state
            .find_tenant(tenant_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("tenant {tenant_id}")))?;
        self.state.delete_tenant(tenant.deployment_id, tenant_id)?;

        for entry in self.registry.endpoints(tenant.deployment_id) {
            if entry.tenant_id == Some(tenant_id) {
                self.registry
                    .register(tenant.deployment_id, &entry.endpoint, None, entry.weight);
            }
        }
        Ok(())
    }

    /// Resolve a tenant to a connection descriptor per its deployment's
    /// isolation mode.
    pub fn resolve_tenant(
        &self,
        tenant_id: Uuid,
        now: u64,
    ) -> OrchestratorResult<ConnectionTarget> {
        let tenant = self
            .state
            .find_tenant(tenant_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("tenant {tenant_id}")))?;
        let record = self.get_deployment(tenant.deployment_id)?;
        self.registry
            .resolve_tenant(&record, &tenant, now)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("no routable endpoint for tenant {tenant_id}"))
            })
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Aggregate health across every deployment.
    pub fn system_health(&self) -> OrchestratorResult<SystemHealth> {
        let deployments = self.state.list_deployments()?;
        let mut health = SystemHealth {
            total: deployments.len(),
            ..SystemHealth::default()
        };
        for record in &deployments {
            match record.state {
                DeploymentState::Active | DeploymentState::Scaling => {
                    health.active += 1;
                    let status = self
                        .registry
                        .deployment_health(record.id)
                        .or_else(|| {
                            self.state
                                .latest_health(record.id)
                                .ok()
                                .flatten()
                                .map(|s| s.status)
                        })
                        .unwrap_or(HealthState::Unhealthy);
                    match status {
                        HealthState::Healthy => {}
                        HealthState::Degraded => health.degraded.push(record.id),
                        HealthState::Unhealthy => health.unhealthy.push(record.id),
                    }
                }
                DeploymentState::Failed => health.failed += 1,
                _ => {}
            }
        }
        Ok(health)
    }

    /// Periodic health sweep until shutdown.
    pub async fn run_health_monitor(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_endpoints().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One health sweep: probe every registered endpoint, feed the
    /// breakers, and append a snapshot per Active deployment.
    pub async fn probe_endpoints(&self) {
        let now = epoch_secs();
        let mut latencies: HashMap<Uuid, f64> = HashMap::new();

        for (deployment_id, endpoint) in self.registry.all_endpoints() {
            match self.prober.probe(&endpoint).await {
                ProbeOutcome::Healthy { latency_ms } => {
                    self.registry
                        .report_success(deployment_id, &endpoint, latency_ms, now);
                    let entry = latencies.entry(deployment_id).or_default();
                    *entry = entry.max(latency_ms);
                }
                _ => self.registry.report_failure(deployment_id, &endpoint, now),
            }
        }

        let deployments = match self.state.list_deployments() {
            Ok(deployments) => deployments,
            Err(err) => {
                error!(error = %err, "health sweep failed to list deployments");
                return;
            }
        };
        for record in deployments.into_iter().filter(|r| {
            matches!(
                r.state,
                DeploymentState::Active | DeploymentState::Scaling
            )
        }) {
            let Some(status) = self.registry.deployment_health(record.id) else {
                continue;
            };
            let mut utilization = ResourceUtilization::default();
            if let Some(replica) = record.endpoints.first() {
                let handle = SubstrateHandle {
                    id: replica.handle_id.clone(),
                    endpoint: replica.address.clone(),
                };
                if let Ok(util) = self.substrate.get_metrics(&handle).await {
                    utilization = util;
                }
            }
            let snapshot = HealthSnapshot {
                deployment_id: record.id,
                timestamp: now,
                status,
                latency_ms: latencies.get(&record.id).copied().unwrap_or_default(),
                utilization,
            };
            if let Err(err) = self.state.put_health(&snapshot) {
                error!(id = %record.id, error = %err, "failed to persist health snapshot");
            }
        }
    }

    // ── Maintenance windows ────────────────────────────────────────

    /// Apply deferred operations for deployments whose maintenance window
    /// has closed. Called from the scheduler tick.
    pub async fn drain_deferred(&self, now: u64) {
        let ready: Vec<(Uuid, Vec<DeferredOp>)> = {
            let mut deferred = self.deferred.lock().expect("deferred mutex");
            let ids: Vec<Uuid> = deferred.keys().copied().collect();
            let mut ready = Vec::new();
            for id in ids {
                let window_open = self
                    .state
                    .get_deployment(id)
                    .ok()
                    .flatten()
                    .is_some_and(|r| in_maintenance(&r, now));
                if !window_open
                    && let Some(ops) = deferred.remove(&id)
                {
                    ready.push((id, ops));
                }
            }
            ready
        };

        for (id, ops) in ready {
            for op in ops {
                match op {
                    DeferredOp::Scale { desired } => {
                        info!(%id, desired, "applying deferred scale");
                        if let Err(err) = self.scale(id, desired, OpOrigin::Scheduler).await {
                            warn!(%id, error = %err, "deferred scale failed");
                        }
                    }
                }
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn check_quota(&self, owner: Option<&str>, resources: &ResourceSpec) -> OrchestratorResult<()> {
        let Some(owner) = owner else { return Ok(()) };
        let mine: Vec<DeploymentRecord> = self
            .state
            .list_deployments()?
            .into_iter()
            .filter(|d| d.owner.as_deref() == Some(owner) && !d.state.is_terminal())
            .collect();

        if mine.len() >= self.quotas.max_deployments_per_owner {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "{owner} already has {} deployments (limit {})",
                mine.len(),
                self.quotas.max_deployments_per_owner
            )));
        }
        // The per-replica product can exceed u32.
        let cpu: u64 = mine
            .iter()
            .map(|d| u64::from(d.resources.cpu_millis) * u64::from(d.resources.replicas))
            .sum::<u64>()
            + u64::from(resources.cpu_millis) * u64::from(resources.replicas);
        if cpu > u64::from(self.quotas.max_cpu_millis) {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "{owner} would use {cpu} cpu millis (limit {})",
                self.quotas.max_cpu_millis
            )));
        }
        let memory: u64 = mine
            .iter()
            .map(|d| d.resources.memory_bytes * u64::from(d.resources.replicas))
            .sum::<u64>()
            + resources.memory_bytes * u64::from(resources.replicas);
        if memory > self.quotas.max_memory_bytes {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "{owner} would use {memory} memory bytes (limit {})",
                self.quotas.max_memory_bytes
            )));
        }
        Ok(())
    }

    fn lock_for(&self, id: Uuid) -> Arc<TokioMutex<()>> {
        let mut locks = self.locks.lock().expect("locks mutex");
        Arc::clone(locks.entry(id).or_default())
    }

    async fn acquire(
        &self,
        id: Uuid,
        origin: OpOrigin,
    ) -> OrchestratorResult<OwnedMutexGuard<()>> {
        let lock = self.lock_for(id);
        match origin {
            OpOrigin::User => lock
                .try_lock_owned()
                .map_err(|_| OrchestratorError::Conflict(format!("deployment {id} is busy"))),
            OpOrigin::Scheduler => Ok(lock.lock_owned().await),
        }
    }

    fn publish(&self, event: Event) {
        // Send fails only when nobody is subscribed.
        let _ = self.events.send(event);
    }
}

async fn execute_backup(
    state: StateStore,
    substrate: Arc<dyn ExecutionSubstrate>,
    events: broadcast::Sender<Event>,
    slots: Arc<Semaphore>,
    backup: BackupRecord,
    source: Option<ReplicaEndpoint>,
) {
    let Ok(_permit) = slots.acquire_owned().await else {
        return;
    };
    let result = run_backup_steps(&state, substrate.as_ref(), &backup, source).await;
    let (status, reason) = match result {
        Ok(()) => (BackupStatus::Complete, None),
        Err(err) => (BackupStatus::Failed, Some(err.to_string())),
    };
    match state.transition_backup(
        backup.deployment_id,
        backup.id,
        status,
        reason.clone(),
        epoch_secs(),
    ) {
        Ok(_) => {
            if let Some(reason) = reason {
                warn!(backup = %backup.id, reason, "backup failed");
            } else {
                info!(backup = %backup.id, "backup complete");
            }
            let _ = events.send(Event::BackupFinished {
                deployment_id: backup.deployment_id,
                backup_id: backup.id,
                status,
            });
        }
        Err(err) => error!(backup = %backup.id, error = %err, "failed to finalize backup"),
    }
}

async fn run_backup_steps(
    state: &StateStore,
    substrate: &dyn ExecutionSubstrate,
    backup: &BackupRecord,
    source: Option<ReplicaEndpoint>,
) -> OrchestratorResult<()> {
    state.transition_backup(
        backup.deployment_id,
        backup.id,
        BackupStatus::Running,
        None,
        epoch_secs(),
    )?;
    let source = source.ok_or_else(|| {
        OrchestratorError::BackupFailure("deployment has no replicas".to_string())
    })?;
    let handle = SubstrateHandle {
        id: source.handle_id,
        endpoint: source.address,
    };
    // The snapshot source must be reachable for the artifact to be valid.
    substrate
        .get_metrics(&handle)
        .await
        .map_err(|e| OrchestratorError::BackupFailure(e.to_string()))?;
    Ok(())
}

fn validate_request(request: &DeployRequest) -> OrchestratorResult<()> {
    let resources = &request.resources;
    if resources.replicas == 0 {
        return Err(OrchestratorError::Validation(
            "replicas must be >= 1".to_string(),
        ));
    }
    if resources.cpu_millis == 0 || resources.memory_bytes == 0 || resources.storage_bytes == 0 {
        return Err(OrchestratorError::Validation(
            "cpu, memory, and storage must all be > 0".to_string(),
        ));
    }
    if request.ttl_seconds == Some(0) {
        return Err(OrchestratorError::Validation(
            "ttl must be > 0 when set".to_string(),
        ));
    }
    Ok(())
}

fn in_maintenance(record: &DeploymentRecord, now: u64) -> bool {
    record
        .maintenance_window
        .is_some_and(|w| w.contains((now % 86_400) as u32))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
