//! The background scheduler loop.
//!
//! Every tick: fire due scheduled backups, decommission expired
//! ephemeral deployments, apply scheduled and policy-driven scaling,
//! drain deferred maintenance-window ops, and purge retention. All
//! mutations go through the orchestrator; the scheduler never writes
//! deployment state directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strata_orchestrator::{OpOrigin, Orchestrator, OrchestratorError, ScalingResult};
use strata_state::{DeploymentState, StateStore};

use crate::schedule::{BackupSchedule, ScheduledScaling};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Health snapshots older than this are pruned each tick.
    pub health_retention_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            health_retention_seconds: 86_400,
        }
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    state: StateStore,
    config: SchedulerConfig,
    backups: StdMutex<HashMap<Uuid, BackupSchedule>>,
    scaling: StdMutex<HashMap<Uuid, ScheduledScaling>>,
    /// Last policy-driven scaling decision per deployment, for cooldown.
    autoscale_last: StdMutex<HashMap<Uuid, u64>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, state: StateStore, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            state,
            config,
            backups: StdMutex::new(HashMap::new()),
            scaling: StdMutex::new(HashMap::new()),
            autoscale_last: StdMutex::new(HashMap::new()),
        }
    }

    /// Install (or replace) the backup schedule for a deployment.
    pub fn set_backup_schedule(&self, schedule: BackupSchedule) {
        self.backups
            .lock()
            .expect("schedules mutex")
            .insert(schedule.deployment_id, schedule);
    }

    pub fn clear_backup_schedule(&self, deployment_id: Uuid) {
        self.backups
            .lock()
            .expect("schedules mutex")
            .remove(&deployment_id);
    }

    /// Install (or replace) the daily scaling plan for a deployment.
    pub fn set_scheduled_scaling(&self, plan: ScheduledScaling) {
        self.scaling
            .lock()
            .expect("plans mutex")
            .insert(plan.deployment_id, plan);
    }

    pub fn clear_scheduled_scaling(&self, deployment_id: Uuid) {
        self.scaling
            .lock()
            .expect("plans mutex")
            .remove(&deployment_id);
    }

    /// Tick until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.config.tick_interval, "scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(epoch_secs()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One scheduler pass at the given time. Public for tests.
    pub async fn tick(&self, now: u64) {
        self.fire_scheduled_backups(now).await;
        self.cleanup_expired_ttls(now).await;
        self.apply_scheduled_scaling(now).await;
        self.evaluate_policies(now).await;
        self.orchestrator.drain_deferred(now).await;
        self.purge_retention(now);
    }

    async fn fire_scheduled_backups(&self, now: u64) {
        let schedules: Vec<BackupSchedule> = self
            .backups
            .lock()
            .expect("schedules mutex")
            .values()
            .cloned()
            .collect();

        for schedule in schedules {
            let slot = schedule.slot(now);
            match self
                .orchestrator
                .create_backup(
                    schedule.deployment_id,
                    schedule.kind,
                    Some(slot),
                    OpOrigin::Scheduler,
                )
                .await
            {
                Ok(_) => {}
                Err(OrchestratorError::NotFound(_)) => {
                    debug!(id = %schedule.deployment_id, "deployment gone, dropping backup schedule");
                    self.clear_backup_schedule(schedule.deployment_id);
                }
                // Not Active yet (or anymore); the slot fires later if
                // the deployment comes back within it.
                Err(OrchestratorError::Validation(reason)) => {
                    debug!(id = %schedule.deployment_id, reason, "scheduled backup skipped");
                }
                Err(err) => {
                    warn!(id = %schedule.deployment_id, error = %err, "scheduled backup failed");
                }
            }
        }
    }

    async fn cleanup_expired_ttls(&self, now: u64) {
        let deployments = match self
            .orchestrator
            .list_deployments(None, Some(DeploymentState::Active))
        {
            Ok(deployments) => deployments,
            Err(err) => {
                error!(error = %err, "ttl sweep failed to list deployments");
                return;
            }
        };
        for record in deployments.into_iter().filter(|r| r.ttl_expired(now)) {
            info!(id = %record.id, "ttl expired, decommissioning");
            if let Err(err) = self
                .orchestrator
                .decommission(record.id, OpOrigin::Scheduler)
                .await
            {
                warn!(id = %record.id, error = %err, "ttl decommission failed");
            }
        }
    }

    async fn apply_scheduled_scaling(&self, now: u64) {
        let plans: Vec<ScheduledScaling> = self
            .scaling
            .lock()
            .expect("plans mutex")
            .values()
            .copied()
            .collect();

        for plan in plans {
            if !plan.applies_at(now) {
                continue;
            }
            match self
                .orchestrator
                .scale(plan.deployment_id, plan.target_replicas, OpOrigin::Scheduler)
                .await
            {
                Ok(ScalingResult::Applied { from, to }) => {
                    info!(id = %plan.deployment_id, from, to, "scheduled scaling applied");
                }
                Ok(_) => {}
                Err(OrchestratorError::NotFound(_)) => {
                    self.clear_scheduled_scaling(plan.deployment_id);
                }
                Err(err) => {
                    warn!(id = %plan.deployment_id, error = %err, "scheduled scaling failed");
                }
            }
        }
    }

    /// Policy-driven reactive scaling from the latest health snapshot.
    async fn evaluate_policies(&self, now: u64) {
        let deployments = match self
            .orchestrator
            .list_deployments(None, Some(DeploymentState::Active))
        {
            Ok(deployments) => deployments,
            Err(err) => {
                error!(error = %err, "policy sweep failed to list deployments");
                return;
            }
        };

        for record in deployments {
            let Ok(Some(policy)) = self.state.get_policy(record.id) else {
                continue;
            };
            let in_cooldown = self
                .autoscale_last
                .lock()
                .expect("autoscale mutex")
                .get(&record.id)
                .is_some_and(|last| now < last + policy.cooldown_seconds);
            if in_cooldown {
                continue;
            }
            let Ok(Some(snapshot)) = self.state.latest_health(record.id) else {
                continue;
            };

            let current = record.endpoints.len() as u32;
            let util = snapshot.utilization;
            let memory_percent = if record.resources.memory_bytes > 0 {
                util.memory_bytes as f64 / record.resources.memory_bytes as f64 * 100.0
            } else {
                0.0
            };

            let desired = if util.cpu_percent > policy.cpu_up
                || memory_percent > policy.memory_up
                || util.connections > policy.connections_up
            {
                current + 1
            } else if util.cpu_percent < policy.cpu_down
                && memory_percent < policy.memory_down
                && util.connections < policy.connections_down
            {
                current.saturating_sub(1).max(1)
            } else {
                continue;
            };
            let desired = policy.clamp(desired);
            if desired == current {
                continue;
            }

            match self
                .orchestrator
                .scale(record.id, desired, OpOrigin::Scheduler)
                .await
            {
                Ok(ScalingResult::Applied { from, to }) => {
                    info!(id = %record.id, from, to, "policy scaling applied");
                    self.autoscale_last
                        .lock()
                        .expect("autoscale mutex")
                        .insert(record.id, now);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(id = %record.id, error = %err, "policy scaling failed");
                }
            }
        }
    }

    fn purge_retention(&self, now: u64) {
        match self.state.purge_expired_backups(now) {
            Ok(purged) if purged > 0 => info!(purged, "expired backups purged"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "backup purge failed"),
        }
        let cutoff = now.saturating_sub(self.config.health_retention_seconds);
        match self.state.prune_health_before(cutoff) {
            Ok(pruned) if pruned > 0 => debug!(pruned, "old health snapshots pruned"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "health prune failed"),
        }
    }
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
    use strata_orchestrator::{DeployRequest, Event, OrchestratorConfig};
    use strata_registry::{BreakerConfig, Registry};
    use strata_state::{
        BackupKind, BackupRecord, BackupStatus, DailyWindow, EngineType, Environment,
        HealthSnapshot, HealthState, IsolationMode, NodeRecord, ResourceSpec,
        ResourceUtilization, ScalingPolicy,
    };

    struct Harness {
        scheduler: Scheduler,
        orch: Arc<Orchestrator>,
        state: StateStore,
        fake: Arc<FakeSubstrate>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let state = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(Registry::new(BreakerConfig::default()));
        let fake = Arc::new(FakeSubstrate::new());
        let (tx, rx) = watch::channel(false);
        state
            .put_node(&NodeRecord {
                id: "node-1".to_string(),
                address: "192.168.0.1".to_string(),
                capacity_cpu_millis: 64_000,
                capacity_memory_bytes: 256 << 30,
                used_cpu_millis: 0,
                used_memory_bytes: 0,
                draining: false,
                updated_at: 0,
            })
            .unwrap();
        let orch = Arc::new(Orchestrator::new(
            state.clone(),
            registry,
            fake.clone(),
            Arc::new(StaticTemplateProvider::new()),
            fake.clone(),
            OrchestratorConfig::default(),
            rx,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&orch),
            state.clone(),
            SchedulerConfig::default(),
        );
        Harness {
            scheduler,
            orch,
            state,
            fake,
            _shutdown: tx,
        }
    }

    async fn deploy_active(h: &Harness, ttl_seconds: Option<u64>) -> Uuid {
        let mut rx = h.orch.subscribe();
        let record = h
            .orch
            .deploy(DeployRequest {
                engine: EngineType::Relational,
                environment: Environment::Dev,
                isolation: IsolationMode::Schema,
                resources: ResourceSpec {
                    cpu_millis: 1000,
                    memory_bytes: 2 << 30,
                    storage_bytes: 10 << 30,
                    replicas: 1,
                },
                owner: Some("alice".to_string()),
                ttl_seconds,
                maintenance_window: None,
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Event::DeploymentTransitioned {
                    deployment_id,
                    state,
                }) = rx.recv().await
                    && deployment_id == record.id
                    && state == DeploymentState::Active
                {
                    return;
                }
            }
        })
        .await
        .expect("deployment never became active");
        record.id
    }

    fn policy(deployment_id: Uuid, min: u32, max: u32) -> ScalingPolicy {
        ScalingPolicy {
            id: Uuid::new_v4(),
            deployment_id,
            cpu_up: 80.0,
            cpu_down: 20.0,
            memory_up: 80.0,
            memory_down: 20.0,
            connections_up: 100,
            connections_down: 10,
            cooldown_seconds: 300,
            min_replicas: min,
            max_replicas: max,
            updated_at: 0,
        }
    }

    fn snapshot(deployment_id: Uuid, timestamp: u64, cpu: f64, connections: u32) -> HealthSnapshot {
        HealthSnapshot {
            deployment_id,
            timestamp,
            status: HealthState::Healthy,
            latency_ms: 1.0,
            utilization: ResourceUtilization {
                cpu_percent: cpu,
                memory_bytes: 0,
                disk_io_ops: 0,
                connections,
            },
        }
    }

    #[tokio::test]
    async fn scheduled_backups_fire_once_per_slot() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        h.scheduler.set_backup_schedule(
            BackupSchedule::new(id, BackupKind::Incremental, "1h").unwrap(),
        );

        let now = epoch_secs();
        h.scheduler.tick(now).await;
        h.scheduler.tick(now + 1).await;
        assert_eq!(h.state.list_backups_for_deployment(id).unwrap().len(), 1);

        // The next slot fires again.
        h.scheduler.tick(now + 3600).await;
        assert_eq!(h.state.list_backups_for_deployment(id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schedule_is_dropped_when_deployment_is_gone() {
        let h = harness();
        let ghost = Uuid::new_v4();
        h.scheduler.set_backup_schedule(
            BackupSchedule::new(ghost, BackupKind::Full, "1h").unwrap(),
        );

        h.scheduler.tick(epoch_secs()).await;
        assert!(h.scheduler.backups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_cleanup_decommissions_expired_deployments() {
        let h = harness();
        let id = deploy_active(&h, Some(1)).await;

        h.scheduler.tick(epoch_secs() + 60).await;

        assert_eq!(
            h.orch.get_deployment(id).unwrap().state,
            DeploymentState::Destroyed
        );
        assert!(h.fake.live_handles().is_empty());
    }

    #[tokio::test]
    async fn ttl_cleanup_ignores_live_deployments() {
        let h = harness();
        let id = deploy_active(&h, Some(3600)).await;

        h.scheduler.tick(epoch_secs()).await;
        assert_eq!(
            h.orch.get_deployment(id).unwrap().state,
            DeploymentState::Active
        );
    }

    #[tokio::test]
    async fn scheduled_scaling_applies_inside_window() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        h.scheduler.set_scheduled_scaling(ScheduledScaling {
            deployment_id: id,
            // Whole day, so the plan is always due.
            window: DailyWindow {
                start_secs: 0,
                end_secs: 86_400,
            },
            target_replicas: 3,
        });

        h.scheduler.tick(epoch_secs()).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 3);

        // Repeats are noops at the target count.
        h.scheduler.tick(epoch_secs()).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 3);
    }

    #[tokio::test]
    async fn scheduled_scaling_waits_for_window() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        let now = epoch_secs();
        let sod = (now % 86_400) as u32;
        h.scheduler.set_scheduled_scaling(ScheduledScaling {
            deployment_id: id,
            window: DailyWindow {
                start_secs: (sod + 1000) % 86_400,
                end_secs: (sod + 2000) % 86_400,
            },
            target_replicas: 3,
        });

        h.scheduler.tick(now).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 1);
    }

    #[tokio::test]
    async fn policy_scaling_reacts_to_hot_cpu_with_cooldown() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        h.orch.set_policy(&policy(id, 1, 4)).unwrap();

        let now = epoch_secs();
        h.state.put_health(&snapshot(id, now, 95.0, 50)).unwrap();
        h.scheduler.tick(now).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 2);

        // Still hot, but inside the cooldown: no further scaling.
        h.state
            .put_health(&snapshot(id, now + 1, 95.0, 50))
            .unwrap();
        h.scheduler.tick(now + 2).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 2);

        // After the cooldown it scales again, clamped by the policy.
        h.state
            .put_health(&snapshot(id, now + 400, 95.0, 50))
            .unwrap();
        h.scheduler.tick(now + 400).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 3);
    }

    #[tokio::test]
    async fn policy_scaling_scales_down_when_idle() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        h.orch.scale(id, 3, OpOrigin::User).await.unwrap();
        h.orch.set_policy(&policy(id, 1, 4)).unwrap();

        let now = epoch_secs();
        h.state.put_health(&snapshot(id, now, 5.0, 2)).unwrap();
        h.scheduler.tick(now).await;
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 2);
    }

    #[tokio::test]
    async fn policy_scaling_respects_min_replicas() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        h.orch.set_policy(&policy(id, 1, 4)).unwrap();

        let now = epoch_secs();
        h.state.put_health(&snapshot(id, now, 5.0, 2)).unwrap();
        h.scheduler.tick(now).await;
        // Already at the floor.
        assert_eq!(h.orch.get_deployment(id).unwrap().endpoints.len(), 1);
    }

    #[tokio::test]
    async fn retention_purges_terminal_backups() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        let now = epoch_secs();

        let expired = BackupRecord {
            id: Uuid::new_v4(),
            deployment_id: id,
            kind: BackupKind::Full,
            status: BackupStatus::Complete,
            location: "backups/old.snap".to_string(),
            schedule_slot: None,
            failure_reason: None,
            created_at: now - 10_000,
            updated_at: now - 10_000,
            retention_until: now - 100,
        };
        let kept = BackupRecord {
            id: Uuid::new_v4(),
            retention_until: now + 10_000,
            location: "backups/new.snap".to_string(),
            ..expired.clone()
        };
        h.state.put_backup(&expired).unwrap();
        h.state.put_backup(&kept).unwrap();

        h.scheduler.tick(now).await;

        let remaining = h.state.list_backups_for_deployment(id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);
    }

    #[tokio::test]
    async fn retention_prunes_old_health_snapshots() {
        let h = harness();
        let id = deploy_active(&h, None).await;
        let now = epoch_secs();

        h.state
            .put_health(&snapshot(id, now - 200_000, 50.0, 10))
            .unwrap();
        h.state.put_health(&snapshot(id, now, 50.0, 10)).unwrap();

        h.scheduler.tick(now).await;

        let remaining = h.state.list_health_for_deployment(id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, now);
    }
}
