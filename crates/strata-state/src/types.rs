//! Domain types for the Strata state store.
//!
//! These types represent the persisted state of deployments, tenants,
//! backups, scaling policies, health snapshots, and nodes. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Deployment ─────────────────────────────────────────────────────

/// Pluggable storage engine variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Relational,
    KeyValue,
}

/// Target environment for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

/// How tenants are isolated within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Each tenant gets its own schema on a shared instance.
    Schema,
    /// Each tenant's keys carry a distinct prefix.
    KeyPrefix,
    /// Each tenant gets a dedicated instance endpoint.
    DedicatedInstance,
}

/// Lifecycle state of a deployment.
///
/// Transitions are restricted to the edges encoded in
/// [`DeploymentState::can_transition_to`]; `Destroyed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Requested,
    QuotaValidated,
    Provisioning,
    Configuring,
    Registering,
    HealthValidating,
    Active,
    Scaling,
    Decommissioning,
    Destroyed,
    Failed,
}

impl DeploymentState {
    /// Whether no further transitions are possible from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// Whether `self → next` is a legal edge of the lifecycle state machine.
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;

        // Any non-terminal state may fail.
        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Requested, QuotaValidated)
                | (QuotaValidated, Provisioning)
                | (Provisioning, Configuring)
                | (Configuring, Registering)
                | (Registering, HealthValidating)
                | (HealthValidating, Active)
                | (Active, Scaling)
                | (Scaling, Active)
                | (Active, Decommissioning)
                | (Decommissioning, Destroyed)
        )
    }
}

/// Requested resources per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU in millicores (1000 = one core).
    pub cpu_millis: u32,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Storage in bytes.
    pub storage_bytes: u64,
    /// Desired replica count.
    pub replicas: u32,
}

/// A daily wall-clock window expressed in seconds-of-day.
///
/// Windows may wrap around midnight (`start > end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindow {
    pub start_secs: u32,
    pub end_secs: u32,
}

impl DailyWindow {
    /// Whether the given second-of-day falls inside the window.
    pub fn contains(&self, secs_of_day: u32) -> bool {
        if self.start_secs <= self.end_secs {
            secs_of_day >= self.start_secs && secs_of_day < self.end_secs
        } else {
            // Wraps past midnight.
            secs_of_day >= self.start_secs || secs_of_day < self.end_secs
        }
    }
}

/// One provisioned replica of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    /// Routable `host:port` address.
    pub address: String,
    /// Opaque substrate handle backing this replica.
    pub handle_id: String,
    /// Node the replica was placed on.
    pub node_id: String,
}

/// A provisioned database deployment managed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub engine: EngineType,
    pub environment: Environment,
    pub state: DeploymentState,
    pub isolation: IsolationMode,
    pub resources: ResourceSpec,
    /// Replica endpoints; non-empty only while Active or Scaling.
    pub endpoints: Vec<ReplicaEndpoint>,
    /// Owner identity used for quota accounting and list filtering.
    pub owner: Option<String>,
    /// Time-to-live for ephemeral deployments (dev sandboxes).
    pub ttl_seconds: Option<u64>,
    /// Diagnostic for terminal failures.
    pub failure_reason: Option<String>,
    /// Window during which conflicting operations are queued.
    pub maintenance_window: Option<DailyWindow>,
    /// Whether client connections must use TLS. Decided during the
    /// network-policy stage and recorded at finalization.
    pub tls_required: bool,
    /// Admin credential minted during the security stage. Cleared on
    /// decommission.
    pub admin_credential: Option<Uuid>,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last mutation.
    pub updated_at: u64,
}

impl DeploymentRecord {
    /// Whether the TTL has elapsed as of `now`.
    pub fn ttl_expired(&self, now: u64) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now >= self.created_at.saturating_add(ttl),
            None => false,
        }
    }

    /// Build the key for the deployments table.
    pub fn table_key(&self) -> String {
        self.id.to_string()
    }
}

// ── Tenant ────────────────────────────────────────────────────────

/// A logical sub-partition of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: Uuid,
    pub deployment_id: Uuid,
    /// Schema name, key prefix, or dedicated instance id depending on the
    /// deployment's isolation mode. Unique within a deployment.
    pub isolation_key: String,
    pub quota: u64,
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last mutation.
    pub updated_at: u64,
}

impl TenantRecord {
    /// Build the composite key for the tenants table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment_id, self.id)
    }
}

// ── Backup ────────────────────────────────────────────────────────

/// What kind of backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
    Differential,
}

/// Backup execution status. Transitions only move forward:
/// `Pending → Running → {Complete | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl BackupStatus {
    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
        )
    }
}

/// A point-in-time backup of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub kind: BackupKind,
    pub status: BackupStatus,
    /// Storage location of the backup artifact.
    pub location: String,
    /// Schedule slot that produced this backup, if scheduler-driven.
    /// Used to suppress duplicate records for the same slot.
    pub schedule_slot: Option<u64>,
    pub failure_reason: Option<String>,
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
    /// The backup is never physically purged before this timestamp.
    pub retention_until: u64,
}

impl BackupRecord {
    /// Build the composite key for the backups table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.deployment_id, self.id)
    }
}

// ── Scaling policy ────────────────────────────────────────────────

/// Metric thresholds and replica bounds governing a deployment's scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub id: Uuid,
    pub deployment_id: Uuid,
    /// CPU utilization (percent) above which to scale up.
    pub cpu_up: f64,
    /// CPU utilization (percent) below which to scale down.
    pub cpu_down: f64,
    /// Memory utilization (percent) thresholds.
    pub memory_up: f64,
    pub memory_down: f64,
    /// Connection count thresholds.
    pub connections_up: u32,
    pub connections_down: u32,
    /// Minimum seconds between scaling decisions.
    pub cooldown_seconds: u64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Unix timestamp (seconds) of the last mutation.
    pub updated_at: u64,
}

impl ScalingPolicy {
    /// Whether a desired replica count lies inside the policy bounds.
    pub fn within_bounds(&self, replicas: u32) -> bool {
        replicas >= self.min_replicas && replicas <= self.max_replicas
    }

    /// Clamp a desired replica count to the policy bounds.
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }

    /// Build the key for the policies table.
    pub fn table_key(&self) -> String {
        self.deployment_id.to_string()
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Raw resource counters reported by the execution substrate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUtilization {
    /// CPU utilization as a percentage (0–100).
    pub cpu_percent: f64,
    /// Memory in use in bytes.
    pub memory_bytes: u64,
    /// Disk I/O operations per second.
    pub disk_io_ops: u64,
    /// Open client connections.
    pub connections: u32,
}

/// Append-only point-in-time health observation for a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub deployment_id: Uuid,
    pub timestamp: u64,
    pub status: HealthState,
    pub latency_ms: f64,
    pub utilization: ResourceUtilization,
}

impl HealthSnapshot {
    /// Build the composite key for the health table.
    ///
    /// The timestamp is zero-padded so keys sort chronologically.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.deployment_id, self.timestamp)
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// A candidate placement target in the substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub address: String,
    pub capacity_cpu_millis: u32,
    pub capacity_memory_bytes: u64,
    pub used_cpu_millis: u32,
    pub used_memory_bytes: u64,
    /// Draining nodes accept no new placements.
    pub draining: bool,
    pub updated_at: u64,
}

impl NodeRecord {
    pub fn free_cpu(&self) -> u32 {
        self.capacity_cpu_millis.saturating_sub(self.used_cpu_millis)
    }

    pub fn free_memory(&self) -> u64 {
        self.capacity_memory_bytes.saturating_sub(self.used_memory_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_states_advance_in_order() {
        use DeploymentState::*;
        let order = [
            Requested,
            QuotaValidated,
            Provisioning,
            Configuring,
            Registering,
            HealthValidating,
            Active,
        ];
        for pair in order.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} → {:?} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn no_skipping_to_active() {
        use DeploymentState::*;
        assert!(!Requested.can_transition_to(Active));
        assert!(!Provisioning.can_transition_to(Active));
        assert!(!Registering.can_transition_to(Active));
    }

    #[test]
    fn scaling_returns_to_active() {
        use DeploymentState::*;
        assert!(Active.can_transition_to(Scaling));
        assert!(Scaling.can_transition_to(Active));
        assert!(!Scaling.can_transition_to(Decommissioning));
    }

    #[test]
    fn any_non_terminal_state_may_fail() {
        use DeploymentState::*;
        for state in [
            Requested,
            QuotaValidated,
            Provisioning,
            Configuring,
            Registering,
            HealthValidating,
            Active,
            Scaling,
            Decommissioning,
        ] {
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use DeploymentState::*;
        for next in [
            Requested,
            QuotaValidated,
            Provisioning,
            Active,
            Failed,
            Destroyed,
        ] {
            assert!(!Destroyed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn backup_status_only_moves_forward() {
        use BackupStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Complete));
    }

    #[test]
    fn daily_window_contains() {
        let w = DailyWindow {
            start_secs: 3600,
            end_secs: 7200,
        };
        assert!(!w.contains(3599));
        assert!(w.contains(3600));
        assert!(w.contains(7199));
        assert!(!w.contains(7200));
    }

    #[test]
    fn daily_window_wraps_midnight() {
        let w = DailyWindow {
            start_secs: 82800, // 23:00
            end_secs: 3600,    // 01:00
        };
        assert!(w.contains(83000));
        assert!(w.contains(0));
        assert!(w.contains(3599));
        assert!(!w.contains(3600));
        assert!(!w.contains(43200));
    }

    #[test]
    fn ttl_expiry() {
        let mut rec = DeploymentRecord {
            id: Uuid::new_v4(),
            engine: EngineType::Relational,
            environment: Environment::Dev,
            state: DeploymentState::Active,
            isolation: IsolationMode::Schema,
            resources: ResourceSpec {
                cpu_millis: 1000,
                memory_bytes: 2 << 30,
                storage_bytes: 10 << 30,
                replicas: 1,
            },
            endpoints: vec![],
            owner: None,
            ttl_seconds: Some(100),
            failure_reason: None,
            maintenance_window: None,
            tls_required: false,
            admin_credential: None,
            created_at: 1000,
            updated_at: 1000,
        };

        assert!(!rec.ttl_expired(1099));
        assert!(rec.ttl_expired(1100));

        rec.ttl_seconds = None;
        assert!(!rec.ttl_expired(u64::MAX));
    }

    #[test]
    fn policy_bounds_and_clamp() {
        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4(),
            cpu_up: 80.0,
            cpu_down: 20.0,
            memory_up: 80.0,
            memory_down: 20.0,
            connections_up: 500,
            connections_down: 50,
            cooldown_seconds: 300,
            min_replicas: 2,
            max_replicas: 5,
            updated_at: 0,
        };

        assert!(policy.within_bounds(2));
        assert!(policy.within_bounds(5));
        assert!(!policy.within_bounds(1));
        assert!(!policy.within_bounds(6));

        assert_eq!(policy.clamp(1), 2);
        assert_eq!(policy.clamp(10), 5);
        assert_eq!(policy.clamp(3), 3);
    }

    #[test]
    fn health_snapshot_keys_sort_chronologically() {
        let id = Uuid::new_v4();
        let snap = |ts| HealthSnapshot {
            deployment_id: id,
            timestamp: ts,
            status: HealthState::Healthy,
            latency_ms: 1.0,
            utilization: ResourceUtilization::default(),
        };

        assert!(snap(9).table_key() < snap(10).table_key());
        assert!(snap(999).table_key() < snap(1000).table_key());
    }

    #[test]
    fn node_free_resources_saturate() {
        let node = NodeRecord {
            id: "node-1".to_string(),
            address: "10.0.0.1".to_string(),
            capacity_cpu_millis: 4000,
            capacity_memory_bytes: 8 << 30,
            used_cpu_millis: 5000, // over-committed
            used_memory_bytes: 1 << 30,
            draining: false,
            updated_at: 1000,
        };

        assert_eq!(node.free_cpu(), 0);
        assert_eq!(node.free_memory(), 7 << 30);
    }
}
