//! StateStore — redb-backed persistence for the Strata control plane.
//!
//! Provides typed CRUD operations over deployments, tenants, backups,
//! scaling policies, health snapshots, and nodes. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(TENANTS).map_err(map_err!(Table))?;
        txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.open_table(HEALTH).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic insert-or-update into a table.
    fn put_raw(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic delete. Returns true if the key existed.
    fn delete_raw(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, rec: &DeploymentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(rec).map_err(map_err!(Serialize))?;
        self.put_raw(DEPLOYMENTS, &rec.table_key(), &value)?;
        debug!(id = %rec.id, state = ?rec.state, "deployment stored");
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: Uuid) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id.to_string().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let rec: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rec: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rec);
        }
        Ok(results)
    }

    /// Apply a state transition to a deployment, enforcing the lifecycle
    /// edges. The record's `updated_at` is bumped to `now`.
    pub fn transition_deployment(
        &self,
        id: Uuid,
        next: DeploymentState,
        now: u64,
    ) -> StateResult<DeploymentRecord> {
        let mut rec = self
            .get_deployment(id)?
            .ok_or_else(|| StateError::NotFound(format!("deployment {id}")))?;

        if !rec.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition(format!(
                "deployment {id}: {:?} → {next:?}",
                rec.state
            )));
        }

        rec.state = next;
        rec.updated_at = now;
        self.put_deployment(&rec)?;
        Ok(rec)
    }

    /// Delete a deployment by id. Returns true if it existed.
    pub fn delete_deployment(&self, id: Uuid) -> StateResult<bool> {
        let existed = self.delete_raw(DEPLOYMENTS, &id.to_string())?;
        debug!(%id, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Insert or update a tenant record.
    pub fn put_tenant(&self, tenant: &TenantRecord) -> StateResult<()> {
        let value = serde_json::to_vec(tenant).map_err(map_err!(Serialize))?;
        self.put_raw(TENANTS, &tenant.table_key(), &value)
    }

    /// List all tenants for a deployment.
    pub fn list_tenants_for_deployment(
        &self,
        deployment_id: Uuid,
    ) -> StateResult<Vec<TenantRecord>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let tenant: TenantRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(tenant);
            }
        }
        Ok(results)
    }

    /// Find a tenant by its id alone (scans all deployments).
    pub fn find_tenant(&self, tenant_id: Uuid) -> StateResult<Option<TenantRecord>> {
        let suffix = format!(":{tenant_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().ends_with(&suffix) {
                let tenant: TenantRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                return Ok(Some(tenant));
            }
        }
        Ok(None)
    }

    /// Delete a tenant. Returns true if it existed.
    pub fn delete_tenant(&self, deployment_id: Uuid, tenant_id: Uuid) -> StateResult<bool> {
        self.delete_raw(TENANTS, &format!("{deployment_id}:{tenant_id}"))
    }

    /// Delete all tenants for a deployment. Returns number deleted.
    pub fn delete_tenants_for_deployment(&self, deployment_id: Uuid) -> StateResult<u32> {
        self.delete_by_prefix(TENANTS, &format!("{deployment_id}:"))
    }

    // ── Backups ────────────────────────────────────────────────────

    /// Insert or update a backup record.
    pub fn put_backup(&self, backup: &BackupRecord) -> StateResult<()> {
        let value = serde_json::to_vec(backup).map_err(map_err!(Serialize))?;
        self.put_raw(BACKUPS, &backup.table_key(), &value)
    }

    /// Get a backup by deployment and backup id.
    pub fn get_backup(
        &self,
        deployment_id: Uuid,
        backup_id: Uuid,
    ) -> StateResult<Option<BackupRecord>> {
        let key = format!("{deployment_id}:{backup_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let backup: BackupRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(backup))
            }
            None => Ok(None),
        }
    }

    /// List all backups for a deployment.
    pub fn list_backups_for_deployment(
        &self,
        deployment_id: Uuid,
    ) -> StateResult<Vec<BackupRecord>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let backup: BackupRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(backup);
            }
        }
        Ok(results)
    }

    /// Find an existing backup for a given schedule slot, if any.
    ///
    /// This is the idempotency check for scheduler-driven backups.
    pub fn find_backup_for_slot(
        &self,
        deployment_id: Uuid,
        slot: u64,
    ) -> StateResult<Option<BackupRecord>> {
        Ok(self
            .list_backups_for_deployment(deployment_id)?
            .into_iter()
            .find(|b| b.schedule_slot == Some(slot)))
    }

    /// Advance a backup's status, enforcing forward-only transitions.
    /// The record's `updated_at` is bumped to `now`.
    pub fn transition_backup(
        &self,
        deployment_id: Uuid,
        backup_id: Uuid,
        next: BackupStatus,
        failure_reason: Option<String>,
        now: u64,
    ) -> StateResult<BackupRecord> {
        let mut backup = self
            .get_backup(deployment_id, backup_id)?
            .ok_or_else(|| StateError::NotFound(format!("backup {backup_id}")))?;

        if !backup.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition(format!(
                "backup {backup_id}: {:?} → {next:?}",
                backup.status
            )));
        }

        backup.status = next;
        backup.failure_reason = failure_reason;
        backup.updated_at = now;
        self.put_backup(&backup)?;
        Ok(backup)
    }

    /// Purge backups whose retention window has elapsed.
    ///
    /// Only terminal backups (`Complete` or `Failed`) with
    /// `retention_until <= now` are removed. Returns number purged.
    pub fn purge_expired_backups(&self, now: u64) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let backup: BackupRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                let terminal = matches!(
                    backup.status,
                    BackupStatus::Complete | BackupStatus::Failed
                );
                if terminal && now >= backup.retention_until {
                    expired.push(key.value().to_string());
                }
            }
            expired
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            debug!(count, "expired backups purged");
        }
        Ok(count)
    }

    // ── Scaling policies ───────────────────────────────────────────

    /// Insert or update the scaling policy for a deployment.
    pub fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        let value = serde_json::to_vec(policy).map_err(map_err!(Serialize))?;
        self.put_raw(POLICIES, &policy.table_key(), &value)
    }

    /// Get the scaling policy for a deployment, if one exists.
    pub fn get_policy(&self, deployment_id: Uuid) -> StateResult<Option<ScalingPolicy>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        match table
            .get(deployment_id.to_string().as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let policy: ScalingPolicy =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(policy))
            }
            None => Ok(None),
        }
    }

    /// Delete the scaling policy for a deployment.
    pub fn delete_policy(&self, deployment_id: Uuid) -> StateResult<bool> {
        self.delete_raw(POLICIES, &deployment_id.to_string())
    }

    // ── Health snapshots ───────────────────────────────────────────

    /// Append a health snapshot.
    pub fn put_health(&self, snapshot: &HealthSnapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        self.put_raw(HEALTH, &snapshot.table_key(), &value)
    }

    /// List health snapshots for a deployment in chronological order.
    pub fn list_health_for_deployment(
        &self,
        deployment_id: Uuid,
    ) -> StateResult<Vec<HealthSnapshot>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HEALTH).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let snapshot: HealthSnapshot =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(snapshot);
            }
        }
        Ok(results)
    }

    /// The most recent health snapshot for a deployment.
    pub fn latest_health(&self, deployment_id: Uuid) -> StateResult<Option<HealthSnapshot>> {
        Ok(self
            .list_health_for_deployment(deployment_id)?
            .into_iter()
            .max_by_key(|s| s.timestamp))
    }

    /// Delete health snapshots older than `before`. Returns number pruned.
    pub fn prune_health_before(&self, before: u64) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(HEALTH).map_err(map_err!(Table))?;
            let mut old = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let snapshot: HealthSnapshot =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if snapshot.timestamp < before {
                    old.push(key.value().to_string());
                }
            }
            old
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(HEALTH).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        self.put_raw(NODES, &node.id, &value)
    }

    /// Get a node by id.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Delete a node by id. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_raw(NODES, node_id)
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Delete all keys with a given prefix. Returns number deleted.
    fn delete_by_prefix(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deployment() -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            engine: EngineType::Relational,
            environment: Environment::Dev,
            state: DeploymentState::Requested,
            isolation: IsolationMode::Schema,
            resources: ResourceSpec {
                cpu_millis: 1000,
                memory_bytes: 2 << 30,
                storage_bytes: 10 << 30,
                replicas: 1,
            },
            endpoints: vec![],
            owner: Some("alice".to_string()),
            ttl_seconds: None,
            failure_reason: None,
            maintenance_window: None,
            tls_required: false,
            admin_credential: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_tenant(deployment_id: Uuid, key: &str) -> TenantRecord {
        TenantRecord {
            id: Uuid::new_v4(),
            deployment_id,
            isolation_key: key.to_string(),
            quota: 100,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_backup(deployment_id: Uuid, retention_until: u64) -> BackupRecord {
        BackupRecord {
            id: Uuid::new_v4(),
            deployment_id,
            kind: BackupKind::Full,
            status: BackupStatus::Pending,
            location: "s3://backups/x".to_string(),
            schedule_slot: None,
            failure_reason: None,
            created_at: 1000,
            updated_at: 1000,
            retention_until,
        }
    }

    fn test_node(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            capacity_cpu_millis: 8000,
            capacity_memory_bytes: 16 << 30,
            used_cpu_millis: 0,
            used_memory_bytes: 0,
            draining: false,
            updated_at: 1000,
        }
    }

    // ── Deployment CRUD ────────────────────────────────────────────

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = test_deployment();

        store.put_deployment(&rec).unwrap();
        let retrieved = store.get_deployment(rec.id).unwrap();

        assert_eq!(retrieved, Some(rec));
    }

    #[test]
    fn deployment_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_deployment(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn deployment_list_all() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment()).unwrap();
        store.put_deployment(&test_deployment()).unwrap();
        store.put_deployment(&test_deployment()).unwrap();

        assert_eq!(store.list_deployments().unwrap().len(), 3);
    }

    #[test]
    fn deployment_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = test_deployment();
        store.put_deployment(&rec).unwrap();

        assert!(store.delete_deployment(rec.id).unwrap());
        assert!(!store.delete_deployment(rec.id).unwrap());
        assert!(store.get_deployment(rec.id).unwrap().is_none());
    }

    #[test]
    fn transition_follows_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = test_deployment();
        store.put_deployment(&rec).unwrap();

        let updated = store
            .transition_deployment(rec.id, DeploymentState::QuotaValidated, 2000)
            .unwrap();
        assert_eq!(updated.state, DeploymentState::QuotaValidated);
        assert_eq!(updated.updated_at, 2000);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = test_deployment();
        store.put_deployment(&rec).unwrap();

        // Requested → Active skips the pipeline.
        let result = store.transition_deployment(rec.id, DeploymentState::Active, 2000);
        assert!(matches!(result, Err(StateError::InvalidTransition(_))));

        // Record is untouched.
        let unchanged = store.get_deployment(rec.id).unwrap().unwrap();
        assert_eq!(unchanged.state, DeploymentState::Requested);
        assert_eq!(unchanged.updated_at, 1000);
    }

    #[test]
    fn transition_unknown_deployment_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let result =
            store.transition_deployment(Uuid::new_v4(), DeploymentState::QuotaValidated, 0);
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    // ── Tenant CRUD ────────────────────────────────────────────────

    #[test]
    fn tenant_put_list_and_find() {
        let store = StateStore::open_in_memory().unwrap();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();

        let t1 = test_tenant(d1, "tenant_a");
        store.put_tenant(&t1).unwrap();
        store.put_tenant(&test_tenant(d1, "tenant_b")).unwrap();
        store.put_tenant(&test_tenant(d2, "tenant_a")).unwrap();

        assert_eq!(store.list_tenants_for_deployment(d1).unwrap().len(), 2);
        assert_eq!(store.list_tenants_for_deployment(d2).unwrap().len(), 1);

        let found = store.find_tenant(t1.id).unwrap();
        assert_eq!(found, Some(t1));
        assert!(store.find_tenant(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn tenant_delete_and_cascade() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();
        let t1 = test_tenant(deployment_id, "a");
        store.put_tenant(&t1).unwrap();
        store.put_tenant(&test_tenant(deployment_id, "b")).unwrap();

        assert!(store.delete_tenant(deployment_id, t1.id).unwrap());
        assert_eq!(
            store.delete_tenants_for_deployment(deployment_id).unwrap(),
            1
        );
        assert!(store
            .list_tenants_for_deployment(deployment_id)
            .unwrap()
            .is_empty());
    }

    // ── Backup CRUD ────────────────────────────────────────────────

    #[test]
    fn backup_put_get_list() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();
        let backup = test_backup(deployment_id, 5000);

        store.put_backup(&backup).unwrap();
        assert_eq!(
            store.get_backup(deployment_id, backup.id).unwrap(),
            Some(backup)
        );
        assert_eq!(
            store.list_backups_for_deployment(deployment_id).unwrap().len(),
            1
        );
    }

    #[test]
    fn backup_slot_lookup() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();

        let mut backup = test_backup(deployment_id, 5000);
        backup.schedule_slot = Some(42);
        store.put_backup(&backup).unwrap();

        let found = store.find_backup_for_slot(deployment_id, 42).unwrap();
        assert_eq!(found.map(|b| b.id), Some(backup.id));
        assert!(store.find_backup_for_slot(deployment_id, 43).unwrap().is_none());
    }

    #[test]
    fn backup_transition_forward_only() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();
        let backup = test_backup(deployment_id, 5000);
        store.put_backup(&backup).unwrap();

        let running = store
            .transition_backup(deployment_id, backup.id, BackupStatus::Running, None, 2000)
            .unwrap();
        assert_eq!(running.updated_at, 2000);

        let done = store
            .transition_backup(deployment_id, backup.id, BackupStatus::Complete, None, 3000)
            .unwrap();
        assert_eq!(done.status, BackupStatus::Complete);
        assert_eq!(done.updated_at, 3000);

        // Backwards is rejected.
        let result =
            store.transition_backup(deployment_id, backup.id, BackupStatus::Running, None, 4000);
        assert!(matches!(result, Err(StateError::InvalidTransition(_))));
    }

    #[test]
    fn retention_blocks_purge() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();

        let mut kept = test_backup(deployment_id, 10_000);
        kept.status = BackupStatus::Complete;
        store.put_backup(&kept).unwrap();

        let mut purgeable = test_backup(deployment_id, 2000);
        purgeable.status = BackupStatus::Complete;
        store.put_backup(&purgeable).unwrap();

        // A pending backup past retention is still not purged.
        let pending = test_backup(deployment_id, 2000);
        store.put_backup(&pending).unwrap();

        let purged = store.purge_expired_backups(3000).unwrap();
        assert_eq!(purged, 1);

        let remaining = store.list_backups_for_deployment(deployment_id).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|b| b.id != purgeable.id));
    }

    // ── Policy CRUD ────────────────────────────────────────────────

    #[test]
    fn policy_put_get_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();
        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            deployment_id,
            cpu_up: 80.0,
            cpu_down: 20.0,
            memory_up: 80.0,
            memory_down: 20.0,
            connections_up: 500,
            connections_down: 50,
            cooldown_seconds: 300,
            min_replicas: 1,
            max_replicas: 5,
            updated_at: 1000,
        };

        store.put_policy(&policy).unwrap();
        assert_eq!(store.get_policy(deployment_id).unwrap(), Some(policy));
        assert!(store.delete_policy(deployment_id).unwrap());
        assert!(store.get_policy(deployment_id).unwrap().is_none());
    }

    // ── Health snapshots ───────────────────────────────────────────

    #[test]
    fn health_append_latest_and_prune() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment_id = Uuid::new_v4();

        for ts in [1000u64, 2000, 3000] {
            store
                .put_health(&HealthSnapshot {
                    deployment_id,
                    timestamp: ts,
                    status: HealthState::Healthy,
                    latency_ms: 2.5,
                    utilization: ResourceUtilization::default(),
                })
                .unwrap();
        }

        assert_eq!(store.list_health_for_deployment(deployment_id).unwrap().len(), 3);
        assert_eq!(
            store.latest_health(deployment_id).unwrap().map(|s| s.timestamp),
            Some(3000)
        );

        let pruned = store.prune_health_before(2500).unwrap();
        assert_eq!(pruned, 2);
        assert_eq!(store.list_health_for_deployment(deployment_id).unwrap().len(), 1);
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_get_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("node-1")).unwrap();
        store.put_node(&test_node("node-2")).unwrap();

        assert!(store.get_node("node-1").unwrap().is_some());
        assert_eq!(store.list_nodes().unwrap().len(), 2);
        assert!(store.delete_node("node-1").unwrap());
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");
        let rec = test_deployment();

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_deployment(&rec).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let retrieved = store.get_deployment(rec.id).unwrap();
        assert_eq!(retrieved, Some(rec));
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();

        assert!(store.list_deployments().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_tenants_for_deployment(id).unwrap().is_empty());
        assert!(store.list_backups_for_deployment(id).unwrap().is_empty());
        assert!(store.latest_health(id).unwrap().is_none());
        assert!(!store.delete_deployment(id).unwrap());
        assert_eq!(store.purge_expired_backups(u64::MAX).unwrap(), 0);
    }
}
