//! redb table definitions for the Strata state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Child records use composite keys `{deployment_id}:{child_id}` so that all
//! records for one deployment sit under a common prefix.

use redb::TableDefinition;

/// Deployment records keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Tenant records keyed by `{deployment_id}:{tenant_id}`.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Backup records keyed by `{deployment_id}:{backup_id}`.
pub const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");

/// Scaling policies keyed by `{deployment_id}` (at most one per deployment).
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// Health snapshots keyed by `{deployment_id}:{timestamp:020}`.
pub const HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("health");

/// Node inventory keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
