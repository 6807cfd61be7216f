//! strata-state — persistent control-plane state for Strata.
//!
//! The single source of truth for deployment records, tenants, backups,
//! scaling policies, health snapshots, and node inventory. Everything is
//! stored in redb tables with JSON-serialized values.
//!
//! # Architecture
//!
//! ```text
//! StateStore (redb)
//!   ├── deployments  {deployment_id}            → DeploymentRecord
//!   ├── tenants      {deployment_id}:{tenant}   → TenantRecord
//!   ├── backups      {deployment_id}:{backup}   → BackupRecord
//!   ├── policies     {deployment_id}            → ScalingPolicy
//!   ├── health       {deployment_id}:{ts}       → HealthSnapshot
//!   └── nodes        {node_id}                  → NodeRecord
//! ```

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
