//! strata-orchestrator — deployment lifecycle control.
//!
//! The orchestrator is the single mutation path for deployments: quota
//! validation, the deploy/scale/decommission surface, tenants, backups,
//! restore, and aggregate health. Per-deployment `tokio::Mutex` locks
//! serialize mutating operations; user ops fail fast with a conflict while
//! scheduler ops wait. Progress is broadcast on an event channel.
//!
//! # Architecture
//!
//! ```text
//! callers ──► Orchestrator ──► Deployer ──► ExecutionSubstrate
//!                 │   │
//!                 │   └──► Registry (routing, breakers)
//!                 └──► StateStore (records of everything)
//! ```

pub mod error;
pub mod events;
pub mod orchestrator;

pub use error::{OrchestratorError, OrchestratorResult};
pub use events::Event;
pub use orchestrator::{
    DeployRequest, OpOrigin, Orchestrator, OrchestratorConfig, QuotaConfig, RestoreResult,
    ScalingResult, SystemHealth,
};
