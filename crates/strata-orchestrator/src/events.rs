//! Broadcast events emitted by the orchestrator.
//!
//! Consumers subscribe explicitly via [`crate::Orchestrator::subscribe`];
//! a lagging consumer loses old events rather than blocking publishers.

use uuid::Uuid;

use strata_state::{BackupStatus, DeploymentState};

/// Channel capacity; slow subscribers past this lag see `RecvError::Lagged`.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A deployment's persisted state changed.
    DeploymentTransitioned {
        deployment_id: Uuid,
        state: DeploymentState,
    },
    /// A backup execution reached a terminal status.
    BackupFinished {
        deployment_id: Uuid,
        backup_id: Uuid,
        status: BackupStatus,
    },
    /// A replica-count change was applied.
    ScalingApplied {
        deployment_id: Uuid,
        from: u32,
        to: u32,
    },
}
