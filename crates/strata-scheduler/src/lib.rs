//! strata-scheduler — background duties of the control plane.
//!
//! A single `tokio::select!` loop that, each tick, fires due scheduled
//! backups (idempotent per slot), decommissions expired ephemeral
//! deployments, applies scheduled and policy-driven scaling, drains
//! deferred maintenance-window operations, and purges retention. All of
//! it goes through the orchestrator's public surface.

pub mod schedule;
pub mod scheduler;

pub use schedule::{parse_interval, BackupSchedule, ScheduleError, ScheduledScaling};
pub use scheduler::{Scheduler, SchedulerConfig};
