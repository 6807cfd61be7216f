//! Recurrence plans: backup schedules and scaling windows.
//!
//! Recurrence uses a fixed interval with slot arithmetic rather than a
//! calendar expression: slot = `now / interval_secs`. A backup fires at
//! most once per slot, which makes firing idempotent across restarts and
//! gives missed slots exactly one catch-up run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use strata_state::{BackupKind, DailyWindow};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid interval {0:?}: expected <number><s|m|h|d>")]
    InvalidInterval(String),

    #[error("interval must be > 0")]
    ZeroInterval,
}

/// Parse an interval like `"30s"`, `"15m"`, `"6h"`, or `"1d"`.
pub fn parse_interval(s: &str) -> Result<Duration, ScheduleError> {
    let s = s.trim();
    let secs = if let Some(n) = s.strip_suffix('s') {
        parse_count(n, s)?
    } else if let Some(n) = s.strip_suffix('m') {
        parse_count(n, s)? * 60
    } else if let Some(n) = s.strip_suffix('h') {
        parse_count(n, s)? * 3600
    } else if let Some(n) = s.strip_suffix('d') {
        parse_count(n, s)? * 86_400
    } else {
        return Err(ScheduleError::InvalidInterval(s.to_string()));
    };
    if secs == 0 {
        return Err(ScheduleError::ZeroInterval);
    }
    Ok(Duration::from_secs(secs))
}

fn parse_count(n: &str, original: &str) -> Result<u64, ScheduleError> {
    n.parse::<u64>()
        .map_err(|_| ScheduleError::InvalidInterval(original.to_string()))
}

/// Recurring backup plan for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub deployment_id: Uuid,
    pub kind: BackupKind,
    /// Seconds between backups.
    pub interval_secs: u64,
}

impl BackupSchedule {
    pub fn new(
        deployment_id: Uuid,
        kind: BackupKind,
        interval: &str,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            deployment_id,
            kind,
            interval_secs: parse_interval(interval)?.as_secs(),
        })
    }

    /// The slot `now` falls into. At most one backup exists per slot.
    pub fn slot(&self, now: u64) -> u64 {
        now / self.interval_secs
    }
}

/// Daily replica-count plan, applied while the window is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledScaling {
    pub deployment_id: Uuid,
    pub window: DailyWindow,
    pub target_replicas: u32,
}

impl ScheduledScaling {
    /// Whether the plan should apply at the given epoch time.
    pub fn applies_at(&self, now: u64) -> bool {
        self.window.contains((now % 86_400) as u32)
    }
}
