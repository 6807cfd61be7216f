//! Circuit breaker for a single registry entry.
//!
//! Consumer-reported failures and failed probes increment a consecutive
//! failure count; at the configured threshold the entry opens and is
//! excluded from routing. After a cooldown the breaker admits exactly one
//! half-open trial request: success closes the breaker, failure restarts
//! the cooldown.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Thresholds governing a breaker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Seconds to wait before admitting a half-open probe.
    pub cooldown_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_seconds: 30,
        }
    }
}

/// Whether an entry may receive traffic right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routability {
    /// Breaker closed — route freely.
    Routable,
    /// Cooldown elapsed — one probe request may be admitted.
    ProbeCandidate,
    /// Open and cooling down, or a probe is already in flight.
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    /// Open until the given timestamp.
    Open { until: u64 },
    /// One trial request is in flight.
    HalfOpen,
}

/// Per-entry breaker state machine. All methods take `now` explicitly so
/// the time source stays injectable in tests.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: State,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: State::Closed,
            consecutive_failures: 0,
        }
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the breaker is open (entry excluded from normal routing).
    pub fn is_open(&self) -> bool {
        !matches!(self.state, State::Closed)
    }

    /// Classify the entry's routability at `now` without mutating state.
    pub fn routability(&self, now: u64) -> Routability {
        match self.state {
            State::Closed => Routability::Routable,
            State::Open { until } if now >= until => Routability::ProbeCandidate,
            State::Open { .. } => Routability::Excluded,
            State::HalfOpen => Routability::Excluded,
        }
    }

    /// Try to claim the single half-open probe slot. Returns true if this
    /// caller holds it.
    pub fn try_admit_probe(&mut self, now: u64) -> bool {
        match self.state {
            State::Open { until } if now >= until => {
                self.state = State::HalfOpen;
                debug!("breaker half-open, admitting one probe");
                true
            }
            _ => false,
        }
    }

    /// Record a successful request or probe.
    ///
    /// Successes reported while the breaker is open and still cooling down
    /// are ignored; recovery only happens through the half-open probe slot.
    pub fn record_success(&mut self, now: u64) {
        if let State::Open { until } = self.state
            && now < until
        {
            debug!("success ignored while breaker cooldown runs");
            return;
        }
        if self.state != State::Closed {
            debug!("breaker closed after successful probe");
        }
        self.state = State::Closed;
        self.consecutive_failures = 0;
    }

    /// Record a failed request or probe.
    pub fn record_failure(&mut self, now: u64) {
        self.consecutive_failures += 1;

        match self.state {
            State::HalfOpen => {
                // Probe failed — restart the cooldown.
                self.state = State::Open {
                    until: now + self.config.cooldown_seconds,
                };
                debug!("half-open probe failed, cooldown restarted");
            }
            State::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.state = State::Open {
                    until: now + self.config.cooldown_seconds,
                };
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "breaker opened"
                );
            }
            _ => {}
        }
    }
}
