//! Restart backoff and per-worker circuit breaker. Pure state, time passed in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;

/// Exponential restart delay: `initial * multiplier^(attempt - 1)`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            initial: config.backoff_initial,
            max: config.backoff_max,
            multiplier: config.backoff_multiplier.max(1),
        }
    }

    /// Delay before the given restart attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{}", label)
    }
}

/// Stops restart loops after repeated crashes
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    open_duration: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            threshold: threshold.max(1),
            open_duration,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the supervisor may launch the worker now
    pub fn allows_start(&self) -> bool {
        self.state != BreakerState::Open
    }

    /// Count a crash. Returns true when this crash opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let should_open = match self.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => self.consecutive_failures >= self.threshold,
            BreakerState::Open => false,
        };
        if should_open {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
        }
        should_open
    }

    /// A run survived the stable period. Returns true when this closed an open or half-open breaker.
    pub fn record_success(&mut self) -> bool {
        let was_tripped = self.state != BreakerState::Closed;
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        was_tripped
    }

    /// Move to half-open once the open period has elapsed
    pub fn try_half_open(&mut self, now: Instant) -> bool {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened)) if now.duration_since(opened) >= self.open_duration => {
                self.state = BreakerState::HalfOpen;
                true
            }
            _ => false,
        }
    }

    /// Operator override: allow one probe run immediately
    pub fn force_half_open(&mut self) -> bool {
        if self.state == BreakerState::Open {
            self.state = BreakerState::HalfOpen;
            true
        } else {
            false
        }
    }

    pub fn open_duration(&self) -> Duration {
        self.open_duration
    }
}
