use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::policy::{BreakerState, CircuitBreaker};
use crate::config::WorkerSpec;
use crate::types::Tier;

const HISTORY_LIMIT: usize = 32;

/// Lifecycle of one managed worker:
/// `stopped -> starting -> running -> (crashed | stopping) -> stopped`,
/// with `crashed -> starting` for restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Crashed,
    Stopping,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Crashed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Crashed, Starting)
                | (Crashed, Stopped)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Crashed => "crashed",
            WorkerState::Stopping => "stopping",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub from: WorkerState,
    pub to: WorkerState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Snapshot returned by `Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: String,
    pub agent_id: String,
    pub tier: Tier,
    pub state: WorkerState,
    pub breaker: BreakerState,
    pub restarts: u32,
    pub consecutive_crashes: u32,
    pub pid: Option<u32>,
    pub last_exit_code: Option<i32>,
    pub last_transition_at: DateTime<Utc>,
    pub desired_running: bool,
}

/// Monitor task of the current run
pub(crate) struct RunHandle {
    pub stop: CancellationToken,
    pub task: JoinHandle<()>,
}

pub(crate) struct WorkerInner {
    pub state: WorkerState,
    pub breaker: CircuitBreaker,
    pub desired: bool,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    pub last_transition_at: DateTime<Utc>,
    pub last_request: Instant,
    /// Bumped on every launch; stale monitor and timer events compare against it
    pub generation: u64,
    pub run: Option<RunHandle>,
    pub history: VecDeque<TransitionRecord>,
}

impl WorkerInner {
    /// Apply and log a transition. Invalid transitions are refused.
    pub fn transition(&mut self, worker_id: &str, to: WorkerState, reason: &str) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(worker_id = %worker_id, from = %from, to = %to, reason, "Refused invalid worker transition");
            return false;
        }

        let at = Utc::now();
        self.state = to;
        self.last_transition_at = at;
        info!(
            worker_id = %worker_id,
            from = %from,
            to = %to,
            at = %at.to_rfc3339(),
            reason,
            "Worker state transition"
        );

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            at,
            reason: reason.to_string(),
        });
        true
    }
}

/// One managed worker. `op_lock` serializes operator and scheduler operations;
/// `inner` is only held for short synchronous updates.
pub(crate) struct WorkerSlot {
    pub spec: WorkerSpec,
    pub op_lock: tokio::sync::Mutex<()>,
    inner: Mutex<WorkerInner>,
}

impl WorkerSlot {
    pub fn new(spec: WorkerSpec, breaker: CircuitBreaker) -> Self {
        Self {
            spec,
            op_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Stopped,
                breaker,
                desired: false,
                pid: None,
                restarts: 0,
                last_exit_code: None,
                last_transition_at: Utc::now(),
                last_request: Instant::now(),
                generation: 0,
                run: None,
                history: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> WorkerStatus {
        let inner = self.lock();
        WorkerStatus {
            id: self.spec.id.clone(),
            agent_id: self.spec.agent_id().to_string(),
            tier: self.spec.tier,
            state: inner.state,
            breaker: inner.breaker.state(),
            restarts: inner.restarts,
            consecutive_crashes: inner.breaker.consecutive_failures(),
            pid: inner.pid,
            last_exit_code: inner.last_exit_code,
            last_transition_at: inner.last_transition_at,
            desired_running: inner.desired,
        }
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.lock().history.iter().cloned().collect()
    }
}
