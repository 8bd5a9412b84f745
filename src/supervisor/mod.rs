//! Operating-system lifecycle of managed workers: tiered start policy,
//! crash restarts with exponential backoff, and a per-worker circuit breaker.

pub mod launcher;
pub mod policy;
pub mod traits;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SupervisorConfig, WorkerSpec};
use crate::coordinator::{AlertSink, HealthProbe};
use crate::errors::{FleetError, Result};
use crate::types::{AgentStatus, Severity, Tier};

pub use launcher::TokioLauncher;
pub use policy::{BackoffPolicy, BreakerState, CircuitBreaker};
pub use traits::{ExitOutcome, ProcessLauncher, WorkerProcess};
pub use worker::{TransitionRecord, WorkerState, WorkerStatus};

use worker::{RunHandle, WorkerSlot};

pub const SUPERVISOR_SOURCE: &str = "supervisor";

#[derive(Debug, Clone)]
struct Settings {
    stop_grace: Duration,
    stable_run: Duration,
    breaker_threshold: u32,
    breaker_open_duration: Duration,
    health_poll_interval: Duration,
    /// Upper bound for acquiring a worker's operation lock or launching it
    op_timeout: Duration,
}

struct Shared {
    slots: BTreeMap<String, Arc<WorkerSlot>>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Option<Arc<dyn HealthProbe>>,
    alerts: Option<Arc<dyn AlertSink>>,
    backoff: BackoffPolicy,
    settings: Settings,
    shutdown: CancellationToken,
}

enum MonitorEvent {
    Exited(Result<ExitOutcome>),
    StopRequested,
    Stable,
    Poll,
}

/// Handle to the worker supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Option<Arc<dyn HealthProbe>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl SupervisorBuilder {
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        let config = self.config;
        let mut slots = BTreeMap::new();
        for spec in &config.workers {
            crate::coordinator::registry::validate_agent_id(spec.agent_id())?;
            let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_open_duration);
            let slot = Arc::new(WorkerSlot::new(spec.clone(), breaker));
            if slots.insert(spec.id.clone(), slot).is_some() {
                return Err(FleetError::invalid(format!("duplicate worker id '{}'", spec.id)));
            }
        }

        let settings = Settings {
            stop_grace: config.stop_grace,
            stable_run: config.stable_run,
            breaker_threshold: config.breaker_threshold,
            breaker_open_duration: config.breaker_open_duration,
            health_poll_interval: config.health_poll_interval,
            op_timeout: config.stop_grace * 2 + Duration::from_secs(5),
        };

        Ok(Supervisor {
            shared: Arc::new(Shared {
                slots,
                launcher: self.launcher,
                probe: self.probe,
                alerts: self.alerts,
                backoff: BackoffPolicy::from_config(&config),
                settings,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Supervisor {
    pub fn builder(config: &SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config: config.clone(),
            launcher: Arc::new(TokioLauncher::new()),
            probe: None,
            alerts: None,
        }
    }

    /// Start core workers and the maintenance and on-demand schedulers
    pub async fn boot(&self) -> Vec<JoinHandle<()>> {
        let shared = &self.shared;
        info!(
            workers = shared.slots.len(),
            breaker_threshold = shared.settings.breaker_threshold,
            "Supervisor booting"
        );

        let mut schedulers = Vec::new();
        for slot in shared.slots.values() {
            match slot.spec.tier {
                Tier::Core => {
                    if let Err(e) = shared.start_worker(slot, "boot").await {
                        error!(worker_id = %slot.id(), error = %e, "Core worker failed to start at boot");
                    }
                }
                Tier::Maintenance => {
                    if let Some(every) = slot.spec.schedule {
                        schedulers.push(shared.spawn_maintenance_schedule(slot.clone(), every));
                    }
                }
                Tier::OnDemand => {
                    if let Some(idle) = slot.spec.idle_timeout {
                        schedulers.push(shared.spawn_idle_reaper(slot.clone(), idle));
                    }
                }
                Tier::Advanced => {}
            }
        }
        schedulers
    }

    pub async fn start(&self, worker_id: &str) -> Result<WorkerStatus> {
        let slot = self.shared.slot(worker_id)?;
        self.shared.start_worker(&slot, "start requested").await?;
        Ok(slot.status())
    }

    pub async fn stop(&self, worker_id: &str) -> Result<WorkerStatus> {
        let slot = self.shared.slot(worker_id)?;
        let _guard = self.shared.acquire(&slot).await?;
        self.shared.stop_locked(&slot, "stop requested").await;
        Ok(slot.status())
    }

    pub async fn restart(&self, worker_id: &str) -> Result<WorkerStatus> {
        let slot = self.shared.slot(worker_id)?;
        let _guard = self.shared.acquire(&slot).await?;
        self.shared.stop_locked(&slot, "restart requested").await;
        self.shared.start_locked(&slot, "restart requested").await?;
        Ok(slot.status())
    }

    /// Force a half-open attempt on a tripped breaker, or start the worker if it is idle
    pub async fn probe(&self, worker_id: &str) -> Result<WorkerStatus> {
        let slot = self.shared.slot(worker_id)?;
        let _guard = self.shared.acquire(&slot).await?;
        {
            let mut inner = slot.lock();
            if inner.breaker.force_half_open() {
                info!(worker_id = %worker_id, "Circuit breaker half-open by operator probe");
            }
        }
        self.shared.start_locked(&slot, "probe requested").await?;
        Ok(slot.status())
    }

    pub fn status(&self, worker_id: &str) -> Result<WorkerStatus> {
        Ok(self.shared.slot(worker_id)?.status())
    }

    pub fn list(&self, tier: Option<Tier>) -> Vec<String> {
        self.shared
            .slots
            .values()
            .filter(|s| tier.is_none_or(|t| s.spec.tier == t))
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn statuses(&self, tier: Option<Tier>) -> Vec<WorkerStatus> {
        self.shared
            .slots
            .values()
            .filter(|s| tier.is_none_or(|t| s.spec.tier == t))
            .map(|s| s.status())
            .collect()
    }

    pub fn history(&self, worker_id: &str) -> Result<Vec<TransitionRecord>> {
        Ok(self.shared.slot(worker_id)?.history())
    }

    /// Stop schedulers and every running worker, each within the grace period
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down workers");
        self.shared.shutdown.cancel();

        let mut stops = JoinSet::new();
        for slot in self.shared.slots.values() {
            let shared = self.shared.clone();
            let slot = slot.clone();
            stops.spawn(async move {
                match shared.acquire(&slot).await {
                    Ok(_guard) => shared.stop_locked(&slot, "supervisor shutdown").await,
                    Err(e) => warn!(worker_id = %slot.id(), error = %e, "Could not stop worker cleanly"),
                }
            });
        }
        while stops.join_next().await.is_some() {}
        info!("Supervisor shutdown complete");
    }
}

impl Shared {
    fn slot(&self, worker_id: &str) -> Result<Arc<WorkerSlot>> {
        self.slots
            .get(worker_id)
            .cloned()
            .ok_or_else(|| FleetError::not_found("worker", worker_id))
    }

    async fn acquire<'a>(&self, slot: &'a WorkerSlot) -> Result<tokio::sync::MutexGuard<'a, ()>> {
        timeout(self.settings.op_timeout, slot.op_lock.lock())
            .await
            .map_err(|_| FleetError::conflict(format!("worker {} is busy", slot.id())))
    }

    async fn start_worker(self: &Arc<Self>, slot: &Arc<WorkerSlot>, reason: &str) -> Result<()> {
        let _guard = self.acquire(slot).await?;
        self.start_locked(slot, reason).await
    }

    /// Launch the worker unless it is already up. Caller holds the op lock.
    async fn start_locked(self: &Arc<Self>, slot: &Arc<WorkerSlot>, reason: &str) -> Result<()> {
        let generation = {
            let mut inner = slot.lock();
            inner.desired = true;
            inner.last_request = tokio::time::Instant::now();

            match inner.state {
                WorkerState::Running | WorkerState::Starting => return Ok(()),
                WorkerState::Stopping => {
                    return Err(FleetError::conflict(format!("worker {} is stopping", slot.id())))
                }
                WorkerState::Stopped | WorkerState::Crashed => {}
            }

            if !inner.breaker.allows_start() {
                if inner.breaker.try_half_open(Instant::now()) {
                    info!(worker_id = %slot.id(), "Circuit breaker half-open, attempting probe start");
                } else {
                    return Err(FleetError::conflict(format!(
                        "circuit breaker open for worker {}",
                        slot.id()
                    )));
                }
            }

            if inner.state == WorkerState::Crashed {
                inner.restarts += 1;
            }
            inner.transition(slot.id(), WorkerState::Starting, reason);
            inner.generation += 1;
            inner.generation
        };

        let spawned = match timeout(self.settings.op_timeout, self.launcher.spawn(&slot.spec)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::transport(format!("timed out launching {}", slot.id()))),
        };

        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.on_crash(slot, generation, None, &format!("launch failed: {e}"));
                return Err(e);
            }
        };

        let stop = self.shutdown.child_token();
        {
            let mut inner = slot.lock();
            inner.pid = process.pid();
            inner.transition(slot.id(), WorkerState::Running, "process started");
            let task = tokio::spawn(monitor(
                self.clone(),
                slot.clone(),
                generation,
                process,
                stop.clone(),
            ));
            inner.run = Some(RunHandle { stop, task });
        }
        Ok(())
    }

    /// Stop the worker and clear its desired flag. Caller holds the op lock.
    async fn stop_locked(&self, slot: &Arc<WorkerSlot>, reason: &str) {
        let run = {
            let mut inner = slot.lock();
            inner.desired = false;
            inner.run.take()
        };

        if let Some(run) = run {
            run.stop.cancel();
            let bound = self.settings.stop_grace + Duration::from_secs(5);
            if timeout(bound, run.task).await.is_err() {
                error!(worker_id = %slot.id(), "Worker monitor did not finish within the stop bound");
            }
        }

        let mut inner = slot.lock();
        if inner.state == WorkerState::Crashed {
            inner.transition(slot.id(), WorkerState::Stopped, reason);
        }
    }

    /// Record a crash, trip the breaker if needed, and schedule a restart
    fn on_crash(self: &Arc<Self>, slot: &Arc<WorkerSlot>, generation: u64, exit: Option<ExitOutcome>, reason: &str) {
        let (opened, restart_in, crashes) = {
            let mut inner = slot.lock();
            if inner.generation != generation {
                return;
            }
            inner.run = None;
            inner.pid = None;
            inner.last_exit_code = exit.and_then(|e| e.code);
            inner.transition(slot.id(), WorkerState::Crashed, reason);

            let opened = inner.breaker.record_failure(Instant::now());
            let crashes = inner.breaker.consecutive_failures();
            let restart_in = (inner.desired && inner.breaker.allows_start())
                .then(|| self.backoff.delay_for_attempt(crashes));
            (opened, restart_in, crashes)
        };

        if opened {
            warn!(
                worker_id = %slot.id(),
                consecutive_crashes = crashes,
                reopen_after_secs = self.settings.breaker_open_duration.as_secs(),
                "Circuit breaker opened, restarts suspended"
            );
            self.publish(
                Severity::Critical,
                format!(
                    "worker {} crashed {} times in a row; circuit breaker open",
                    slot.id(),
                    crashes
                ),
            );
            self.schedule_half_open(slot.clone(), generation);
        }

        if let Some(delay) = restart_in {
            info!(worker_id = %slot.id(), delay_ms = delay.as_millis() as u64, attempt = crashes, "Restart scheduled");
            self.schedule_restart(slot.clone(), generation, delay);
        }
    }

    fn on_clean_exit(self: &Arc<Self>, slot: &Arc<WorkerSlot>, generation: u64) {
        {
            let mut inner = slot.lock();
            if inner.generation != generation {
                return;
            }
            inner.run = None;
            inner.pid = None;
            inner.last_exit_code = Some(0);
            inner.desired = false;
            inner.transition(slot.id(), WorkerState::Stopped, "exited cleanly");
        }

        if let Some(probe) = self.probe.clone() {
            let agent_id = slot.spec.agent_id().to_string();
            let bound = self.settings.op_timeout;
            tokio::spawn(async move {
                match timeout(bound, probe.deregister(&agent_id)).await {
                    Ok(Ok(())) => debug!(agent_id = %agent_id, "Agent deregistered after clean exit"),
                    Ok(Err(FleetError::NotFound { .. })) => {}
                    Ok(Err(e)) => warn!(agent_id = %agent_id, error = %e, "Failed to deregister agent"),
                    Err(_) => warn!(agent_id = %agent_id, "Timed out deregistering agent"),
                }
            });
        }
    }

    fn on_stable(&self, slot: &WorkerSlot, generation: u64) {
        let mut inner = slot.lock();
        if inner.generation != generation {
            return;
        }
        if inner.breaker.record_success() {
            info!(worker_id = %slot.id(), "Circuit breaker closed after stable run");
        } else {
            debug!(worker_id = %slot.id(), "Stable run, backoff reset");
        }
    }

    async fn graceful_stop(&self, slot: &WorkerSlot, generation: u64, mut process: Box<dyn WorkerProcess>) {
        {
            let mut inner = slot.lock();
            if inner.generation == generation {
                inner.transition(slot.id(), WorkerState::Stopping, "terminating");
            }
        }

        if let Err(e) = process.terminate() {
            warn!(worker_id = %slot.id(), error = %e, "SIGTERM failed");
        }
        let exit = match timeout(self.settings.stop_grace, process.wait()).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!(worker_id = %slot.id(), error = %e, "Waiting for worker exit failed");
                None
            }
            Err(_) => {
                warn!(
                    worker_id = %slot.id(),
                    grace_secs = self.settings.stop_grace.as_secs(),
                    "Worker ignored SIGTERM, killing"
                );
                if let Err(e) = timeout(Duration::from_secs(5), process.kill()).await {
                    error!(worker_id = %slot.id(), error = %e, "Kill did not complete");
                }
                None
            }
        };

        let mut inner = slot.lock();
        if inner.generation == generation {
            inner.pid = None;
            inner.last_exit_code = exit.and_then(|e| e.code);
            inner.transition(slot.id(), WorkerState::Stopped, "stopped");
        }
    }

    /// Registered status of the worker's agent; `None` when unknown or unreachable
    async fn agent_status(&self, slot: &WorkerSlot) -> Option<AgentStatus> {
        let probe = self.probe.as_ref()?;
        match timeout(self.settings.op_timeout, probe.agent_status(slot.spec.agent_id())).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(worker_id = %slot.id(), error = %e, "Health probe failed");
                None
            }
            Err(_) => {
                warn!(worker_id = %slot.id(), "Health probe timed out");
                None
            }
        }
    }

    fn publish(&self, severity: Severity, message: String) {
        let Some(alerts) = self.alerts.clone() else {
            return;
        };
        let bound = self.settings.op_timeout;
        tokio::spawn(async move {
            match timeout(bound, alerts.publish_alert(SUPERVISOR_SOURCE, severity, &message)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to publish supervisor alert"),
                Err(_) => warn!("Timed out publishing supervisor alert"),
            }
        });
    }

    fn schedule_restart(self: &Arc<Self>, slot: Arc<WorkerSlot>, generation: u64, delay: Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Ok(_guard) = shared.acquire(&slot).await else {
                warn!(worker_id = %slot.id(), "Skipped restart, worker busy");
                return;
            };
            {
                let inner = slot.lock();
                if inner.generation != generation || !inner.desired || inner.state != WorkerState::Crashed {
                    return;
                }
            }
            if let Err(e) = shared.start_locked(&slot, "restart after backoff").await {
                warn!(worker_id = %slot.id(), error = %e, "Restart failed");
            }
        });
    }

    fn schedule_half_open(self: &Arc<Self>, slot: Arc<WorkerSlot>, generation: u64) {
        let shared = self.clone();
        let wait = self.settings.breaker_open_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            let Ok(_guard) = shared.acquire(&slot).await else {
                return;
            };
            {
                let mut inner = slot.lock();
                // a manual probe or stop got there first
                if inner.generation != generation || !inner.desired {
                    return;
                }
                if inner.breaker.force_half_open() {
                    info!(worker_id = %slot.id(), "Circuit breaker half-open after open duration");
                }
            }
            if let Err(e) = shared.start_locked(&slot, "half-open probe").await {
                warn!(worker_id = %slot.id(), error = %e, "Half-open probe failed to start");
            }
        });
    }

    fn spawn_maintenance_schedule(self: &Arc<Self>, slot: Arc<WorkerSlot>, every: Duration) -> JoinHandle<()> {
        let shared = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let idle = slot.lock().state == WorkerState::Stopped;
                        if !idle {
                            debug!(worker_id = %slot.id(), "Maintenance run still active, skipping tick");
                            continue;
                        }
                        if let Err(e) = shared.start_worker(&slot, "scheduled run").await {
                            warn!(worker_id = %slot.id(), error = %e, "Scheduled run did not start");
                        }
                    }
                }
            }
        })
    }

    fn spawn_idle_reaper(self: &Arc<Self>, slot: Arc<WorkerSlot>, idle: Duration) -> JoinHandle<()> {
        let shared = self.clone();
        let check_every = (idle / 4).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = {
                            let inner = slot.lock();
                            inner.state == WorkerState::Running && inner.last_request.elapsed() >= idle
                        };
                        if !expired {
                            continue;
                        }
                        match shared.acquire(&slot).await {
                            Ok(_guard) => {
                                info!(worker_id = %slot.id(), idle_secs = idle.as_secs(), "Stopping idle on-demand worker");
                                shared.stop_locked(&slot, "idle timeout").await;
                            }
                            Err(e) => warn!(worker_id = %slot.id(), error = %e, "Idle reap skipped"),
                        }
                    }
                }
            }
        })
    }
}

/// Watch one run of a worker until it exits or is told to stop
async fn monitor(
    shared: Arc<Shared>,
    slot: Arc<WorkerSlot>,
    generation: u64,
    mut process: Box<dyn WorkerProcess>,
    stop: CancellationToken,
) {
    let stable = tokio::time::sleep(shared.settings.stable_run);
    tokio::pin!(stable);
    let mut stable_reached = false;

    let poll_enabled = shared.probe.is_some() && !shared.settings.health_poll_interval.is_zero();
    let poll_every = shared.settings.health_poll_interval.max(Duration::from_millis(10));
    let mut poll = tokio::time::interval_at(tokio::time::Instant::now() + poll_every, poll_every);
    // An unresponsive status may be left over from the previous run until this one checks in
    let mut checked_in = false;

    loop {
        let event = tokio::select! {
            exit = process.wait() => MonitorEvent::Exited(exit),
            _ = stop.cancelled() => MonitorEvent::StopRequested,
            _ = &mut stable, if !stable_reached => MonitorEvent::Stable,
            _ = poll.tick(), if poll_enabled => MonitorEvent::Poll,
        };

        match event {
            MonitorEvent::Exited(Ok(outcome)) if outcome.is_clean() => {
                shared.on_clean_exit(&slot, generation);
                return;
            }
            MonitorEvent::Exited(Ok(outcome)) => {
                let reason = match (outcome.code, outcome.signal) {
                    (Some(code), _) => format!("exited with status {code}"),
                    (None, Some(signal)) => format!("killed by signal {signal}"),
                    (None, None) => "exited abnormally".to_string(),
                };
                shared.on_crash(&slot, generation, Some(outcome), &reason);
                return;
            }
            MonitorEvent::Exited(Err(e)) => {
                shared.on_crash(&slot, generation, None, &format!("wait failed: {e}"));
                return;
            }
            MonitorEvent::StopRequested => {
                shared.graceful_stop(&slot, generation, process).await;
                return;
            }
            MonitorEvent::Stable => {
                stable_reached = true;
                shared.on_stable(&slot, generation);
            }
            MonitorEvent::Poll => match shared.agent_status(&slot).await {
                Some(AgentStatus::Unresponsive) if checked_in || stable_reached => {
                    warn!(worker_id = %slot.id(), "Coordinator reports agent unresponsive, killing worker");
                    if timeout(Duration::from_secs(5), process.kill()).await.is_err() {
                        error!(worker_id = %slot.id(), "Kill did not complete");
                    }
                    shared.on_crash(&slot, generation, None, "heartbeat timeout");
                    return;
                }
                Some(AgentStatus::Unresponsive) => {
                    debug!(worker_id = %slot.id(), generation, "Unresponsive status predates this run, waiting for check-in");
                }
                Some(status) if status.is_live() => checked_in = true,
                _ => {}
            },
        }
    }
}
