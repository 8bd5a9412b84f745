//! Supervisor lifecycle with a scripted launcher and paused tokio time

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetgate::config::{CoordinatorConfig, SupervisorConfig, WorkerSpec};
use fleetgate::coordinator::{AlertSink, Coordinator, HealthProbe};
use fleetgate::supervisor::{
    BreakerState, ExitOutcome, ProcessLauncher, Supervisor, WorkerProcess, WorkerState, WorkerStatus,
};
use fleetgate::{AgentStatus, Alert, Result, Severity, Tier};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
enum Script {
    /// Exit with `code` this long after launch
    ExitAfter(Duration, i32),
    /// Run until terminated
    Forever,
    /// Ignore SIGTERM; only a kill ends it
    IgnoreTerm,
}

#[derive(Default)]
struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    spawned_at: Mutex<Vec<Instant>>,
    killed: Arc<AtomicBool>,
}

impl ScriptedLauncher {
    fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }

    fn spawns(&self) -> Vec<Instant> {
        self.spawned_at.lock().unwrap().clone()
    }
}

struct FakeProcess {
    script: Script,
    deadline: Instant,
    terminated: bool,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn spawn(&self, _spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>> {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script::Forever);
        let now = Instant::now();
        self.spawned_at.lock().unwrap().push(now);
        let deadline = match &script {
            Script::ExitAfter(after, _) => now + *after,
            _ => now,
        };
        Ok(Box::new(FakeProcess {
            script,
            deadline,
            terminated: false,
            killed: self.killed.clone(),
        }))
    }
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> Result<ExitOutcome> {
        match self.script {
            Script::ExitAfter(_, code) => {
                tokio::time::sleep_until(self.deadline).await;
                Ok(ExitOutcome::code(code))
            }
            Script::Forever if self.terminated => Ok(ExitOutcome::signaled(15)),
            _ if self.killed.load(Ordering::SeqCst) => Ok(ExitOutcome::signaled(9)),
            _ => std::future::pending().await,
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.terminated = true;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<(String, Severity, String)>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn publish_alert(&self, source: &str, severity: Severity, message: &str) -> Result<Alert> {
        self.alerts
            .lock()
            .unwrap()
            .push((source.to_string(), severity, message.to_string()));
        let now: DateTime<Utc> = Utc::now();
        Ok(Alert {
            id: "recorded".to_string(),
            source: source.to_string(),
            severity,
            message: message.to_string(),
            timestamp: now,
            fingerprint: Alert::fingerprint_for(source, message),
            occurrences: 1,
        })
    }
}

fn config(workers: Vec<WorkerSpec>) -> SupervisorConfig {
    SupervisorConfig {
        stop_grace: Duration::from_secs(10),
        backoff_initial: Duration::from_secs(1),
        backoff_max: Duration::from_secs(60),
        backoff_multiplier: 2,
        stable_run: Duration::from_secs(300),
        breaker_threshold: 3,
        breaker_open_duration: Duration::from_secs(300),
        health_poll_interval: Duration::from_secs(30),
        workers,
    }
}

async fn wait_until<F>(supervisor: &Supervisor, id: &str, check: F) -> WorkerStatus
where
    F: Fn(&WorkerStatus) -> bool,
{
    for _ in 0..10_000 {
        let status = supervisor.status(id).unwrap();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never reached for worker {id}");
}

#[tokio::test(start_paused = true)]
async fn test_crash_loop_backs_off_opens_breaker_and_recovers() {
    let crash = Script::ExitAfter(Duration::from_millis(100), 1);
    let launcher = ScriptedLauncher::new([crash.clone(), crash.clone(), crash, Script::Forever]);
    let sink = Arc::new(RecordingSink::default());
    let supervisor = Supervisor::builder(&config(vec![WorkerSpec::new("builder", Tier::Core, "build-agent")]))
        .with_launcher(launcher.clone())
        .with_alert_sink(sink.clone())
        .build()
        .unwrap();

    supervisor.boot().await;
    let tripped = wait_until(&supervisor, "builder", |s| s.breaker == BreakerState::Open).await;
    assert_eq!(tripped.state, WorkerState::Crashed);
    assert_eq!(tripped.consecutive_crashes, 3);
    assert_eq!(tripped.last_exit_code, Some(1));

    let spawns = launcher.spawns();
    assert_eq!(spawns.len(), 3);
    assert!(spawns[1] - spawns[0] >= Duration::from_millis(1100));
    assert!(spawns[2] - spawns[1] >= Duration::from_millis(2100));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let alerts = sink.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, "supervisor");
    assert_eq!(alerts[0].1, Severity::Critical);

    // After the open duration one probe run starts; surviving the stable period closes the breaker
    let probing = wait_until(&supervisor, "builder", |s| s.state == WorkerState::Running).await;
    assert_eq!(probing.breaker, BreakerState::HalfOpen);
    assert!(launcher.spawns()[3] - spawns[2] >= Duration::from_secs(300));

    let healed = wait_until(&supervisor, "builder", |s| s.breaker == BreakerState::Closed).await;
    assert_eq!(healed.state, WorkerState::Running);
    assert_eq!(healed.consecutive_crashes, 0);

    supervisor.shutdown().await;
    assert_eq!(supervisor.status("builder").unwrap().state, WorkerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_manual_restart_refused_while_breaker_open_but_probe_allowed() {
    let crash = Script::ExitAfter(Duration::from_millis(10), 2);
    let launcher = ScriptedLauncher::new([crash.clone(), crash.clone(), crash, Script::Forever]);
    let supervisor = Supervisor::builder(&config(vec![WorkerSpec::new("scanner", Tier::Advanced, "scan")]))
        .with_launcher(launcher.clone())
        .build()
        .unwrap();

    supervisor.start("scanner").await.unwrap();
    wait_until(&supervisor, "scanner", |s| s.breaker == BreakerState::Open).await;

    assert!(supervisor.start("scanner").await.is_err());
    let probed = supervisor.probe("scanner").await.unwrap();
    assert_eq!(probed.state, WorkerState::Running);
    assert_eq!(probed.breaker, BreakerState::HalfOpen);
    assert_eq!(launcher.spawns().len(), 4);

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_stops_worker_and_deregisters_agent() {
    let coordinator = Arc::new(Coordinator::new(&CoordinatorConfig::default()));
    coordinator.register("nightly-agent", Tier::Maintenance, Vec::<String>::new()).await.unwrap();

    let launcher = ScriptedLauncher::new([Script::ExitAfter(Duration::from_secs(1), 0)]);
    let spec = WorkerSpec::new("nightly", Tier::Advanced, "nightly-job");
    let spec = WorkerSpec {
        agent_id: Some("nightly-agent".to_string()),
        ..spec
    };
    let supervisor = Supervisor::builder(&config(vec![spec]))
        .with_launcher(launcher)
        .with_health_probe(coordinator.clone() as Arc<dyn HealthProbe>)
        .build()
        .unwrap();

    supervisor.start("nightly").await.unwrap();
    let stopped = wait_until(&supervisor, "nightly", |s| s.state == WorkerState::Stopped).await;
    assert_eq!(stopped.last_exit_code, Some(0));
    assert!(!stopped.desired_running);
    assert_eq!(stopped.restarts, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let agent = coordinator.agent("nightly-agent").await.unwrap();
    assert_eq!(agent.status, AgentStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_escalates_to_kill_after_grace() {
    let launcher = ScriptedLauncher::new([Script::IgnoreTerm]);
    let supervisor = Supervisor::builder(&config(vec![WorkerSpec::new("stubborn", Tier::Advanced, "hang")]))
        .with_launcher(launcher.clone())
        .build()
        .unwrap();

    supervisor.start("stubborn").await.unwrap();
    let begun = Instant::now();
    let stopped = supervisor.stop("stubborn").await.unwrap();

    assert_eq!(stopped.state, WorkerState::Stopped);
    assert!(launcher.killed.load(Ordering::SeqCst));
    assert!(begun.elapsed() >= Duration::from_secs(10));

    let history = supervisor.history("stubborn").unwrap();
    let states: Vec<WorkerState> = history.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        [WorkerState::Starting, WorkerState::Running, WorkerState::Stopping, WorkerState::Stopped]
    );
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_worker_runs_on_schedule() {
    let run = Script::ExitAfter(Duration::from_secs(5), 0);
    let launcher = ScriptedLauncher::new([run.clone(), run]);
    let spec = WorkerSpec::new("compactor", Tier::Maintenance, "compact").with_schedule(Duration::from_secs(3600));
    let supervisor = Supervisor::builder(&config(vec![spec]))
        .with_launcher(launcher.clone())
        .build()
        .unwrap();

    let schedulers = supervisor.boot().await;
    wait_until(&supervisor, "compactor", |s| s.state == WorkerState::Stopped && s.last_exit_code == Some(0)).await;
    assert_eq!(launcher.spawns().len(), 1);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    wait_until(&supervisor, "compactor", |_| launcher.spawns().len() == 2).await;

    supervisor.shutdown().await;
    for scheduler in schedulers {
        scheduler.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_on_demand_worker_is_stopped() {
    let launcher = ScriptedLauncher::new([Script::Forever]);
    let spec = WorkerSpec::new("reviewer", Tier::OnDemand, "review").with_idle_timeout(Duration::from_secs(120));
    let supervisor = Supervisor::builder(&config(vec![spec]))
        .with_launcher(launcher.clone())
        .build()
        .unwrap();

    let schedulers = supervisor.boot().await;
    assert_eq!(supervisor.status("reviewer").unwrap().state, WorkerState::Stopped);

    let started = supervisor.start("reviewer").await.unwrap();
    assert_eq!(started.state, WorkerState::Running);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(supervisor.status("reviewer").unwrap().state, WorkerState::Running);

    tokio::time::sleep(Duration::from_secs(90)).await;
    let reaped = wait_until(&supervisor, "reviewer", |s| s.state == WorkerState::Stopped).await;
    assert!(!reaped.desired_running);
    assert_eq!(reaped.restarts, 0);
    assert_eq!(launcher.spawns().len(), 1);

    supervisor.shutdown().await;
    for scheduler in schedulers {
        scheduler.await.unwrap();
    }
}

#[tokio::test]
async fn test_list_filters_by_tier() {
    let supervisor = Supervisor::builder(&config(vec![
        WorkerSpec::new("api", Tier::Core, "api"),
        WorkerSpec::new("nightly", Tier::Maintenance, "nightly").with_schedule(Duration::from_secs(60)),
        WorkerSpec::new("review", Tier::OnDemand, "review"),
    ]))
    .with_launcher(ScriptedLauncher::new([]))
    .build()
    .unwrap();

    assert_eq!(supervisor.list(None), ["api", "nightly", "review"]);
    assert_eq!(supervisor.list(Some(Tier::OnDemand)), ["review"]);
    assert!(supervisor.list(Some(Tier::Advanced)).is_empty());
}
