use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Coordinator;

/// What one reclaim pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub marked_unresponsive: Vec<String>,
    pub requeued: Vec<String>,
    pub abandoned: Vec<String>,
    pub pruned_alerts: usize,
    pub pruned_tasks: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_unresponsive.is_empty()
            && self.requeued.is_empty()
            && self.abandoned.is_empty()
            && self.pruned_alerts == 0
            && self.pruned_tasks == 0
    }
}

/// Run the reclaim sweep every `every` until cancelled
pub fn spawn_sweeper(
    coordinator: Arc<Coordinator>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;
        info!(interval_secs = every.as_secs(), "Reclaim sweep scheduled");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reclaim sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = coordinator.sweep().await;
                    debug!(?report, "Sweep tick");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoordinatorConfig;
    use crate::types::{AgentStatus, Tier};
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_schedule_and_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = Arc::new(Coordinator::with_clock(
            &CoordinatorConfig::default(),
            clock.clone(),
        ));
        coordinator
            .register("A1", Tier::Core, vec!["build".to_string()])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(coordinator.clone(), Duration::from_secs(180), cancel.clone());

        clock.advance(chrono::Duration::seconds(181));
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(
            coordinator.agent("A1").await.unwrap().status,
            AgentStatus::Unresponsive
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
