use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{FleetError, Result};
use crate::types::{Task, TaskState};

/// Task store with a FIFO index over queued tasks.
///
/// The index key is `(enqueued_at, id)`: a fresh task is indexed at its creation
/// time, a reclaimed task at the time it was reclaimed, so retries go to the back.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<String, Task>,
    ready: BTreeSet<(DateTime<Utc>, String)>,
}

/// Held tasks taken back from non-live agents in one pass
#[derive(Debug, Default, Clone)]
pub struct ReclaimOutcome {
    pub requeued: Vec<String>,
    /// Abandoned tasks paired with the agent that last held them
    pub abandoned: Vec<(Task, String)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        task_type: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if task_type.trim().is_empty() {
            return Err(FleetError::invalid("task type must not be empty"));
        }

        let task = Task {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            payload,
            state: TaskState::Queued,
            claimed_by: None,
            created_at: now,
            completed_at: None,
            result: None,
            attempts: 0,
        };
        self.ready.insert((now, task.id.clone()));
        self.tasks.insert(task.id.clone(), task.clone());
        debug!(task_id = %task.id, task_type = %task.task_type, "Task enqueued");
        Ok(task)
    }

    /// Take the oldest queued task whose type is accepted.
    ///
    /// Lookup, index removal and state change happen under one `&mut self`
    /// borrow, so two claims can never both win the same task.
    pub fn claim(&mut self, agent_id: &str, accepted_types: &[String]) -> Option<Task> {
        let key = self
            .ready
            .iter()
            .find(|(_, id)| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| accepted_types.iter().any(|a| *a == t.task_type))
            })
            .cloned()?;

        self.ready.remove(&key);
        let task = self.tasks.get_mut(&key.1)?;
        task.state = TaskState::Claimed;
        task.claimed_by = Some(agent_id.to_string());
        info!(task_id = %task.id, agent_id = %agent_id, task_type = %task.task_type, "Task claimed");
        Some(task.clone())
    }

    pub fn start(&mut self, task_id: &str, agent_id: &str) -> Result<Task> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| FleetError::not_found("task", task_id))?;

        if task.claimed_by.as_deref() != Some(agent_id) || !task.state.is_held() {
            return Err(FleetError::conflict(format!(
                "task {task_id} is {} and not held by {agent_id}",
                task.state
            )));
        }
        task.state = TaskState::Running;
        Ok(task.clone())
    }

    /// Record the outcome. Only the current holder may complete a task.
    pub fn complete(
        &mut self,
        task_id: &str,
        agent_id: &str,
        result: serde_json::Value,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| FleetError::not_found("task", task_id))?;

        if task.claimed_by.as_deref() != Some(agent_id) || !task.state.is_held() {
            warn!(
                task_id = %task_id,
                agent_id = %agent_id,
                state = %task.state,
                holder = ?task.claimed_by,
                "Rejected completion from non-holder"
            );
            return Err(FleetError::conflict(format!(
                "task {task_id} is not currently claimed by {agent_id}"
            )));
        }

        task.state = if success {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        task.completed_at = Some(now);
        task.result = Some(result);
        info!(task_id = %task_id, agent_id = %agent_id, state = %task.state, "Task completed");
        Ok(task.clone())
    }

    /// Return held tasks of non-live agents to the queue, abandoning those out of retries
    pub fn reclaim<F>(&mut self, is_live: F, max_retries: u32, now: DateTime<Utc>) -> ReclaimOutcome
    where
        F: Fn(&str) -> bool,
    {
        let mut orphaned: Vec<&mut Task> = self
            .tasks
            .values_mut()
            .filter(|t| {
                t.state.is_held() && !t.claimed_by.as_deref().is_some_and(|agent| is_live(agent))
            })
            .collect();
        orphaned.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut outcome = ReclaimOutcome::default();
        for task in orphaned {
            let holder = task.claimed_by.take().unwrap_or_default();
            task.attempts += 1;

            if task.attempts >= max_retries {
                task.state = TaskState::Abandoned;
                task.completed_at = Some(now);
                warn!(task_id = %task.id, agent_id = %holder, attempts = task.attempts, "Task abandoned");
                outcome.abandoned.push((task.clone(), holder));
            } else {
                task.state = TaskState::Queued;
                self.ready.insert((now, task.id.clone()));
                info!(task_id = %task.id, agent_id = %holder, attempts = task.attempts, "Task reclaimed and requeued");
                outcome.requeued.push(task.id.clone());
            }
        }
        outcome
    }

    /// Drop finished tasks completed before `cutoff`
    pub fn prune_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !(t.state.is_terminal() && t.completed_at.is_some_and(|done| done < cutoff))
        });
        let pruned = before - self.tasks.len();
        if pruned > 0 {
            debug!(pruned, %cutoff, "Pruned finished tasks");
        }
        pruned
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Tasks ordered by creation, optionally filtered by state
    pub fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| state.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        tasks
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            match task.state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Claimed => counts.claimed += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Abandoned => counts.abandoned += 1,
            }
        }
        counts
    }
}
