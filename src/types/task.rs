use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Abandoned
        )
    }

    /// Held by an agent
    pub fn is_held(self) -> bool {
        matches!(self, TaskState::Claimed | TaskState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Claimed => "claimed",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskState::Queued),
            "claimed" => Ok(TaskState::Claimed),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "abandoned" => Ok(TaskState::Abandoned),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

/// One unit of dispatched work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Times the task was reclaimed from a non-live holder
    #[serde(default)]
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Abandoned.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(TaskState::Running.is_held());
        assert!(!TaskState::Queued.is_held());
    }

    #[test]
    fn test_task_type_field_is_named_type_on_the_wire() {
        let task = Task {
            id: "t1".into(),
            task_type: "build".into(),
            payload: serde_json::json!({"target": "all"}),
            state: TaskState::Queued,
            claimed_by: None,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            attempts: 0,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "build");
        assert_eq!(value["state"], "queued");
        assert!(value["claimedBy"].is_null());
    }
}
