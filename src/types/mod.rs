//! Shared data model. JSON is the only wire and file format.

pub mod agent;
pub mod alert;
pub mod backup;
pub mod signals;
pub mod task;

pub use agent::{AgentRecord, AgentStatus, Tier};
pub use alert::{Alert, Severity};
pub use backup::BackupMarker;
pub use signals::{CheckResult, OverallStatus, ReviewStatus, ReviewVerdict, ValidationReport};
pub use task::{Task, TaskState};
