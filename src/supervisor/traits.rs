use async_trait::async_trait;

use crate::config::WorkerSpec;
use crate::errors::Result;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }

    /// Only a zero exit code counts as a clean exit
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Starts OS processes for worker specs
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>>;
}

/// A running worker process
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit. Must be cancel safe.
    async fn wait(&mut self) -> Result<ExitOutcome>;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&mut self) -> Result<()>;

    /// Force the process to exit
    async fn kill(&mut self) -> Result<()>;
}
