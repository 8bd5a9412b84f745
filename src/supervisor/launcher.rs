use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::traits::{ExitOutcome, ProcessLauncher, WorkerProcess};
use crate::config::WorkerSpec;
use crate::errors::{FleetError, Result};

/// Launches workers as child processes of the supervisor
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

impl TokioLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env("FLEETGATE_WORKER_ID", &spec.id)
            .env("FLEETGATE_AGENT_ID", spec.agent_id())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            error!(worker_id = %spec.id, command = %spec.command, error = %e, "Failed to spawn worker process");
            FleetError::Io(e)
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.id.clone(), "stderr", stderr);
        }

        info!(worker_id = %spec.id, system_pid = ?child.id(), "Worker process spawned");
        Ok(Box::new(ChildProcess { child }))
    }
}

/// Relay worker output into the supervisor log
fn forward_output<R>(worker_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(worker_id = %worker_id, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(worker_id = %worker_id, stream, error = %e, "Worker output closed");
                    break;
                }
            }
        }
    });
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitOutcome> {
        let status = self.child.wait().await?;

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(ExitOutcome::signaled(signal));
            }
        }
        Ok(ExitOutcome {
            code: status.code(),
            signal: None,
        })
    }

    fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // already reaped
            return Ok(());
        };

        #[cfg(unix)]
        {
            let status = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;
            if !status.success() {
                warn!(system_pid = pid, "kill -TERM reported failure");
            }
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill()?;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}
