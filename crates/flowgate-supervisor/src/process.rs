//! Supervised worker processes.
//!
//! Every worker is spawned as the leader of its own process group, so that
//! terminating it also reaches any helpers it started. Signals are always sent
//! to the whole group.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};

use flowgate_types::{FlowgateError, Result};

/// One child process owned by the supervisor, together with its process group.
#[derive(Debug)]
pub struct SupervisedProcess {
    label: String,
    child: Child,
    pid: u32,
    exit: Option<ExitStatus>,
    stop_requested: bool,
}

impl SupervisedProcess {
    /// Spawn `command` in a new process group.
    pub fn spawn(label: impl Into<String>, mut command: Command) -> Result<Self> {
        let label = label.into();
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| FlowgateError::Spawn(format!("{label}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| FlowgateError::Spawn(format!("{label}: exited before it could be tracked")))?;
        tracing::debug!(%label, pid, "Process spawned");

        Ok(Self {
            label,
            child,
            pid,
            exit: None,
            stop_requested: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Exit status if the process has exited, reaping it without blocking.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => tracing::warn!(label = %self.label, error = %e, "Failed to poll process"),
            }
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Exit status of a process that died without being asked to stop.
    pub fn exited_unexpectedly(&mut self) -> Option<ExitStatus> {
        if self.stop_requested {
            return None;
        }
        self.poll()
    }

    /// Whether the process exited with a failure it was not asked for.
    pub fn failed(&mut self) -> bool {
        self.exited_unexpectedly().is_some_and(|status| !status.success())
    }

    fn signal_group(&self, signal: i32) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: kill(2) with a negative pid signals the process group.
            let rc = unsafe { libc::kill(-(self.pid as i32), signal) };
            rc == 0
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            false
        }
    }

    /// A process that already died on its own keeps its unexpected exit.
    fn request_stop(&mut self) {
        if self.poll().is_none() {
            self.stop_requested = true;
        }
    }

    /// Ask the whole process group to exit.
    pub fn terminate(&mut self) {
        self.request_stop();
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    /// Forcefully kill the whole process group.
    pub fn kill(&mut self) {
        self.request_stop();
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGKILL);
        }
        let _ = self.child.start_kill();
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Terminate, wait up to `grace`, then kill. A group that survives the
    /// kill is logged as leaked.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.terminate();
        let graceful = tokio::time::timeout(grace, self.wait()).await;
        let status = match graceful {
            Ok(Ok(status)) => Some(status),
            _ => {
                tracing::warn!(label = %self.label, pid = self.pid, "Grace period elapsed, killing process group");
                self.kill();
                match tokio::time::timeout(grace, self.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => None,
                }
            }
        };

        // The leader may be gone while other group members linger.
        #[cfg(unix)]
        {
            if self.signal_group(libc::SIGKILL) {
                tracing::warn!(label = %self.label, pgid = self.pid, "Process group members outlived their leader and were killed");
            }
            if self.signal_group(0) {
                tracing::error!(label = %self.label, pgid = self.pid, "Process group leaked after kill");
            }
        }

        tracing::debug!(label = %self.label, pid = self.pid, ?status, "Process stopped");
        status
    }
}
