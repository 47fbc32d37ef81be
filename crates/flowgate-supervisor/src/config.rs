//! Supervisor configuration, read from an optional TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowgate_types::{duration_serde, FlowgateError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Timeout for a single broker reachability probe.
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub poll_min: Duration,
    #[serde(with = "duration_serde")]
    pub poll_max: Duration,
    /// Window between SIGTERM and SIGKILL.
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,
    /// Pause between stopping producers and stopping workers at completion.
    #[serde(with = "duration_serde")]
    pub drain_delay: Duration,
    #[serde(with = "duration_serde")]
    pub step_budget: Duration,
    pub event_endpoint: Option<String>,
    pub event_queue_capacity: usize,
    pub broadcast_capacity: usize,
    pub emit_stream_events: bool,
    pub consumer_group_prefix: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            poll_min: Duration::from_secs(1),
            poll_max: Duration::from_secs(10),
            grace_period: Duration::from_secs(3),
            drain_delay: Duration::from_secs(5),
            step_budget: Duration::from_millis(250),
            event_endpoint: None,
            event_queue_capacity: 1024,
            broadcast_capacity: 256,
            emit_stream_events: true,
            consumer_group_prefix: "flowgate".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| FlowgateError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FlowgateError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    /// Reject settings the monitor cannot run with. Call again after
    /// applying overrides from outside the file.
    pub fn check(&self) -> Result<()> {
        if self.poll_min > self.poll_max {
            return Err(FlowgateError::Config(format!(
                "poll_min ({:?}) exceeds poll_max ({:?})",
                self.poll_min, self.poll_max
            )));
        }
        if self.poll_min.is_zero() {
            return Err(FlowgateError::Config("poll_min must be positive".into()));
        }
        Ok(())
    }

    /// Monitoring interval for a run: a tenth of its runtime, clamped.
    pub fn poll_interval(&self, runtime: Option<Duration>) -> Duration {
        match runtime {
            Some(runtime) => (runtime / 10).clamp(self.poll_min, self.poll_max),
            None => self.poll_max,
        }
    }
}
