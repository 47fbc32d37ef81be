//! How a [`WorkerSpec`] becomes an OS command.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use flowgate_pipeline::{WorkerSpec, WORKER_SPEC_ENV};
use flowgate_types::{FlowgateError, Result};

/// Builds the command that runs one worker.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, spec: &WorkerSpec) -> Result<Command>;
}

/// Launches workers by re-executing a binary with a `worker` subcommand.
///
/// The spec travels as JSON in [`WORKER_SPEC_ENV`]; stdout and stderr are
/// inherited so worker logs land in the host's output.
#[derive(Debug, Clone)]
pub struct ExecutableLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ExecutableLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The running executable, invoked as `<exe> worker`.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| FlowgateError::Config(format!("cannot locate own executable: {e}")))?;
        Ok(Self::new(program, vec!["worker".to_string()]))
    }
}

impl WorkerLauncher for ExecutableLauncher {
    fn command(&self, spec: &WorkerSpec) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_SPEC_ENV, spec.to_json()?)
            .stdin(Stdio::null());
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_pipeline::ProducerSpec;

    #[test]
    fn command_carries_spec_in_env() {
        let launcher = ExecutableLauncher::new("/usr/bin/flowgate", vec!["worker".into()]);
        let spec = WorkerSpec::producer(
            9,
            0,
            ProducerSpec {
                broker: "b1".into(),
                topic: "x".into(),
                n_channels: 1,
                frequency_hz: 1.0,
                max_records: None,
            },
        );
        let cmd = launcher.command(&spec).unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/bin/flowgate");
        assert_eq!(std_cmd.get_args().collect::<Vec<_>>(), vec!["worker"]);

        let env = std_cmd
            .get_envs()
            .find(|(k, _)| *k == WORKER_SPEC_ENV)
            .and_then(|(_, v)| v)
            .unwrap();
        let back = WorkerSpec::from_json(env.to_str().unwrap()).unwrap();
        assert_eq!(back, spec);
    }
}
