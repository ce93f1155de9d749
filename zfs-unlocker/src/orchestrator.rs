//! Runs one session machine per target group and ties their lifetimes to a
//! shared stop signal.
//!
//! Targets are independent: each group gets its own task and its own colored
//! log label, indexed in the order the groups were given. A fatal error in
//! one machine is reported and remembered for the exit status but does not
//! stop the other targets; only Ctrl-C (or the caller's stop signal) does.

use std::sync::Arc;

use log::{error, info};
use secrecy::SecretString;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::console::TargetLog;
use crate::destination::TargetGroup;
use crate::error::{Result, SessionError};
use crate::machine::{MachineConfig, SessionMachine};

pub struct Orchestrator {
    config: MachineConfig,
    passphrase: Arc<SecretString>,
}

impl Orchestrator {
    pub fn new(config: MachineConfig, passphrase: Arc<SecretString>) -> Self {
        Self { config, passphrase }
    }

    /// Run until interrupted. Installs a Ctrl-C handler that cancels every
    /// session machine, then waits for all of them to wind down.
    pub async fn run(&self, groups: Vec<TargetGroup>) -> Result<()> {
        let stop = CancellationToken::new();
        let interrupt = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                interrupt.cancel();
            }
        });
        self.run_with_stop(groups, stop).await
    }

    /// Same as [`run`](Self::run) with an externally owned stop signal.
    pub async fn run_with_stop(
        &self,
        groups: Vec<TargetGroup>,
        stop: CancellationToken,
    ) -> Result<()> {
        let mut machines = JoinSet::new();
        for (index, group) in groups.into_iter().enumerate() {
            let log = TargetLog::new(group.label(), index);
            let machine = SessionMachine::new(
                group,
                Arc::clone(&self.passphrase),
                self.config.clone(),
                log,
                stop.clone(),
            );
            machines.spawn(machine.run());
        }

        // A failed target is reported but the rest keep running; the first
        // failure decides the final status once everything has wound down.
        let mut outcome = Ok(());
        while let Some(joined) = machines.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => SessionError::Aborted(e).into(),
            };
            error!("session task failed: {failure}");
            if outcome.is_ok() {
                outcome = Err(failure);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{ClientCommand, Defaults};
    use crate::error::Error;
    use std::time::Duration;

    fn groups(specs: &[&str]) -> Vec<TargetGroup> {
        let defaults = Defaults {
            user: Some("root".to_string()),
        };
        specs
            .iter()
            .map(|spec| TargetGroup::from_strings(spec.split(','), &defaults).unwrap())
            .collect()
    }

    fn orchestrator(program: &str) -> Orchestrator {
        let config = MachineConfig {
            client: ClientCommand {
                program: program.to_string(),
                connect_timeout: Duration::from_secs(1),
                remote_shell: "bash".to_string(),
            },
            probe_server_type: false,
            ..MachineConfig::default()
        };
        Orchestrator::new(config, Arc::new(SecretString::from("pw".to_string())))
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_cleanly() {
        let stop = CancellationToken::new();
        stop.cancel();
        let result = orchestrator("ssh")
            .run_with_stop(groups(&["one,two", "three"]), stop)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unspawnable_client_surfaces_as_a_fatal_error() {
        let stop = CancellationToken::new();
        let result = orchestrator("/nonexistent/fake-ssh")
            .run_with_stop(groups(&["one", "two"]), stop)
            .await;
        assert!(matches!(
            result,
            Err(Error::Session(SessionError::Spawn { .. }))
        ));
    }
}
