//! Partition-server side of the command queue

use crate::common::Result;
use crate::coordinator::{Host, HostCommand, HostState};
use std::sync::Arc;

/// Work done while a host is UPDATING
pub trait Updater: Send + Sync {
    fn update(&self, host: &dyn Host) -> Result<()>;
}

impl<F> Updater for F
where
    F: Fn(&dyn Host) -> Result<()> + Send + Sync,
{
    fn update(&self, host: &dyn Host) -> Result<()> {
        self(host)
    }
}

struct NoUpdate;

impl Updater for NoUpdate {
    fn update(&self, _host: &dyn Host) -> Result<()> {
        Ok(())
    }
}

/// Executes queued commands against the host's state
pub struct CommandProcessor {
    host: Arc<dyn Host>,
    updater: Box<dyn Updater>,
}

impl CommandProcessor {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            updater: Box::new(NoUpdate),
        }
    }

    pub fn with_updater(mut self, updater: impl Updater + 'static) -> Self {
        self.updater = Box::new(updater);
        self
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// State a command leaves the host in
    pub fn target_state(command: HostCommand) -> HostState {
        match command {
            HostCommand::GoToIdle => HostState::Idle,
            HostCommand::ServeData => HostState::Serving,
            HostCommand::ExecuteUpdate => HostState::Idle,
        }
    }

    pub fn execute(&self, command: HostCommand) -> Result<()> {
        tracing::info!("Host {} executing {}", self.host.address(), command);
        match command {
            HostCommand::GoToIdle | HostCommand::ServeData => {
                self.host.set_state(Self::target_state(command))
            }
            HostCommand::ExecuteUpdate => {
                self.host.set_state(HostState::Updating)?;
                let result = self.updater.update(self.host.as_ref());
                if let Err(e) = &result {
                    tracing::error!("Update of {} failed: {}", self.host.address(), e);
                }
                // Back to IDLE whether or not the update succeeded
                self.host.set_state(Self::target_state(command))?;
                result
            }
        }
    }

    /// Dequeue and execute commands until the queue is empty. Returns how
    /// many were executed.
    pub fn process_pending(&self) -> Result<usize> {
        let mut executed = 0;
        while let Some(command) = self.host.next_command()? {
            self.execute(command)?;
            executed += 1;
        }
        if executed > 0 {
            tracing::debug!(
                "Host {} processed {} command(s)",
                self.host.address(),
                executed
            );
        }
        Ok(executed)
    }
}
