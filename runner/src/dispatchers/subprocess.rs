use super::{run_shell, DispatchError, Dispatcher};
use crate::{
    call::FunctionCall,
    command::{NodeCommand, PayloadConfig, ShellCommand},
    context::Context,
    job::JobReference,
    options::Options,
};
use std::path::Path;
use tracing::debug;

/// Runs every dispatch as a node in a local subprocess and waits for it.
/// Exercises the complete node protocol without a cluster.
#[derive(Debug, Clone, Default)]
pub struct SubprocessDispatcher {
    payload: PayloadConfig,
    commands: Vec<NodeCommand>,
}

impl SubprocessDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, payload: PayloadConfig) -> Self {
        self.payload = payload;
        self
    }

    /// all node commands issued so far
    pub fn commands(&self) -> &[NodeCommand] {
        &self.commands
    }
}

impl Dispatcher for SubprocessDispatcher {
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        _options: &Options,
        entry_point: &Path,
        _blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        let command = NodeCommand::new(entry_point, calls, &self.payload)?;
        debug!("Running {command}");

        let status = command
            .to_command()
            .status()
            .map_err(|source| DispatchError::Spawn {
                command: command.to_string(),
                source,
            });
        // the node removes the file itself, unless it failed early or never started
        command.discard_payload();
        self.commands.push(command.clone());

        let status = status?;
        if !status.success() {
            return Err(DispatchError::CommandFailed {
                command: command.to_string(),
                code: status.code(),
            });
        }

        Ok(JobReference::local(status.code()))
    }

    fn srun(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        _conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        Ok(JobReference::local(Some(run_shell(command)?)))
    }

    fn sbatch(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        self.srun(ctx, command, conf)
    }

    fn is_sequential(&self) -> bool {
        true
    }
}
