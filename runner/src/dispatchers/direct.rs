use super::{run_shell, DispatchError, Dispatcher};
use crate::{
    call::FunctionCall, command::ShellCommand, context::Context, job::JobReference,
    options::Options,
};
use std::path::Path;

/// Calls the functions in the current process, e.g., if slurm is not available.
/// Shell commands are run locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectCallDispatcher;

impl Dispatcher for DirectCallDispatcher {
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        _options: &Options,
        _entry_point: &Path,
        _blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        for call in calls {
            ctx.call(call.func_id(), call.arguments())?;
        }

        Ok(JobReference::local(None))
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
