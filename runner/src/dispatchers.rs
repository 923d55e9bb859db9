//! Strategies for executing function calls and shell commands.
//!
//! All strategies implement `Dispatcher`, the active one is stored as `Dispatchers` in the
//! `Context`. Rate limiting is applied by the concrete strategies, the recursion guard and the
//! pre-flight check by the `Context`.

mod direct;
mod slurm;
mod subprocess;
mod testing;

pub use direct::DirectCallDispatcher;
pub use slurm::SlurmDispatcher;
pub use subprocess::SubprocessDispatcher;
pub use testing::{Capture, CaptureHandle, TestDispatcher};

use crate::{
    bundling::JobBundling,
    call::FunctionCall,
    command::{CommandError, ShellCommand},
    context::Context,
    guard::GuardError,
    job::JobReference,
    options::{Options, OptionsError},
    registry::RegistryError,
    scheduler::SchedulerError,
};
use itertools::Itertools;
use std::{path::Path, process::Command};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Slurm could not be found, `sbatch` is not available")]
    SlurmNotFound,
    #[error("{0} is not supported by this dispatcher")]
    NotSupported(&'static str),
    #[error("{0}")]
    InvalidDependency(&'static str),
    #[error("The maximal bundle size has to be at least 1")]
    InvalidBundleSize,
    #[error("Command `{command}` failed with exit code {code:?}")]
    CommandFailed { command: String, code: Option<i32> },
    #[error("Failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Function '{id}' failed: {source}")]
    FunctionFailed {
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Run a shell command on this machine and wait for it
pub fn run_shell(command: &ShellCommand) -> Result<i32, DispatchError> {
    let line = command.to_line();
    let status = Command::new("sh")
        .arg("-c")
        .arg(&line)
        .status()
        .map_err(|source| DispatchError::Spawn {
            command: line.clone(),
            source,
        })?;

    if status.success() {
        Ok(0)
    } else {
        Err(DispatchError::CommandFailed {
            command: line,
            code: status.code(),
        })
    }
}

pub trait Dispatcher {
    /// Execute or submit the calls as one job.
    /// `blocking` requests to wait for the execution, it is ignored by synchronous dispatchers.
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        options: &Options,
        entry_point: &Path,
        blocking: bool,
    ) -> Result<JobReference, DispatchError>;

    /// run a shell command and wait for it
    fn srun(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError>;

    /// queue a shell command
    fn sbatch(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError>;

    /// true if every dispatch finished once it returns
    fn is_sequential(&self) -> bool {
        false
    }

    /// Make all following dispatches wait for everything dispatched so far
    fn join(&mut self, _ctx: &mut Context) -> Result<(), DispatchError> {
        if self.is_sequential() {
            Ok(())
        } else {
            Err(DispatchError::NotSupported("Joining"))
        }
    }

    fn log_dispatch(&self, calls: &[FunctionCall], options: &Options) {
        match calls {
            [call] => info!("Dispatching task with options {options}: {call}"),
            _ => info!(
                "Dispatching task consisting of {} function calls with options {options}: {}",
                calls.len(),
                calls.iter().join(", ")
            ),
        }
    }
}

#[derive(Debug)]
pub enum Dispatchers {
    DirectCall(DirectCallDispatcher),
    Subprocess(SubprocessDispatcher),
    Slurm(SlurmDispatcher),
    Test(TestDispatcher),
    Bundling(Box<JobBundling>),
}

impl Default for Dispatchers {
    fn default() -> Self {
        Self::DirectCall(DirectCallDispatcher)
    }
}

impl Dispatchers {
    /// Use slurm if it is available, direct calls otherwise
    pub fn detect() -> Self {
        match SlurmDispatcher::new() {
            Ok(dispatcher) => Self::Slurm(dispatcher),
            Err(error) => {
                warn!("{error}. Using direct calls instead.");
                Self::default()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DirectCall(_) => "direct call",
            Self::Subprocess(_) => "subprocess",
            Self::Slurm(_) => "slurm",
            Self::Test(_) => "test",
            Self::Bundling(_) => "bundling",
        }
    }
}

impl Dispatcher for Dispatchers {
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        options: &Options,
        entry_point: &Path,
        blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        match self {
            Self::DirectCall(d) => d.dispatch(ctx, calls, options, entry_point, blocking),
            Self::Subprocess(d) => d.dispatch(ctx, calls, options, entry_point, blocking),
            Self::Slurm(d) => d.dispatch(ctx, calls, options, entry_point, blocking),
            Self::Test(d) => d.dispatch(ctx, calls, options, entry_point, blocking),
            Self::Bundling(d) => d.dispatch(ctx, calls, options, entry_point, blocking),
        }
    }

    fn srun(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        match self {
            Self::DirectCall(d) => d.srun(ctx, command, conf),
            Self::Subprocess(d) => d.srun(ctx, command, conf),
            Self::Slurm(d) => d.srun(ctx, command, conf),
            Self::Test(d) => d.srun(ctx, command, conf),
            Self::Bundling(d) => d.srun(ctx, command, conf),
        }
    }

    fn sbatch(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        match self {
            Self::DirectCall(d) => d.sbatch(ctx, command, conf),
            Self::Subprocess(d) => d.sbatch(ctx, command, conf),
            Self::Slurm(d) => d.sbatch(ctx, command, conf),
            Self::Test(d) => d.sbatch(ctx, command, conf),
            Self::Bundling(d) => d.sbatch(ctx, command, conf),
        }
    }

    fn is_sequential(&self) -> bool {
        match self {
            Self::DirectCall(d) => d.is_sequential(),
            Self::Subprocess(d) => d.is_sequential(),
            Self::Slurm(d) => d.is_sequential(),
            Self::Test(d) => d.is_sequential(),
            Self::Bundling(d) => d.is_sequential(),
        }
    }

    fn join(&mut self, ctx: &mut Context) -> Result<(), DispatchError> {
        match self {
            Self::DirectCall(d) => d.join(ctx),
            Self::Subprocess(d) => d.join(ctx),
            Self::Slurm(d) => d.join(ctx),
            Self::Test(d) => d.join(ctx),
            Self::Bundling(d) => d.join(ctx),
        }
    }

    fn log_dispatch(&self, calls: &[FunctionCall], options: &Options) {
        match self {
            Self::DirectCall(d) => d.log_dispatch(calls, options),
            Self::Subprocess(d) => d.log_dispatch(calls, options),
            Self::Slurm(d) => d.log_dispatch(calls, options),
            Self::Test(d) => d.log_dispatch(calls, options),
            Self::Bundling(d) => d.log_dispatch(calls, options),
        }
    }
}

impl From<DirectCallDispatcher> for Dispatchers {
    fn from(dispatcher: DirectCallDispatcher) -> Self {
        Self::DirectCall(dispatcher)
    }
}

impl From<SubprocessDispatcher> for Dispatchers {
    fn from(dispatcher: SubprocessDispatcher) -> Self {
        Self::Subprocess(dispatcher)
    }
}

impl From<SlurmDispatcher> for Dispatchers {
    fn from(dispatcher: SlurmDispatcher) -> Self {
        Self::Slurm(dispatcher)
    }
}

impl From<TestDispatcher> for Dispatchers {
    fn from(dispatcher: TestDispatcher) -> Self {
        Self::Test(dispatcher)
    }
}

impl From<JobBundling> for Dispatchers {
    fn from(dispatcher: JobBundling) -> Self {
        Self::Bundling(Box::new(dispatcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_shell_commands() {
        assert_eq!(run_shell(&"true".into()).unwrap(), 0);
        assert!(matches!(
            run_shell(&"exit 4".into()),
            Err(DispatchError::CommandFailed { code: Some(4), .. })
        ));
    }

    #[test]
    fn direct_calls_are_the_default() {
        let dispatcher = Dispatchers::default();

        assert_eq!(dispatcher.name(), "direct call");
        assert!(dispatcher.is_sequential());
    }
}
