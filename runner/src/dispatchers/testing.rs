use super::{DispatchError, Dispatcher};
use crate::{
    call::FunctionCall,
    command::{NodeCommand, PayloadConfig, ShellCommand},
    context::Context,
    job::JobReference,
    options::Options,
};
use parking_lot::Mutex;
use std::{path::Path, sync::Arc};
use tracing::info;

/// Everything a `TestDispatcher` received
#[derive(Debug, Clone, Default)]
pub struct Capture {
    /// the calls of every dispatch
    pub calls: Vec<Vec<FunctionCall>>,
    /// the options of every dispatch
    pub options: Vec<Options>,
    /// the node command every dispatch would have issued
    pub commands: Vec<NodeCommand>,
    pub sruns: Vec<String>,
    pub sbatches: Vec<String>,
}

pub type CaptureHandle = Arc<Mutex<Capture>>;

/// Records all dispatches instead of executing them
#[derive(Debug, Clone, Default)]
pub struct TestDispatcher {
    payload: PayloadConfig,
    capture: CaptureHandle,
}

impl TestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, payload: PayloadConfig) -> Self {
        self.payload = payload;
        self
    }

    /// handle to the recorded dispatches, stays valid after the dispatcher was moved
    pub fn capture(&self) -> CaptureHandle {
        Arc::clone(&self.capture)
    }
}

impl Dispatcher for TestDispatcher {
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        options: &Options,
        entry_point: &Path,
        _blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        let command = NodeCommand::new(entry_point, calls, &self.payload)?;
        info!("[test output] {command}");
        command.discard_payload();

        let mut capture = self.capture.lock();
        capture.calls.push(calls.to_vec());
        capture.options.push(options.clone());
        capture.commands.push(command);

        Ok(JobReference::captured())
    }

    fn srun(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        info!("[test output] SRUN {command} with arguments {conf}");
        self.capture.lock().sruns.push(command.to_line());

        Ok(JobReference::captured())
    }

    fn sbatch(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        info!("[test output] SBATCH {command} with arguments {conf}");
        self.capture.lock().sbatches.push(command.to_line());

        Ok(JobReference::captured())
    }

    fn is_sequential(&self) -> bool {
        true
    }
}
