//! Bundling of many small function calls into few jobs.
//!
//! Inside a bundling scope (`Context::bundle`) every non-blocking dispatch is buffered. On
//! flush, the buffered calls are grouped by entry point and options and submitted in chunks of
//! at most `max_size` calls, each chunk as a single job.

use crate::{
    call::FunctionCall,
    command::ShellCommand,
    context::Context,
    dispatchers::{DispatchError, Dispatcher, Dispatchers},
    guard::FlushGuard,
    job::JobReference,
    options::Options,
};
use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Buffered calls, grouped by entry point and options
#[derive(Debug, Default)]
pub struct TaskBuffer {
    tasks: BTreeMap<(PathBuf, Options), Vec<FunctionCall>>,
}

impl TaskBuffer {
    pub fn add(&mut self, call: FunctionCall, options: &Options, entry_point: &Path) {
        self.tasks
            .entry((entry_point.to_path_buf(), options.clone()))
            .or_default()
            .push(call);
    }

    /// total number of buffered calls
    pub fn len(&self) -> usize {
        self.tasks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// all groups, the buffer is empty afterwards
    pub fn take(&mut self) -> BTreeMap<(PathBuf, Options), Vec<FunctionCall>> {
        std::mem::take(&mut self.tasks)
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

/// Dispatcher buffering calls for a bundled submission to its sub-dispatcher
#[derive(Debug)]
pub struct JobBundling {
    max_size: NonZeroUsize,
    subdispatcher: Dispatchers,
    tasks: TaskBuffer,
    flush_guard: FlushGuard,
}

impl JobBundling {
    pub fn new(max_size: NonZeroUsize, subdispatcher: Dispatchers) -> Self {
        Self {
            max_size,
            subdispatcher,
            tasks: TaskBuffer::default(),
            flush_guard: FlushGuard::default(),
        }
    }

    /// number of buffered calls
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Submit all buffered calls, returns a reference per submitted job.
    /// The buffer is cleared even if a submission fails.
    #[instrument(skip_all, level = "debug")]
    pub fn flush(&mut self, ctx: &mut Context) -> Result<Vec<JobReference>, DispatchError> {
        let tasks = self.tasks.take();
        let num_tasks: usize = tasks.values().map(Vec::len).sum();

        self.flush_guard
            .report_flush(num_tasks, ctx.guards().warn_on_repeated_flushes());

        if num_tasks == 0 {
            debug!("Nothing to flush");
            return Ok(Vec::new());
        }

        let mut job_refs = Vec::new();

        for ((entry_point, options), calls) in tasks {
            for chunk in calls.chunks(self.max_size.get()) {
                self.subdispatcher.log_dispatch(chunk, &options);

                job_refs.push(
                    self.subdispatcher
                        .dispatch(ctx, chunk, &options, &entry_point, false)?,
                );
            }
        }

        info!("Flushed {num_tasks} calls as {} jobs", job_refs.len());

        Ok(job_refs)
    }

    /// Drop all buffered calls and return the sub-dispatcher
    pub fn into_subdispatcher(mut self) -> Dispatchers {
        if !self.tasks.is_empty() {
            warn!(
                "Dropping {} buffered calls that were never flushed",
                self.tasks.len()
            );
            self.tasks.clear();
        }

        std::mem::take(&mut self.subdispatcher)
    }
}

impl Drop for JobBundling {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            warn!(
                "Bundling dispatcher dropped with {} calls that were never flushed",
                self.tasks.len()
            );
        }
    }
}

impl Dispatcher for JobBundling {
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        options: &Options,
        entry_point: &Path,
        blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        if blocking {
            return self
                .subdispatcher
                .dispatch(ctx, calls, options, entry_point, blocking);
        }

        for call in calls {
            self.tasks.add(call.clone(), options, entry_point);
        }

        Ok(JobReference::buffered())
    }

    fn srun(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        self.subdispatcher.srun(ctx, command, conf)
    }

    fn sbatch(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        self.subdispatcher.sbatch(ctx, command, conf)
    }

    fn is_sequential(&self) -> bool {
        self.subdispatcher.is_sequential()
    }

    fn join(&mut self, ctx: &mut Context) -> Result<(), DispatchError> {
        self.flush(ctx)?;
        self.subdispatcher.join(ctx)
    }

    fn log_dispatch(&self, calls: &[FunctionCall], options: &Options) {
        for call in calls {
            info!("Adding task to bundle with options {options}: {call}");
        }
    }
}
