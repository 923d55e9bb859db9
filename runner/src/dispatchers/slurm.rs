use super::{DispatchError, Dispatcher};
use crate::{
    call::FunctionCall,
    command::{NodeCommand, PayloadConfig, ShellCommand},
    config::find_executable,
    context::Context,
    job::{JobReference, SubmissionMode},
    options::{DependencyMethod, Options},
    scheduler::{CommandLineClient, SchedulerClient},
};
use itertools::Itertools;
use std::path::Path;
use tracing::{debug, info};

/// Distributes function calls to slurm
#[derive(Debug)]
pub struct SlurmDispatcher {
    client: Box<dyn SchedulerClient>,
    payload: PayloadConfig,
    all_job_ids: Vec<u64>,
    join_dependencies: Vec<u64>,
}

impl SlurmDispatcher {
    /// Fails if `sbatch` can't be found
    pub fn new() -> Result<Self, DispatchError> {
        find_executable("sbatch").ok_or(DispatchError::SlurmNotFound)?;

        Ok(Self::with_client(CommandLineClient::default()))
    }

    pub fn with_client(client: impl SchedulerClient + 'static) -> Self {
        Self {
            client: Box::new(client),
            payload: PayloadConfig::default(),
            all_job_ids: Vec::new(),
            join_dependencies: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: PayloadConfig) -> Self {
        self.payload = payload;
        self
    }

    /// ids of all queued jobs
    pub fn job_ids(&self) -> &[u64] {
        &self.all_job_ids
    }

    fn job_name(calls: &[FunctionCall]) -> String {
        let names = calls.iter().map(FunctionCall::name).unique().collect_vec();

        match (calls.len(), names.first()) {
            (1, Some(name)) => format!("slurmify:{name}"),
            (_, Some(name)) => format!("slurmify[batch]:{name}..."),
            (_, None) => "slurmify".to_owned(),
        }
    }

    /// the final scheduler options: defaults, overlaid options and join dependencies
    fn submission_options(
        &self,
        ctx: &Context,
        options: &Options,
    ) -> Result<Options, DispatchError> {
        let mut options = options.clone();
        options.add_dependencies(&self.join_dependencies, DependencyMethod::AfterAny)?;

        Ok(ctx.defaults().merged(&options))
    }
}

impl Dispatcher for SlurmDispatcher {
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        calls: &[FunctionCall],
        options: &Options,
        entry_point: &Path,
        blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        let mut options = options.clone();
        if !options.contains_key("job_name") {
            options.insert("job_name", Self::job_name(calls));
        }
        let conf = self.submission_options(ctx, &options)?;

        let command = NodeCommand::new(entry_point, calls, &self.payload)?;
        debug!("{command}");

        if blocking {
            let exit_code = self
                .client
                .srun(&conf, &command.to_shell())
                .map_err(|error| {
                    command.discard_payload();
                    error
                })?;
            info!("Returned from srun with exit code {exit_code}");

            Ok(JobReference::slurm(None, Some(exit_code), SubmissionMode::Srun))
        } else {
            let job_id = self
                .client
                .sbatch(&conf, &command.to_shell())
                .map_err(|error| {
                    command.discard_payload();
                    error
                })?;
            self.all_job_ids.push(job_id);

            Ok(JobReference::slurm(Some(job_id), None, SubmissionMode::Sbatch))
        }
    }

    fn srun(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        let conf = ctx.defaults().merged(conf);
        debug!("SRUN {command}");
        let exit_code = self.client.srun(&conf, &command.to_line())?;

        Ok(JobReference::slurm(None, Some(exit_code), SubmissionMode::Srun))
    }

    fn sbatch(
        &mut self,
        ctx: &mut Context,
        command: &ShellCommand,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        ctx.guards_mut().consume_dispatch()?;

        let conf = self.submission_options(ctx, conf)?;
        debug!("SBATCH {command}");
        let job_id = self.client.sbatch(&conf, &command.to_line())?;
        self.all_job_ids.push(job_id);

        Ok(JobReference::slurm(Some(job_id), None, SubmissionMode::Sbatch))
    }

    fn join(&mut self, _ctx: &mut Context) -> Result<(), DispatchError> {
        if !self.all_job_ids.is_empty() {
            self.join_dependencies = self.all_job_ids.iter().copied().sorted().dedup().collect();
        }

        Ok(())
    }
}
