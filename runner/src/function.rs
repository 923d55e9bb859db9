use crate::{
    call::{Arguments, FunctionCall},
    command::ShellCommand,
    context::Context,
    dispatchers::{run_shell, DispatchError, Dispatcher},
    job::JobReference,
    options::{DependencyMethod, Options},
    registry::{BoundArgs, Distributable, FunctionResult, Param, RegistryError},
};

/// What calling a `RemoteFunction` directly does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallPolicy {
    /// run in the current process
    #[default]
    Locally,
    /// dispatch without waiting
    Distributed,
    /// dispatch and wait for the execution
    DistributedBlocking,
}

/// Handle to a registered function together with its scheduler options
#[derive(Debug, Clone)]
pub struct RemoteFunction {
    function: &'static Distributable,
    options: Options,
    policy: CallPolicy,
}

impl RemoteFunction {
    pub(crate) fn new(function: &'static Distributable) -> Self {
        Self {
            function,
            options: function.default_options(),
            policy: CallPolicy::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.function.name()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// the id under the current entry point
    pub fn id(&self, ctx: &mut Context) -> Result<String, RegistryError> {
        ctx.registry_mut().identity(self.function)
    }

    /// a copy with `overlay` applied on top of the options
    pub fn with_options(&self, overlay: &Options) -> Self {
        let mut function = self.clone();
        function.update_options(overlay);
        function
    }

    pub fn update_options(&mut self, overlay: &Options) {
        self.options.update(overlay);
    }

    /// A copy that only starts after the given jobs.
    /// Jobs without id are only accepted (and ignored) by sequential dispatchers, as every
    /// job already finished there.
    pub fn wait_for(
        &self,
        ctx: &Context,
        jobs: &[JobReference],
        method: DependencyMethod,
    ) -> Result<Self, DispatchError> {
        let sequential = ctx.dispatcher().is_sequential();

        if jobs.is_empty() && !sequential {
            return Err(DispatchError::InvalidDependency(
                "Creating a dependency on an empty list of jobs. This is probably a bug, e.g., \
                waiting on the jobs of a bundle that was not flushed yet.",
            ));
        }
        if !sequential && jobs.iter().any(|job| job.job_id().is_none()) {
            return Err(DispatchError::InvalidDependency(
                "Invalid job id. Not every dispatcher returns job ids, e.g., bundled calls only \
                get one after the bundle was flushed.",
            ));
        }

        let job_ids: Vec<u64> = jobs.iter().filter_map(JobReference::job_id).collect();

        let mut function = self.clone();
        function.options.add_dependencies(&job_ids, method)?;

        Ok(function)
    }

    /// dispatch without waiting for the execution
    pub fn distribute(
        &self,
        ctx: &mut Context,
        arguments: impl Into<Arguments>,
    ) -> Result<JobReference, DispatchError> {
        self.submit(ctx, arguments.into(), false)
    }

    /// dispatch and wait for the execution, if the dispatcher supports it
    pub fn distribute_and_wait(
        &self,
        ctx: &mut Context,
        arguments: impl Into<Arguments>,
    ) -> Result<JobReference, DispatchError> {
        self.submit(ctx, arguments.into(), true)
    }

    fn submit(
        &self,
        ctx: &mut Context,
        arguments: Arguments,
        blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        self.function.bind(&arguments)?;
        ctx.guards().check_recursion()?;

        let entry_point = ctx.registry_mut().resolve_entry_point()?;
        let call = FunctionCall::new(self.id(ctx)?, arguments);

        ctx.dispatch(&[call], &self.options, &entry_point, blocking)
    }

    /// run in the current process, bypassing the dispatcher
    pub fn run_locally(
        &self,
        ctx: &mut Context,
        arguments: impl Into<Arguments>,
    ) -> Result<(), DispatchError> {
        let bound = self.function.bind(&arguments.into())?;

        (self.function.handler())(ctx, &bound).map_err(|source| DispatchError::FunctionFailed {
            id: self.name().to_owned(),
            source,
        })
    }

    /// Call according to the policy, returns a job reference if dispatched
    pub fn call(
        &self,
        ctx: &mut Context,
        arguments: impl Into<Arguments>,
    ) -> Result<Option<JobReference>, DispatchError> {
        match self.policy {
            CallPolicy::Locally => self.run_locally(ctx, arguments).map(|_| None),
            CallPolicy::Distributed => self.distribute(ctx, arguments).map(Some),
            CallPolicy::DistributedBlocking => self.distribute_and_wait(ctx, arguments).map(Some),
        }
    }
}

/// Built-in function running a shell command on the node, `cmd` is a line or a list of words
pub static SHELL: Distributable = Distributable::new("shell", &[Param::Required("cmd")], shell);

fn shell(_ctx: &mut Context, args: &BoundArgs) -> FunctionResult {
    let command: ShellCommand = args.get("cmd")?;
    run_shell(&command)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatchers::TestDispatcher;
    use crate::options::OptionValue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count(_ctx: &mut Context, args: &BoundArgs) -> FunctionResult {
        CALLS.fetch_add(args.get::<usize>("n")?, Ordering::SeqCst);
        Ok(())
    }

    static COUNT: Distributable = Distributable::new("count", &[Param::Required("n")], count)
        .with_options(&[("partition", "alg")]);

    fn context() -> Context {
        let mut ctx = Context::bare(TestDispatcher::new());
        ctx.disable_preflight();
        ctx.register(&COUNT, false).unwrap();
        ctx
    }

    #[test]
    fn options_of_the_function_are_the_base() {
        let mut ctx = context();
        let count = ctx.function(&COUNT).unwrap();
        let updated =
            count.with_options(&Options::new().with("partition", "gpu").with("mem", "1G"));

        assert_eq!(count.options().get("partition"), Some(&OptionValue::from("alg")));
        assert_eq!(updated.options().get("partition"), Some(&OptionValue::from("gpu")));
        assert_eq!(updated.options().len(), 2);
    }

    #[test]
    fn arguments_are_checked_before_dispatching() {
        let mut ctx = context();
        let count = ctx.function(&COUNT).unwrap();

        assert!(matches!(
            count.distribute(&mut ctx, Arguments::positional([1, 2])),
            Err(DispatchError::Registry(RegistryError::ArgumentMismatch { .. }))
        ));
        assert!(matches!(
            count.distribute(&mut ctx, Arguments::new().kwarg("m", 1)),
            Err(DispatchError::Registry(RegistryError::ArgumentMismatch { .. }))
        ));
    }

    #[test]
    fn call_policies() {
        let mut ctx = context();
        let count = ctx.function(&COUNT).unwrap();
        let before = CALLS.load(Ordering::SeqCst);

        assert_eq!(count.call(&mut ctx, Arguments::positional([3])).unwrap(), None);
        assert!(CALLS.load(Ordering::SeqCst) >= before + 3);

        let distributed = count.clone().with_policy(CallPolicy::Distributed);
        assert_eq!(
            distributed.call(&mut ctx, Arguments::positional([1])).unwrap(),
            Some(JobReference::captured())
        );
    }

    #[test]
    fn sequential_dispatchers_ignore_missing_job_ids() {
        let mut ctx = context();
        let count = ctx.function(&COUNT).unwrap();
        let job = count.distribute(&mut ctx, Arguments::positional([1])).unwrap();

        let chained = count
            .wait_for(&ctx, &[job], DependencyMethod::AfterOk)
            .unwrap();
        assert_eq!(chained.options(), count.options());
        assert!(count.wait_for(&ctx, &[], DependencyMethod::AfterOk).is_ok());
    }

    #[test]
    fn shell_accepts_lines_and_words() {
        let mut ctx = Context::bare(TestDispatcher::new());
        let shell = RemoteFunction::new(&SHELL);

        shell.run_locally(&mut ctx, Arguments::positional(["true"])).unwrap();
        shell
            .run_locally(&mut ctx, Arguments::positional([json!(["test", "a b", "=", "a b"])]))
            .unwrap();
        assert!(matches!(
            shell.run_locally(&mut ctx, Arguments::positional(["exit 2"])),
            Err(DispatchError::FunctionFailed { .. })
        ));
    }
}
