use crate::{
    bundling::JobBundling,
    call::{Arguments, FunctionCall},
    command::ShellCommand,
    config::Defaults,
    dispatchers::{DispatchError, Dispatcher, Dispatchers},
    function::{RemoteFunction, SHELL},
    guard::Guards,
    job::JobReference,
    options::Options,
    registry::{Distributable, FunctionTable, Registry, RegistryError},
};
use std::{num::NonZeroUsize, path::Path};
use tracing::{debug, error, warn};

/// Process wide state: the function registry, the guards, the default options and the active
/// dispatcher
#[derive(Debug, Default)]
pub struct Context {
    registry: Registry,
    guards: Guards,
    defaults: Defaults,
    dispatcher: Dispatchers,
}

impl Context {
    /// Context with the defaults of the configuration files, slurm if available and all
    /// functions of `table`
    pub fn new(table: &FunctionTable) -> Result<Self, RegistryError> {
        let mut ctx = Self {
            defaults: Defaults::load(),
            dispatcher: Dispatchers::detect(),
            ..Self::default()
        };
        ctx.register_table(table)?;

        Ok(ctx)
    }

    /// Context without any defaults or registered functions
    pub fn bare(dispatcher: impl Into<Dispatchers>) -> Self {
        Self {
            dispatcher: dispatcher.into(),
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn guards(&self) -> &Guards {
        &self.guards
    }

    pub fn guards_mut(&mut self) -> &mut Guards {
        &mut self.guards
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    pub fn dispatcher(&self) -> &Dispatchers {
        &self.dispatcher
    }

    /// Replace the active dispatcher, returns the previous one
    pub fn set_dispatcher(&mut self, dispatcher: impl Into<Dispatchers>) -> Dispatchers {
        let dispatcher = dispatcher.into();
        debug!("Using the {} dispatcher", dispatcher.name());

        std::mem::replace(&mut self.dispatcher, dispatcher)
    }

    /// add or overwrite default options
    pub fn update_defaults(&mut self, overlay: &Options) {
        self.defaults.update(overlay);
    }

    pub fn replace_defaults(&mut self, options: Options) {
        self.defaults.replace(options);
    }

    pub fn set_dispatch_limit(&mut self, max: Option<usize>) {
        self.guards.set_dispatch_limit(max);
    }

    pub fn allow_recursive_distribution(&mut self) {
        self.guards.allow_recursive_distribution();
    }

    pub fn disable_warning_on_repeated_flushes(&mut self) {
        self.guards.disable_warning_on_repeated_flushes();
    }

    /// never ask the entry point for its functions before dispatching
    pub fn disable_preflight(&mut self) {
        self.registry.disable_preflight();
    }

    pub fn set_entry_point(&mut self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        self.registry.set_entry_point(path).map(|_| ())
    }

    pub fn register(
        &mut self,
        function: &'static Distributable,
        allow_overwrite: bool,
    ) -> Result<String, RegistryError> {
        self.registry.register(function, allow_overwrite)
    }

    /// Register the built-in functions and all functions of `table`
    pub fn register_table(&mut self, table: &FunctionTable) -> Result<(), RegistryError> {
        self.registry.register(&SHELL, true)?;

        for &function in table.functions {
            self.registry.register(function, false)?;
        }

        Ok(())
    }

    /// Handle to a registered function
    pub fn function(
        &mut self,
        function: &'static Distributable,
    ) -> Result<RemoteFunction, RegistryError> {
        let func_id = self.registry.identity(function)?;

        if self.registry.exists(&func_id) {
            Ok(RemoteFunction::new(function))
        } else {
            Err(RegistryError::UnknownFunction(func_id))
        }
    }

    /// Call a registered function by its id in the current process
    pub fn call(&mut self, func_id: &str, arguments: &Arguments) -> Result<(), DispatchError> {
        let function = self.registry.lookup(func_id)?;
        let bound = function.bind(arguments)?;

        debug!("Calling {func_id}");

        (function.handler())(self, &bound).map_err(|source| DispatchError::FunctionFailed {
            id: func_id.to_owned(),
            source,
        })
    }

    /// run `f` with the active dispatcher moved out of the context
    fn with_dispatcher<R>(&mut self, f: impl FnOnce(&mut Dispatchers, &mut Self) -> R) -> R {
        let mut dispatcher = std::mem::take(&mut self.dispatcher);
        let result = f(&mut dispatcher, self);
        self.dispatcher = dispatcher;

        result
    }

    /// Hand the calls to the active dispatcher
    pub fn dispatch(
        &mut self,
        calls: &[FunctionCall],
        options: &Options,
        entry_point: &Path,
        blocking: bool,
    ) -> Result<JobReference, DispatchError> {
        self.guards.check_recursion()?;

        for call in calls {
            if !self.registry.check_id(call.func_id(), entry_point) {
                return Err(RegistryError::UnavailableFunction(
                    call.func_id().to_owned(),
                    entry_point.to_path_buf(),
                )
                .into());
            }
        }

        self.with_dispatcher(|dispatcher, ctx| {
            dispatcher.log_dispatch(calls, options);
            dispatcher.dispatch(ctx, calls, options, entry_point, blocking)
        })
    }

    /// run a shell command through the active dispatcher and wait for it
    pub fn srun(
        &mut self,
        command: impl Into<ShellCommand>,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        self.guards.check_recursion()?;
        let command = command.into();

        self.with_dispatcher(|dispatcher, ctx| dispatcher.srun(ctx, &command, conf))
    }

    /// queue a shell command through the active dispatcher
    pub fn sbatch(
        &mut self,
        command: impl Into<ShellCommand>,
        conf: &Options,
    ) -> Result<JobReference, DispatchError> {
        self.guards.check_recursion()?;
        let command = command.into();

        self.with_dispatcher(|dispatcher, ctx| dispatcher.sbatch(ctx, &command, conf))
    }

    /// Make all following dispatches wait for everything dispatched so far
    pub fn join(&mut self) -> Result<(), DispatchError> {
        self.with_dispatcher(|dispatcher, ctx| dispatcher.join(ctx))
    }

    /// Flush the active bundle, does nothing outside a bundling scope
    pub fn flush(&mut self) -> Result<Vec<JobReference>, DispatchError> {
        self.with_dispatcher(|dispatcher, ctx| match dispatcher {
            Dispatchers::Bundling(bundling) => bundling.flush(ctx),
            _ => Ok(Vec::new()),
        })
    }

    /// Run `body` in a bundling scope: non-blocking dispatches are buffered and submitted in
    /// jobs of at most `max_size` calls when the scope ends successfully. If `body` fails, the
    /// buffered calls are dropped.
    pub fn bundle<T, E, F>(&mut self, max_size: usize, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<DispatchError>,
    {
        let max_size = NonZeroUsize::new(max_size).ok_or(DispatchError::InvalidBundleSize)?;
        let previous = std::mem::take(&mut self.dispatcher);
        self.dispatcher = JobBundling::new(max_size, previous).into();

        let result = body(self);

        let mut bundling = match std::mem::take(&mut self.dispatcher) {
            Dispatchers::Bundling(bundling) => *bundling,
            other => {
                warn!(
                    "The {} dispatcher replaced the bundling dispatcher inside its scope",
                    other.name()
                );
                self.dispatcher = other;
                return result;
            }
        };

        match result {
            Ok(value) => {
                let flushed = bundling.flush(self);
                self.dispatcher = bundling.into_subdispatcher();
                flushed?;

                Ok(value)
            }
            Err(err) => {
                error!(
                    "Aborted bundling due to an error, dropping {} buffered calls",
                    bundling.pending()
                );
                self.dispatcher = bundling.into_subdispatcher();

                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatchers::{DirectCallDispatcher, TestDispatcher},
        guard::GuardError,
        registry::{BoundArgs, FunctionResult, Param},
    };
    use parking_lot::Mutex;

    static SEEN: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

    fn record(_ctx: &mut Context, args: &BoundArgs) -> FunctionResult {
        SEEN.lock().push(args.get("word")?);
        Ok(())
    }

    fn nested(ctx: &mut Context, _args: &BoundArgs) -> FunctionResult {
        let record = ctx.function(&RECORD)?;
        record.distribute(ctx, Arguments::positional(["nested"]))?;
        Ok(())
    }

    static RECORD: Distributable = Distributable::new("record", &[Param::Required("word")], record);
    static NESTED: Distributable = Distributable::new("nested", &[], nested);
    static UNREGISTERED: Distributable = Distributable::new("unregistered", &[], nested);
    static TABLE: FunctionTable = FunctionTable {
        functions: &[&RECORD, &NESTED],
        node_setup: &[],
    };

    fn context(dispatcher: impl Into<Dispatchers>) -> Context {
        let mut ctx = Context::bare(dispatcher);
        ctx.disable_preflight();
        ctx.register_table(&TABLE).unwrap();
        ctx
    }

    #[test]
    fn table_registration_includes_shell() {
        let ctx = context(TestDispatcher::new());
        let ids = ctx.registry().ids();

        assert_eq!(ids.len(), 3);
        assert!(ids.iter().any(|id| id.ends_with(":shell")));
    }

    #[test]
    fn handles_only_for_registered_functions() {
        let mut ctx = context(TestDispatcher::new());

        assert!(ctx.function(&RECORD).is_ok());
        assert!(matches!(
            ctx.function(&UNREGISTERED),
            Err(RegistryError::UnknownFunction(_))
        ));
    }

    #[test]
    fn direct_calls_run_in_process() {
        let mut ctx = context(DirectCallDispatcher);
        let nested = ctx.function(&NESTED).unwrap();

        let job = nested.distribute(&mut ctx, Arguments::new()).unwrap();

        assert_eq!(job.job_id(), None);
        assert!(SEEN.lock().contains(&"nested".to_owned()));
    }

    #[test]
    fn captured_dispatches() {
        let dispatcher = TestDispatcher::new();
        let capture = dispatcher.capture();
        let mut ctx = context(dispatcher);
        let record = ctx.function(&RECORD).unwrap();

        record
            .with_options(&Options::new().with("partition", "alg"))
            .distribute(&mut ctx, Arguments::positional(["a"]))
            .unwrap();
        ctx.srun("hostname", &Options::new()).unwrap();
        ctx.sbatch(vec!["echo".to_owned(), "x y".to_owned()], &Options::new()).unwrap();

        let capture = capture.lock();
        assert_eq!(capture.calls[0][0].name(), "record");
        assert_eq!(capture.options[0], Options::new().with("partition", "alg"));
        assert_eq!(capture.sruns, vec!["hostname"]);
        assert_eq!(capture.sbatches, vec!["echo 'x y'"]);
    }

    #[test]
    fn dispatch_limit() {
        let mut ctx = context(TestDispatcher::new());
        ctx.set_dispatch_limit(Some(3));
        let record = ctx.function(&RECORD).unwrap();

        for _ in 0..3 {
            record.distribute(&mut ctx, Arguments::positional(["x"])).unwrap();
        }

        assert!(matches!(
            record.distribute(&mut ctx, Arguments::positional(["x"])),
            Err(DispatchError::Guard(GuardError::DispatchLimitExceeded(3)))
        ));
        assert!(ctx.srun("true", &Options::new()).is_err());

        ctx.set_dispatch_limit(None);
        record.distribute(&mut ctx, Arguments::positional(["x"])).unwrap();
    }

    #[test]
    fn recursion_guard_blocks_all_dispatches() {
        let mut ctx = context(TestDispatcher::new());
        ctx.guards_mut().prevent_distribution();
        let record = ctx.function(&RECORD).unwrap();

        assert!(matches!(
            record.distribute(&mut ctx, Arguments::positional(["x"])),
            Err(DispatchError::Guard(GuardError::RecursiveDistribution))
        ));
        assert!(matches!(
            ctx.sbatch("true", &Options::new()),
            Err(DispatchError::Guard(GuardError::RecursiveDistribution))
        ));

        ctx.allow_recursive_distribution();
        assert!(record.distribute(&mut ctx, Arguments::positional(["x"])).is_ok());
    }

    #[test]
    fn failing_functions_are_reported() {
        let mut ctx = context(DirectCallDispatcher);
        let record = ctx.function(&RECORD).unwrap();

        let error = record
            .distribute(&mut ctx, Arguments::positional([1]))
            .unwrap_err();

        assert!(matches!(
            error,
            DispatchError::FunctionFailed { ref id, .. } if id.ends_with(":record")
        ));
    }

    #[test]
    fn sequential_join_is_a_noop() {
        let mut ctx = context(TestDispatcher::new());

        assert!(ctx.join().is_ok());
        assert!(ctx.flush().unwrap().is_empty());
    }

    #[test]
    fn replacing_the_dispatcher() {
        let mut ctx = context(TestDispatcher::new());

        let previous = ctx.set_dispatcher(DirectCallDispatcher);

        assert!(matches!(previous, Dispatchers::Test(_)));
        assert!(matches!(ctx.dispatcher(), Dispatchers::DirectCall(_)));
    }

    #[test]
    fn defaults_can_be_replaced() {
        let mut ctx = context(TestDispatcher::new());
        ctx.update_defaults(&Options::new().with("partition", "alg"));
        ctx.replace_defaults(Options::new().with("mem", "1G"));

        assert_eq!(ctx.defaults().options(), &Options::new().with("mem", "1G"));
    }
}
