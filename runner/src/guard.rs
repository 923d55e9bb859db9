//! Safety measures against common mistakes that could flood the cluster:
//! 1. nodes distributing tasks themselves (recursive distribution)
//! 2. an unbounded number of dispatches
//! 3. repeated flushes of a bundle, often caused by a wrongly indented flush inside a loop
//!
//! All of them can be disabled, see `Guards`.

use crate::command::BOOTSTRAP_COMMAND;
use std::{env, ffi::OsStr};
use thiserror::Error;
use tracing::warn;

/// default maximal number of dispatches per process
pub const DEFAULT_DISPATCH_LIMIT: usize = 100;

const RECURSION_MESSAGE: &str = "You tried to distribute a task recursively. This is not allowed \
by default, because it probably indicates a bug: a function running on a node is dispatching \
again. The most common reason is dispatching code that runs unconditionally at start-up, e.g., \
in a node setup hook or in `main` before `bootstrap_from_env` had a chance to handle the worker \
invocation. If you are sure you want to distribute recursively, call \
`allow_recursive_distribution` first.";

const REPEATED_FLUSH_MESSAGE: &str = "You repeatedly flushed a bundle. This can be intended, but \
it is a common mistake to flush inside a loop instead of once at the end of the bundling scope. \
Used together with `wait_for`, such a mistake leads to a faulty execution order. You may want to \
cancel your jobs with `scancel -u <username>` before they do any harm. Call \
`disable_warning_on_repeated_flushes` to silence this warning.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("{}", RECURSION_MESSAGE)]
    RecursiveDistribution,
    #[error(
        "Exceeded the dispatch limit of {0} calls. This limit prevents you from overloading \
        your slurm environment in case of a bug. You can increase it using `set_dispatch_limit`."
    )]
    DispatchLimitExceeded(usize),
}

/// Counts down the remaining dispatches, `None` means unlimited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchLimit {
    max: Option<usize>,
    remaining: usize,
}

impl Default for DispatchLimit {
    fn default() -> Self {
        Self::new(Some(DEFAULT_DISPATCH_LIMIT))
    }
}

impl DispatchLimit {
    pub fn new(max: Option<usize>) -> Self {
        Self {
            max,
            remaining: max.unwrap_or(0),
        }
    }

    /// consume a single dispatch, returns the remaining number of dispatches if limited
    pub fn consume(&mut self) -> Result<Option<usize>, GuardError> {
        match self.max {
            None => Ok(None),
            Some(max) if self.remaining == 0 => Err(GuardError::DispatchLimitExceeded(max)),
            Some(_) => {
                self.remaining -= 1;
                Ok(Some(self.remaining))
            }
        }
    }

    /// set a new limit, the counter starts over
    pub fn set_limit(&mut self, max: Option<usize>) {
        *self = Self::new(max);
    }
}

/// Counts the non-empty flushes of a single bundle
#[derive(Debug, Clone, Default)]
pub struct FlushGuard {
    flushes: usize,
    warned: bool,
}

impl FlushGuard {
    /// Record a flush of `num_tasks` calls, empty flushes are ignored.
    /// Returns true if this flush triggered the warning.
    pub fn report_flush(&mut self, num_tasks: usize, enabled: bool) -> bool {
        if num_tasks == 0 {
            return false;
        }

        self.flushes += 1;

        if self.flushes == 2 && enabled && !self.warned {
            warn!("{REPEATED_FLUSH_MESSAGE}");
            self.warned = true;

            true
        } else {
            false
        }
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

/// true if `args` (including the program name) start a node
pub fn is_node_invocation<I>(args: I) -> bool
where
    I: IntoIterator,
    I::Item: AsRef<OsStr>,
{
    args.into_iter()
        .nth(1)
        .map_or(false, |arg| arg.as_ref() == OsStr::new(BOOTSTRAP_COMMAND))
}

/// Process wide guard state.
/// In a node process, distribution is forbidden from the start, even before the bootstrap ran.
#[derive(Debug, Clone)]
pub struct Guards {
    on_node: bool,
    limit: DispatchLimit,
    warn_on_repeated_flushes: bool,
}

impl Default for Guards {
    fn default() -> Self {
        Self {
            on_node: is_node_invocation(env::args_os()),
            limit: DispatchLimit::default(),
            warn_on_repeated_flushes: true,
        }
    }
}

impl Guards {
    /// forbid any further dispatches, set when running as a node
    pub fn prevent_distribution(&mut self) {
        self.on_node = true;
    }

    /// Allow nodes to distribute tasks themselves. Dangerous!
    pub fn allow_recursive_distribution(&mut self) {
        self.on_node = false;
    }

    pub fn check_recursion(&self) -> Result<(), GuardError> {
        if self.on_node {
            Err(GuardError::RecursiveDistribution)
        } else {
            Ok(())
        }
    }

    pub fn consume_dispatch(&mut self) -> Result<(), GuardError> {
        self.limit.consume().map(|_| ())
    }

    pub fn set_dispatch_limit(&mut self, max: Option<usize>) {
        self.limit.set_limit(max);
    }

    pub fn disable_warning_on_repeated_flushes(&mut self) {
        self.warn_on_repeated_flushes = false;
    }

    pub fn warn_on_repeated_flushes(&self) -> bool {
        self.warn_on_repeated_flushes
    }
}
