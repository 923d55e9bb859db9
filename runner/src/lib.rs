//! Distribute function calls of a binary to a slurm cluster.
//!
//! Functions are declared as static `Distributable`s and listed in a `FunctionTable`. The
//! binary runs `node::bootstrap_from_env` first thing in `main`, so the very same binary can
//! execute the calls on a node:
//!
//! ```ignore
//! static GREET: Distributable = Distributable::new("greet", &[Param::Required("name")], greet);
//! static FUNCTIONS: FunctionTable = FunctionTable { functions: &[&GREET], node_setup: &[] };
//!
//! fn main() -> ExitCode {
//!     if let Some(code) = node::bootstrap_from_env(&FUNCTIONS) {
//!         return code;
//!     }
//!
//!     let mut ctx = Context::new(&FUNCTIONS).unwrap_or_log();
//!     let greet = ctx.function(&GREET).unwrap_or_log();
//!     ctx.bundle(10, |ctx| greet.distribute(ctx, Arguments::positional(["world"])))
//!         .unwrap_or_log();
//!     ExitCode::SUCCESS
//! }
//! ```

pub mod bundling;
pub mod call;
pub mod check;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatchers;
pub mod function;
pub mod guard;
pub mod job;
pub mod node;
pub mod options;
pub mod registry;
pub mod scheduler;

pub use call::{Arguments, FunctionCall};
pub use command::{PayloadConfig, ShellCommand};
pub use context::Context;
pub use dispatchers::{
    DirectCallDispatcher, DispatchError, Dispatcher, Dispatchers, SlurmDispatcher,
    SubprocessDispatcher, TestDispatcher,
};
pub use function::{CallPolicy, RemoteFunction};
pub use job::JobReference;
pub use options::{DependencyMethod, Options};
pub use registry::{BoundArgs, Distributable, FunctionResult, FunctionTable, Param};
