//! A binary that dispatches in `main` before the node bootstrap had a chance to run.
//! Without arguments it starts itself as a node and checks that the early dispatch was refused
//! there.

use slurmify::{
    check::{FUNCTIONS, NOOP},
    command::BOOTSTRAP_COMMAND,
    guard::{is_node_invocation, GuardError},
    node, Arguments, Context, DispatchError,
};
use std::{env, process::Command, process::ExitCode};

fn dispatch_before_bootstrap() -> ExitCode {
    let mut ctx = Context::new(&FUNCTIONS).unwrap();
    let noop = ctx.function(&NOOP).unwrap();

    match noop.distribute(&mut ctx, Arguments::new()) {
        Err(DispatchError::Guard(GuardError::RecursiveDistribution)) => {}
        other => {
            eprintln!("dispatch on a node was not refused: {other:?}");
            return ExitCode::FAILURE;
        }
    }

    node::bootstrap_from_env(&FUNCTIONS).unwrap_or(ExitCode::FAILURE)
}

fn main() -> ExitCode {
    if is_node_invocation(env::args_os()) {
        return dispatch_before_bootstrap();
    }

    let exe = env::current_exe().unwrap();
    let status = Command::new(&exe)
        .arg(BOOTSTRAP_COMMAND)
        .arg("--root")
        .arg(&exe)
        .args(["--calls", "[]"])
        .status()
        .unwrap();

    assert!(status.success(), "node exited with {status}");
    println!("test early_dispatch_on_a_node_is_refused ... ok");

    ExitCode::SUCCESS
}
