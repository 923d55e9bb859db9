//! Execution of function calls on a node.
//!
//! Every binary using this crate calls `bootstrap_from_env` first thing in `main`. If the process
//! was started as a node (`<binary> __slurmify_execute ...`), the bootstrap takes over and
//! returns the exit code, otherwise the binary continues normally.

use crate::{
    call::FunctionCall,
    command::BOOTSTRAP_COMMAND,
    context::Context,
    dispatchers::{DirectCallDispatcher, DispatchError},
    guard::is_node_invocation,
    registry::{FunctionTable, RegistryError},
};
use clap::Parser;
use serde_json::Value;
use std::{env, fs, path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = BOOTSTRAP_COMMAND, about = "Execute distributed function calls on a node")]
pub struct BootstrapArgs {
    /// The entry point the calls were submitted from
    #[arg(long)]
    pub root: PathBuf,

    /// The function calls as JSON
    #[arg(long, conflicts_with = "fromfile")]
    pub calls: Option<String>,

    /// Read the function calls from this file, it is deleted afterwards
    #[arg(long)]
    pub fromfile: Option<PathBuf>,

    /// Print the ids of all functions as JSON list instead
    #[arg(long)]
    pub listfuncs: bool,
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("No function calls given, use --calls or --fromfile")]
    NoCalls,
    #[error("Expected a list of function calls, got {0}")]
    NotAList(Value),
    #[error("Failed to read the function calls from {0:?}")]
    ReadPayload(PathBuf, #[source] std::io::Error),
    #[error("Failed to decode the function calls")]
    Decode(#[from] serde_json::Error),
    #[error("Node setup failed: {0}")]
    Setup(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// What a node invocation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Listed(Vec<String>),
    Executed(usize),
}

/// Decode a JSON list of function calls
pub fn decode_calls(json: &str) -> Result<Vec<FunctionCall>, NodeError> {
    let value: Value = serde_json::from_str(json)?;

    if !value.is_array() {
        return Err(NodeError::NotAList(value));
    }

    Ok(serde_json::from_value(value)?)
}

fn read_calls(args: &BootstrapArgs) -> Result<Vec<FunctionCall>, NodeError> {
    match (&args.calls, &args.fromfile) {
        (Some(json), _) => decode_calls(json),
        (None, Some(path)) => {
            info!("Reading function calls from {path:?}");

            let json = fs::read_to_string(path);

            if let Err(error) = fs::remove_file(path) {
                warn!(error = ?error, "Failed to remove {path:?}: {error}");
            }

            decode_calls(&json.map_err(|error| NodeError::ReadPayload(path.clone(), error))?)
        }
        (None, None) => Err(NodeError::NoCalls),
    }
}

/// Execute a node invocation
#[instrument(skip(table), level = "info")]
pub fn execute(args: &BootstrapArgs, table: &FunctionTable) -> Result<Outcome, NodeError> {
    // first, so the payload file is gone whatever fails below
    let calls = read_calls(args);

    let mut ctx = Context::bare(DirectCallDispatcher);
    ctx.guards_mut().prevent_distribution();
    ctx.set_entry_point(&args.root)?;
    ctx.register_table(table)?;

    if args.listfuncs {
        return Ok(Outcome::Listed(ctx.registry().ids()));
    }

    let calls = calls?;

    for hook in table.node_setup {
        hook(&mut ctx).map_err(NodeError::Setup)?;
    }

    for call in &calls {
        info!("Executing {call}");
        ctx.call(call.func_id(), call.arguments())?;
    }

    Ok(Outcome::Executed(calls.len()))
}

/// Execute a node invocation and report the result on the console
pub fn run(args: &BootstrapArgs, table: &FunctionTable) -> ExitCode {
    match execute(args, table) {
        Ok(Outcome::Listed(ids)) => match serde_json::to_string(&ids) {
            Ok(listing) => {
                println!("{listing}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                error!(error = ?error, "Failed to list the functions: {error}");
                ExitCode::FAILURE
            }
        },
        Ok(Outcome::Executed(count)) => {
            info!("Executed {count} function calls");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, "Node execution failed: {error}");
            ExitCode::FAILURE
        }
    }
}

/// Run the node bootstrap if the process was started as a node.
/// Returns `None` for all other invocations.
pub fn bootstrap_from_env(table: &FunctionTable) -> Option<ExitCode> {
    if !is_node_invocation(env::args_os()) {
        return None;
    }

    let args = match BootstrapArgs::try_parse_from(env::args_os().skip(1)) {
        Ok(args) => args,
        Err(error) => {
            // prints the help for --help as well
            let _ = error.print();
            return Some(ExitCode::from(error.exit_code().clamp(0, 255) as u8));
        }
    };

    Some(run(&args, table))
}
