use clap::{Parser, Subcommand};
use slurmify::{check, node, Context};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Distribute function calls to slurm", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that function calls can be executed on the cluster
    Check {
        /// Partition to run the check on
        #[arg(long)]
        partition: Option<String>,
        /// Node constraint for the check
        #[arg(long)]
        constraint: Option<String>,
    },
    /// List the ids of all distributable functions of this binary
    List,
}

fn main() -> ExitCode {
    // logs go to stderr, stdout is reserved for the function listing of a node
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(code) = node::bootstrap_from_env(&check::FUNCTIONS) {
        return code;
    }

    match Cli::parse().command {
        Commands::Check {
            partition,
            constraint,
        } => match check::check_slurm(partition, constraint) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = ?err, "Check failed: {err}");
                ExitCode::FAILURE
            }
        },
        Commands::List => {
            let ctx = Context::new(&check::FUNCTIONS).unwrap_or_log();

            for id in ctx.registry().ids() {
                println!("{id}");
            }

            ExitCode::SUCCESS
        }
    }
}
